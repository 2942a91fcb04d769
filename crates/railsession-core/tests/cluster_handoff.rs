//! Authority and follower cooperating through a shared directory store.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use railsession_core::api::{ApiError, LoginResult, LoginSubmission, QrIssue, TicketService};
use railsession_core::auth::{
    AccountCredentials, CaptchaSolver, FingerprintEndpoint, FingerprintSettings, LoginProtocol,
    LoginVariant,
};
use railsession_core::cache::LocalStore;
use railsession_core::cluster::{ClusterRole, CredentialStore, DirectoryStore};
use railsession_core::config::Config;
use railsession_core::models::{CookieJar, Passenger, PassengerListing, Profile};
use railsession_core::session::{ReadyState, SessionManager, SessionSettings};

/// A service that accepts every login.
#[derive(Default)]
struct AcceptingService {
    jar: CookieJar,
}

#[async_trait]
impl TicketService for AcceptingService {
    fn cookies(&self) -> &CookieJar {
        &self.jar
    }

    fn cookies_mut(&mut self) -> &mut CookieJar {
        &mut self.jar
    }

    async fn check_login(&mut self) -> Result<bool, ApiError> {
        Ok(self.jar.get("tk").is_some())
    }

    async fn fetch_profile(&mut self) -> Result<Option<Profile>, ApiError> {
        Ok(Some(Profile::with_display_name("Wang Wu")))
    }

    async fn fetch_passengers(&mut self) -> Result<PassengerListing, ApiError> {
        Ok(PassengerListing {
            passengers: vec![Passenger {
                code: "1".into(),
                passenger_name: "Wang Wu".into(),
                passenger_id_no: "110101198001011234".into(),
                passenger_id_type_code: "1".into(),
                mobile_no: String::new(),
                passenger_type: "1".into(),
                all_enc_str: "enc-wang".into(),
            }],
            messages: None,
        })
    }

    async fn fetch_text(&mut self, _url: &str) -> Result<String, ApiError> {
        Ok("callbackFunction('{\"exp\":\"9999999999999\",\"dfp\":\"dfp-int\"}')".into())
    }

    async fn fetch_captcha_image(&mut self) -> Result<String, ApiError> {
        Ok("aW1hZ2U=".into())
    }

    async fn issue_qr(&mut self) -> Result<QrIssue, ApiError> {
        Err(ApiError::InvalidResponse("QR login is not used here".into()))
    }

    async fn poll_qr(&mut self, _uuid: &str) -> Result<Option<i64>, ApiError> {
        Ok(None)
    }

    async fn submit_login(&mut self, _submission: &LoginSubmission) -> Result<LoginResult, ApiError> {
        Ok(LoginResult {
            result_code: Some(0),
            message: None,
        })
    }

    async fn open_login_page(&mut self) -> Result<(), ApiError> {
        Ok(())
    }

    async fn request_uamtk(&mut self) -> Result<Option<String>, ApiError> {
        self.jar.set("uamtk", "tk-int");
        Ok(Some("tk-int".into()))
    }

    async fn exchange_uamtk(&mut self, _tk: &str) -> Result<Option<String>, ApiError> {
        self.jar.set("tk", "session-int");
        Ok(Some("Wang Wu".into()))
    }
}

struct Answer;

#[async_trait]
impl CaptchaSolver for Answer {
    async fn solve(&self, _image_base64: &str) -> anyhow::Result<String> {
        Ok("37,46".into())
    }
}

fn protocol(dir: &Path) -> LoginProtocol {
    LoginProtocol::new(
        LoginVariant::Credentials,
        AccountCredentials {
            username: "wangwu".into(),
            password: "secret".into(),
            user_card: None,
        },
        FingerprintSettings {
            url: "https://fp.test/".into(),
            endpoint: FingerprintEndpoint::Direct,
            pinned: None,
        },
        dir.join("qrcode"),
        Default::default(),
        3,
    )
    .with_captcha_solver(Arc::new(Answer))
}

fn session(role: ClusterRole, store: &DirectoryStore, data_dir: &Path) -> SessionManager {
    SessionManager::new(
        "U1",
        role,
        Some(Arc::new(store.clone()) as Arc<dyn CredentialStore>),
        Box::new(AcceptingService::default()),
        protocol(data_dir),
        LocalStore::new(data_dir.to_path_buf()).unwrap(),
        SessionSettings {
            single_pass: true,
            ..SessionSettings::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn follower_adopts_what_the_authority_published() {
    let shared = TempDir::new().unwrap();
    let master_dir = TempDir::new().unwrap();
    let slave_dir = TempDir::new().unwrap();
    let store = DirectoryStore::new(shared.path());

    let mut master = session(ClusterRole::Authority, &store, master_dir.path());
    master.run().await;
    assert_eq!(master.ready_state(), ReadyState::Ready);
    assert!(shared.path().join("U1").join("cookie").exists());
    assert!(store.get_heartbeat("U1").await.unwrap() > 0);

    let mut slave = session(ClusterRole::Follower, &store, slave_dir.path());
    slave.run().await;
    assert_eq!(slave.ready_state(), ReadyState::Ready);
    assert_eq!(slave.cookies(), master.cookies());
    assert_eq!(slave.profile().display_name(), "Wang Wu");

    // Followers never write the store or a local cookie file
    let local = LocalStore::new(slave_dir.path().to_path_buf()).unwrap();
    assert!(!local.has_cookies("U1"));

    let records = slave.get_passengers(&["Wang Wu"]).await.unwrap();
    assert_eq!(records[0].enc_str, "enc-wang");
}

#[tokio::test]
async fn config_file_builds_a_follower() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    let config = serde_json::json!({
        "data_dir": dir.path().join("data"),
        "cluster": {
            "enabled": true,
            "role": "slave",
            "store_dir": dir.path().join("shared"),
        },
        "users": [{"key": "U1", "user_name": "wangwu", "type": "password"}],
        "captcha_service_url": "http://127.0.0.1:9/verify/base64/",
    });
    std::fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.role(), ClusterRole::Follower);

    let store: Arc<dyn CredentialStore> =
        Arc::new(DirectoryStore::new(config.cluster.store_dir.clone().unwrap()));
    let manager = SessionManager::from_config(&config, &config.users[0], Some(store)).unwrap();
    assert_eq!(manager.identity(), "U1");
    assert_eq!(manager.role(), ClusterRole::Follower);
    assert_eq!(manager.handle().ready_state(), ReadyState::NotReady);

    // Clustered roles refuse to start without a store
    assert!(SessionManager::from_config(&config, &config.users[0], None).is_err());
}
