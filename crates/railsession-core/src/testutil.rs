//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::api::{ApiError, LoginResult, LoginSubmission, QrIssue, TicketService};
use crate::auth::{
    AccountCredentials, CaptchaSolver, FingerprintEndpoint, FingerprintSettings, LoginProtocol,
    LoginVariant, QrPresenter, SlideSolver, SlideTicket,
};
use crate::models::{CookieJar, Passenger, PassengerListing, Profile};
use crate::utils::SleepInterval;

pub const WRAPPED_FINGERPRINT: &str =
    "callbackFunction('{\"exp\":\"9999999999999\",\"dfp\":\"dfp-abc\"}')";

pub const DISPLAY_NAME: &str = "Zhang San";

pub fn roster() -> Vec<Passenger> {
    vec![
        Passenger {
            code: "1".into(),
            passenger_name: "Zhang San".into(),
            passenger_id_no: "110101199001011234".into(),
            passenger_id_type_code: "1".into(),
            mobile_no: "13800000000".into(),
            passenger_type: "1".into(),
            all_enc_str: "enc-1".into(),
        },
        Passenger {
            code: "2".into(),
            passenger_name: "Li Si".into(),
            passenger_id_no: "110101201001015678".into(),
            passenger_id_type_code: "1".into(),
            mobile_no: String::new(),
            passenger_type: "3".into(),
            all_enc_str: "enc-2".into(),
        },
    ]
}

/// Queued responses. Each queue falls back to a successful default once
/// drained.
pub struct Script {
    pub login_checks: VecDeque<Result<bool, ApiError>>,
    pub profiles: VecDeque<Result<Option<Profile>, ApiError>>,
    pub passenger_lists: VecDeque<Result<PassengerListing, ApiError>>,
    pub texts: VecDeque<Result<String, ApiError>>,
    pub qr_issues: VecDeque<Result<QrIssue, ApiError>>,
    pub qr_polls: VecDeque<Option<i64>>,
    /// Poll answer once `qr_polls` is empty
    pub default_poll: Option<i64>,
    /// Report "confirmed" once this many codes have been issued
    pub confirm_after_issues: Option<usize>,
    pub login_results: VecDeque<Result<LoginResult, ApiError>>,
    pub uamtk: VecDeque<Result<Option<String>, ApiError>>,
    pub usernames: VecDeque<Result<Option<String>, ApiError>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            login_checks: VecDeque::new(),
            profiles: VecDeque::new(),
            passenger_lists: VecDeque::new(),
            texts: VecDeque::new(),
            qr_issues: VecDeque::new(),
            qr_polls: VecDeque::new(),
            default_poll: Some(2),
            confirm_after_issues: None,
            login_results: VecDeque::new(),
            uamtk: VecDeque::new(),
            usernames: VecDeque::new(),
        }
    }
}

/// Call counters, snapshotted by [`ScriptedService::calls`].
#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub check_login: usize,
    pub fetch_profile: usize,
    pub fetch_passengers: usize,
    pub fetched_urls: Vec<String>,
    pub fetch_captcha_image: usize,
    pub issue_qr: usize,
    pub poll_qr: usize,
    pub submit_login: usize,
    pub submissions: Vec<LoginSubmission>,
    pub open_login_page: usize,
    pub request_uamtk: usize,
    pub exchange_uamtk: usize,
}

impl Calls {
    /// Calls that re-validate an existing login.
    pub fn validation_calls(&self) -> usize {
        self.check_login + self.fetch_profile + self.fetch_passengers
    }
}

/// In-memory [`TicketService`]. Clones share the script and the counters
/// but keep their own cookie jar.
#[derive(Clone, Default)]
pub struct ScriptedService {
    jar: CookieJar,
    script: Arc<Mutex<Script>>,
    calls: Arc<Mutex<Calls>>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, f: impl FnOnce(&mut Calls)) {
        f(&mut self.calls.lock().unwrap());
    }
}

#[async_trait]
impl TicketService for ScriptedService {
    fn cookies(&self) -> &CookieJar {
        &self.jar
    }

    fn cookies_mut(&mut self) -> &mut CookieJar {
        &mut self.jar
    }

    async fn check_login(&mut self) -> Result<bool, ApiError> {
        self.record(|c| c.check_login += 1);
        self.script().login_checks.pop_front().unwrap_or(Ok(true))
    }

    async fn fetch_profile(&mut self) -> Result<Option<Profile>, ApiError> {
        self.record(|c| c.fetch_profile += 1);
        self.script()
            .profiles
            .pop_front()
            .unwrap_or_else(|| Ok(Some(Profile::with_display_name(DISPLAY_NAME))))
    }

    async fn fetch_passengers(&mut self) -> Result<PassengerListing, ApiError> {
        self.record(|c| c.fetch_passengers += 1);
        self.script().passenger_lists.pop_front().unwrap_or_else(|| {
            Ok(PassengerListing {
                passengers: roster(),
                messages: None,
            })
        })
    }

    async fn fetch_text(&mut self, url: &str) -> Result<String, ApiError> {
        self.record(|c| c.fetched_urls.push(url.to_string()));
        self.script()
            .texts
            .pop_front()
            .unwrap_or_else(|| Ok(WRAPPED_FINGERPRINT.to_string()))
    }

    async fn fetch_captcha_image(&mut self) -> Result<String, ApiError> {
        self.record(|c| c.fetch_captcha_image += 1);
        Ok(STANDARD.encode(b"captcha"))
    }

    async fn issue_qr(&mut self) -> Result<QrIssue, ApiError> {
        self.record(|c| c.issue_qr += 1);
        let n = self.calls.lock().unwrap().issue_qr;
        self.script().qr_issues.pop_front().unwrap_or_else(|| {
            Ok(QrIssue {
                uuid: format!("uuid-{}", n),
                image: STANDARD.encode(b"\x89PNG fake image"),
            })
        })
    }

    async fn poll_qr(&mut self, _uuid: &str) -> Result<Option<i64>, ApiError> {
        self.record(|c| c.poll_qr += 1);
        let issued = self.calls.lock().unwrap().issue_qr;
        let mut script = self.script();
        if let Some(code) = script.qr_polls.pop_front() {
            return Ok(code);
        }
        match script.confirm_after_issues {
            Some(n) if issued >= n => Ok(Some(2)),
            _ => Ok(script.default_poll),
        }
    }

    async fn submit_login(&mut self, submission: &LoginSubmission) -> Result<LoginResult, ApiError> {
        self.record(|c| {
            c.submit_login += 1;
            c.submissions.push(submission.clone());
        });
        self.script().login_results.pop_front().unwrap_or(Ok(LoginResult {
            result_code: Some(0),
            message: None,
        }))
    }

    async fn open_login_page(&mut self) -> Result<(), ApiError> {
        self.record(|c| c.open_login_page += 1);
        Ok(())
    }

    async fn request_uamtk(&mut self) -> Result<Option<String>, ApiError> {
        self.record(|c| c.request_uamtk += 1);
        let result = self
            .script()
            .uamtk
            .pop_front()
            .unwrap_or_else(|| Ok(Some("tk-1".to_string())));
        if let Ok(Some(tk)) = &result {
            self.jar.set("uamtk", tk.clone());
        }
        result
    }

    async fn exchange_uamtk(&mut self, _tk: &str) -> Result<Option<String>, ApiError> {
        self.record(|c| c.exchange_uamtk += 1);
        self.script()
            .usernames
            .pop_front()
            .unwrap_or_else(|| Ok(Some(DISPLAY_NAME.to_string())))
    }
}

pub struct FixedCaptcha;

#[async_trait]
impl CaptchaSolver for FixedCaptcha {
    async fn solve(&self, _image_base64: &str) -> Result<String> {
        Ok("37,46".to_string())
    }
}

/// Answers "not yet" a fixed number of times, then hands out a ticket.
pub struct ScriptedSlide {
    empty_answers: usize,
    calls: AtomicUsize,
}

impl ScriptedSlide {
    pub fn new(empty_answers: usize) -> Self {
        Self {
            empty_answers,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SlideSolver for ScriptedSlide {
    async fn solve(
        &self,
        _cookies: &CookieJar,
        _account: &AccountCredentials,
    ) -> Result<Option<SlideTicket>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.empty_answers {
            return Ok(None);
        }
        Ok(Some(SlideTicket {
            cookies: vec![("slide_token".to_string(), "s-1".to_string())],
            query: "nc_token=abc&sig=def".to_string(),
        }))
    }
}

#[derive(Default)]
pub struct RecordingPresenter {
    paths: Mutex<Vec<PathBuf>>,
}

impl RecordingPresenter {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl QrPresenter for RecordingPresenter {
    async fn present(&self, path: &Path) -> Result<()> {
        self.paths.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

pub fn test_protocol(variant: LoginVariant, dir: &Path) -> LoginProtocol {
    LoginProtocol::new(
        variant,
        AccountCredentials {
            username: "alice".into(),
            password: "secret".into(),
            user_card: None,
        },
        FingerprintSettings {
            url: "https://fp.test/".into(),
            endpoint: FingerprintEndpoint::Direct,
            pinned: None,
        },
        dir.join("qrcode"),
        SleepInterval::default(),
        3,
    )
}
