use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::fingerprint::{FingerprintAcquirer, FingerprintSettings};
use super::solvers::{CaptchaSolver, LogPresenter, QrPresenter, SlideSolver};
use crate::api::{ApiError, LoginResult, LoginSubmission, TicketService};
use crate::models::CookieJar;
use crate::session::Liveness;
use crate::utils::{jitter, Clock, SleepInterval};

/// Login result code for success.
const RESULT_OK: i64 = 0;

/// Login result code for a wrong or missing username/password.
const RESULT_BAD_CREDENTIALS: i64 = 2;

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("Invalid username or password: {0}")]
    InvalidCredentials(String),

    #[error("Login rejected: {0}")]
    Rejected(String),

    #[error("Token exchange step '{step}' failed after {attempts} attempts")]
    TokenExchange { step: &'static str, attempts: u32 },

    #[error("Captcha solving failed: {0}")]
    Captcha(String),

    #[error("No {0} configured for this login variant")]
    MissingCollaborator(&'static str),

    #[error("Login cancelled")]
    Cancelled,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("QR image I/O failed: {0}")]
    Artifact(#[from] std::io::Error),
}

impl LoginError {
    /// Whether another attempt can possibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LoginError::InvalidCredentials(_)
                | LoginError::Cancelled
                | LoginError::MissingCollaborator(_)
        )
    }
}

/// Which login flow a user goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginVariant {
    #[default]
    Qr,
    #[serde(alias = "password")]
    Credentials,
    Slide,
}

impl fmt::Display for LoginVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoginVariant::Qr => "qr",
            LoginVariant::Credentials => "credentials",
            LoginVariant::Slide => "slide",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Default)]
pub struct AccountCredentials {
    pub username: String,
    pub password: String,
    pub user_card: Option<String>,
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("user_card", &self.user_card.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Cookies plus display name produced by one successful login.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialBundle {
    pub cookies: CookieJar,
    pub display_name: String,
}

/// Runs the configured login flow against a [`TicketService`].
pub struct LoginProtocol {
    variant: LoginVariant,
    account: AccountCredentials,
    pub(crate) fingerprint: FingerprintAcquirer,
    pub(crate) qr_dir: PathBuf,
    pub(crate) sleep: SleepInterval,
    max_retry: u32,
    pub(crate) clock: Clock,
    pub(crate) alive: Liveness,
    captcha: Option<Arc<dyn CaptchaSolver>>,
    slide: Option<Arc<dyn SlideSolver>>,
    pub(crate) presenter: Arc<dyn QrPresenter>,
}

impl LoginProtocol {
    pub fn new(
        variant: LoginVariant,
        account: AccountCredentials,
        fingerprint: FingerprintSettings,
        qr_dir: PathBuf,
        sleep: SleepInterval,
        max_retry: u32,
    ) -> Self {
        Self {
            variant,
            account,
            fingerprint: FingerprintAcquirer::new(fingerprint),
            qr_dir,
            sleep,
            max_retry: max_retry.max(1),
            clock: Clock::new(),
            alive: Liveness::new(),
            captcha: None,
            slide: None,
            presenter: Arc::new(LogPresenter),
        }
    }

    pub fn with_captcha_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.captcha = Some(solver);
        self
    }

    pub fn with_slide_solver(mut self, solver: Arc<dyn SlideSolver>) -> Self {
        self.slide = Some(solver);
        self
    }

    pub fn with_presenter(mut self, presenter: Arc<dyn QrPresenter>) -> Self {
        self.presenter = presenter;
        self
    }

    /// Share the owning session's liveness flag so `destroy()` interrupts
    /// otherwise unbounded retry loops.
    pub(crate) fn bind_liveness(&mut self, alive: Liveness) {
        self.fingerprint.bind_liveness(alive.clone());
        self.alive = alive;
    }

    pub fn variant(&self) -> LoginVariant {
        self.variant
    }

    pub(crate) fn check_alive(&self) -> Result<(), LoginError> {
        if self.alive.is_alive() {
            Ok(())
        } else {
            Err(LoginError::Cancelled)
        }
    }

    /// Run one full login. The caller decides whether to retry on error.
    pub async fn login(
        &self,
        service: &mut dyn TicketService,
    ) -> Result<CredentialBundle, LoginError> {
        self.check_alive()?;
        match self.variant {
            LoginVariant::Qr => self.qr_login(service).await,
            LoginVariant::Credentials => self.credential_login(service).await,
            LoginVariant::Slide => self.slide_login(service).await,
        }
    }

    async fn credential_login(
        &self,
        service: &mut dyn TicketService,
    ) -> Result<CredentialBundle, LoginError> {
        let solver = self
            .captcha
            .as_ref()
            .ok_or(LoginError::MissingCollaborator("captcha solver"))?;

        let image = service.fetch_captcha_image().await?;
        let answer = solver
            .solve(&image)
            .await
            .map_err(|e| LoginError::Captcha(e.to_string()))?;
        debug!(user = %self.account.username, "Captcha solved");

        self.fingerprint.ensure(service, false).await?;

        let submission = LoginSubmission::Credentials {
            username: self.account.username.clone(),
            password: self.account.password.clone(),
            answer,
        };
        let result = service.submit_login(&submission).await?;
        self.finish_submission(service, result).await
    }

    async fn slide_login(
        &self,
        service: &mut dyn TicketService,
    ) -> Result<CredentialBundle, LoginError> {
        let solver = self
            .slide
            .as_ref()
            .ok_or(LoginError::MissingCollaborator("slide solver"))?;

        let ticket = loop {
            self.check_alive()?;
            match solver.solve(service.cookies(), &self.account).await {
                Ok(Some(ticket)) if !ticket.is_empty() => break ticket,
                Ok(_) => debug!(user = %self.account.username, "Slide solver returned nothing yet"),
                Err(e) => warn!(user = %self.account.username, error = %e, "Slide solver failed"),
            }
            tokio::time::sleep(jitter(self.sleep)).await;
        };

        service.cookies_mut().merge(ticket.cookies);
        let result = service
            .submit_login(&LoginSubmission::Slide {
                query: ticket.query,
            })
            .await?;
        self.finish_submission(service, result).await
    }

    /// Interpret the login endpoint's verdict; on success run the token
    /// exchange.
    async fn finish_submission(
        &self,
        service: &mut dyn TicketService,
        result: LoginResult,
    ) -> Result<CredentialBundle, LoginError> {
        let message = result
            .message
            .unwrap_or_else(|| "empty response".to_string());
        match result.result_code {
            Some(RESULT_OK) => {
                let display_name = self.exchange_tokens(service).await?;
                Ok(CredentialBundle {
                    cookies: service.cookies().clone(),
                    display_name,
                })
            }
            Some(RESULT_BAD_CREDENTIALS) => {
                error!(user = %self.account.username, %message, "Login refused: bad credentials");
                Err(LoginError::InvalidCredentials(message))
            }
            code => {
                warn!(user = %self.account.username, ?code, %message, "Login failed");
                Err(LoginError::Rejected(message))
            }
        }
    }

    /// Resolve the temporary ticket, then trade it for the display name.
    /// Each step gets `max_retry` attempts.
    pub(crate) async fn exchange_tokens(
        &self,
        service: &mut dyn TicketService,
    ) -> Result<String, LoginError> {
        let mut ticket = None;
        for attempt in 1..=self.max_retry {
            match service.request_uamtk().await {
                Ok(Some(tk)) => {
                    ticket = Some(tk);
                    break;
                }
                Ok(None) => debug!(attempt, "No ticket in uamtk response"),
                Err(e) => warn!(attempt, error = %e, "uamtk request failed"),
            }
        }
        let ticket = ticket.ok_or(LoginError::TokenExchange {
            step: "uamtk",
            attempts: self.max_retry,
        })?;

        for attempt in 1..=self.max_retry {
            match service.exchange_uamtk(&ticket).await {
                Ok(Some(name)) => {
                    info!(user = %name, "Token exchange complete");
                    return Ok(name);
                }
                Ok(None) => debug!(attempt, "No username in uamauthclient response"),
                Err(e) => warn!(attempt, error = %e, "uamauthclient request failed"),
            }
        }
        Err(LoginError::TokenExchange {
            step: "uamauthclient",
            attempts: self.max_retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_protocol, FixedCaptcha, ScriptedService, ScriptedSlide};

    fn credential_protocol(dir: &std::path::Path) -> LoginProtocol {
        test_protocol(LoginVariant::Credentials, dir).with_captcha_solver(Arc::new(FixedCaptcha))
    }

    #[tokio::test]
    async fn test_credential_login_success() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut service = ScriptedService::new();

        let bundle = credential_protocol(dir.path())
            .login(&mut service)
            .await
            .unwrap();

        assert_eq!(bundle.display_name, "Zhang San");
        assert_eq!(bundle.cookies.get("uamtk"), Some("tk-1"));
        let calls = service.calls();
        assert_eq!(calls.submit_login, 1);
        assert_eq!(calls.request_uamtk, 1);
        assert_eq!(calls.exchange_uamtk, 1);
        assert!(matches!(
            calls.submissions.first(),
            Some(LoginSubmission::Credentials { answer, .. }) if answer == "37,46"
        ));
    }

    #[tokio::test]
    async fn test_bad_credentials_submit_once_and_stop() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut service = ScriptedService::new();
        service.script().login_results.push_back(Ok(LoginResult {
            result_code: Some(2),
            message: Some("密码输入错误".into()),
        }));

        let err = credential_protocol(dir.path())
            .login(&mut service)
            .await
            .unwrap_err();

        assert!(matches!(err, LoginError::InvalidCredentials(ref m) if m == "密码输入错误"));
        assert!(!err.is_retryable());
        assert_eq!(service.calls().submit_login, 1);
        assert_eq!(service.calls().request_uamtk, 0);
    }

    #[tokio::test]
    async fn test_other_result_codes_are_retryable_rejections() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut service = ScriptedService::new();
        service.script().login_results.push_back(Ok(LoginResult {
            result_code: Some(5),
            message: None,
        }));

        let err = credential_protocol(dir.path())
            .login(&mut service)
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::Rejected(ref m) if m == "empty response"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_captcha_solver() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut service = ScriptedService::new();
        let err = test_protocol(LoginVariant::Credentials, dir.path())
            .login(&mut service)
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::MissingCollaborator(_)));
        assert_eq!(service.calls().submit_login, 0);
    }

    #[tokio::test]
    async fn test_token_exchange_gives_up_after_ceiling() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut service = ScriptedService::new();
        for _ in 0..3 {
            service.script().uamtk.push_back(Ok(None));
        }

        let err = credential_protocol(dir.path())
            .login(&mut service)
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::TokenExchange { step: "uamtk", attempts: 3 }));
        assert_eq!(service.calls().request_uamtk, 3);
        assert_eq!(service.calls().exchange_uamtk, 0);
    }

    #[tokio::test]
    async fn test_token_exchange_recovers_within_ceiling() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut service = ScriptedService::new();
        service
            .script()
            .uamtk
            .push_back(Err(ApiError::ServerError("503".into())));
        service.script().usernames.push_back(Ok(None));

        let bundle = credential_protocol(dir.path())
            .login(&mut service)
            .await
            .unwrap();
        assert_eq!(bundle.display_name, "Zhang San");
        assert_eq!(service.calls().request_uamtk, 2);
        assert_eq!(service.calls().exchange_uamtk, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slide_login_waits_for_ticket_and_merges_cookies() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut service = ScriptedService::new();
        let solver = Arc::new(ScriptedSlide::new(2));

        let bundle = test_protocol(LoginVariant::Slide, dir.path())
            .with_slide_solver(solver.clone())
            .login(&mut service)
            .await
            .unwrap();

        assert_eq!(solver.calls(), 3);
        assert_eq!(bundle.cookies.get("slide_token"), Some("s-1"));
        assert!(matches!(
            service.calls().submissions.first(),
            Some(LoginSubmission::Slide { query }) if query == "nc_token=abc&sig=def"
        ));
    }

    #[test]
    fn test_variant_names() {
        let v: LoginVariant = serde_json::from_str("\"password\"").unwrap();
        assert_eq!(v, LoginVariant::Credentials);
        assert_eq!(LoginVariant::Slide.to_string(), "slide");
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let account = AccountCredentials {
            username: "alice".into(),
            password: "hunter2".into(),
            user_card: Some("110101".into()),
        };
        let shown = format!("{:?}", account);
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("110101"));
    }
}
