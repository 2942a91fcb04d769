//! QR-code login: issue a code, show it, poll until the phone confirms.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, info, warn};

use super::login::{CredentialBundle, LoginError, LoginProtocol};
use crate::api::{ApiError, TicketService};
use crate::utils::jitter;

/// A code that has not been confirmed within this many seconds is replaced,
/// whatever the service last reported for it.
pub const QR_WATCHDOG_SECS: i64 = 300;

/// Force a fresh device fingerprint on every 20th failed QR request.
const FINGERPRINT_RENEW_EVERY: u32 = 20;

/// Status reported by the QR poll endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrStatus {
    Pending,
    /// Scanned on the phone, waiting for the user to approve.
    Scanned,
    Confirmed,
    Expired,
    /// Missing or unrecognised code; treated as a transient failure.
    Unknown,
}

impl QrStatus {
    pub fn from_code(code: Option<i64>) -> Self {
        match code {
            Some(0) => QrStatus::Pending,
            Some(1) => QrStatus::Scanned,
            Some(2) => QrStatus::Confirmed,
            Some(3) => QrStatus::Expired,
            _ => QrStatus::Unknown,
        }
    }
}

/// One issued QR code and the image saved for it.
#[derive(Debug)]
pub struct LoginAttempt {
    pub uuid: String,
    pub artifact: PathBuf,
    pub started_at: i64,
}

impl LoginAttempt {
    /// Delete the image. Failures are logged, never fatal.
    pub async fn discard(self) {
        match tokio::fs::remove_file(&self.artifact).await {
            Ok(()) => debug!(path = %self.artifact.display(), "Removed QR image"),
            Err(e) => warn!(path = %self.artifact.display(), error = %e, "Could not delete QR image"),
        }
    }
}

impl LoginProtocol {
    pub(crate) async fn qr_login(
        &self,
        service: &mut dyn TicketService,
    ) -> Result<CredentialBundle, LoginError> {
        self.fingerprint.ensure(service, false).await?;
        let mut attempt = self.issue_qr(service).await?;

        loop {
            if let Err(e) = self.check_alive() {
                attempt.discard().await;
                return Err(e);
            }

            let code = match service.poll_qr(&attempt.uuid).await {
                Ok(code) => code,
                Err(e) => {
                    debug!(error = %e, "QR poll failed");
                    None
                }
            };

            match QrStatus::from_code(code) {
                QrStatus::Confirmed => break,
                QrStatus::Expired => {
                    info!("QR code expired, requesting a new one");
                    attempt.discard().await;
                    attempt = self.issue_qr(service).await?;
                    continue;
                }
                QrStatus::Scanned => info!("QR code scanned, please confirm the login on your phone"),
                QrStatus::Pending | QrStatus::Unknown => {}
            }

            if self.clock.now_secs() - attempt.started_at > QR_WATCHDOG_SECS {
                warn!(uuid = %attempt.uuid, "QR code unconfirmed for {}s, replacing it", QR_WATCHDOG_SECS);
                attempt.discard().await;
                attempt = self.issue_qr(service).await?;
                continue;
            }

            tokio::time::sleep(jitter(self.sleep)).await;
        }

        attempt.discard().await;

        service.open_login_page().await?;
        let display_name = self.exchange_tokens(service).await?;
        service.open_login_page().await?;

        Ok(CredentialBundle {
            cookies: service.cookies().clone(),
            display_name,
        })
    }

    /// Request, save and present a QR code, retrying until one arrives.
    async fn issue_qr(&self, service: &mut dyn TicketService) -> Result<LoginAttempt, LoginError> {
        let mut failures: u32 = 0;
        loop {
            self.check_alive()?;
            info!("Downloading login QR code");
            match self.download_qr(service).await {
                Ok(attempt) => {
                    info!(path = %attempt.artifact.display(), "QR code ready, scan it with the mobile app");
                    return Ok(attempt);
                }
                Err(e) => {
                    let wait = jitter(self.sleep);
                    warn!(error = %e, wait_secs = wait.as_secs_f64(), "Failed to get QR code, retrying");
                    tokio::time::sleep(wait).await;
                    self.fingerprint
                        .ensure(service, failures % FINGERPRINT_RENEW_EVERY == 0)
                        .await?;
                    failures += 1;
                }
            }
        }
    }

    async fn download_qr(&self, service: &mut dyn TicketService) -> Result<LoginAttempt, LoginError> {
        let issue = service.issue_qr().await?;
        let image = STANDARD
            .decode(issue.image.trim())
            .map_err(|e| ApiError::InvalidResponse(format!("QR image is not base64: {}", e)))?;

        tokio::fs::create_dir_all(&self.qr_dir).await?;
        let path = self.qr_dir.join(format!("{}.png", self.clock.now_millis()));
        tokio::fs::write(&path, image).await?;

        if let Err(e) = self.presenter.present(&path).await {
            warn!(path = %path.display(), error = %e, "Could not present QR code");
        }

        Ok(LoginAttempt {
            uuid: issue.uuid,
            artifact: path,
            started_at: self.clock.now_secs(),
        })
    }
}
