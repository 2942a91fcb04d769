use async_trait::async_trait;

use super::ApiError;
use crate::models::{CookieJar, PassengerListing, Profile};

/// A freshly issued QR code.
#[derive(Debug, Clone)]
pub struct QrIssue {
    pub uuid: String,
    /// Base64-encoded PNG.
    pub image: String,
}

/// What the login endpoint receives.
#[derive(Debug, Clone)]
pub enum LoginSubmission {
    Credentials {
        username: String,
        password: String,
        answer: String,
    },
    /// Slide-captcha flow: the solver already produced the full query string.
    Slide { query: String },
}

/// Outcome reported by the login endpoint.
#[derive(Debug, Clone, Default)]
pub struct LoginResult {
    pub result_code: Option<i64>,
    pub message: Option<String>,
}

/// Endpoints of the ticketing service that session management needs.
///
/// Implementations own the account's cookie jar and update it from every
/// response. Methods take `&mut self`: one session drives one service
/// sequentially.
#[async_trait]
pub trait TicketService: Send + Sync {
    fn cookies(&self) -> &CookieJar;

    fn cookies_mut(&mut self) -> &mut CookieJar;

    /// Whether the service still considers these cookies logged in.
    async fn check_login(&mut self) -> Result<bool, ApiError>;

    /// Account attributes; `None` when the service returned no user.
    async fn fetch_profile(&mut self) -> Result<Option<Profile>, ApiError>;

    async fn fetch_passengers(&mut self) -> Result<PassengerListing, ApiError>;

    /// Raw body of an arbitrary URL (device-fingerprint endpoints).
    async fn fetch_text(&mut self, url: &str) -> Result<String, ApiError>;

    /// Base64 captcha image for the credential login flow.
    async fn fetch_captcha_image(&mut self) -> Result<String, ApiError>;

    async fn issue_qr(&mut self) -> Result<QrIssue, ApiError>;

    /// Raw QR status code; `None` when the response carried no usable code.
    async fn poll_qr(&mut self, uuid: &str) -> Result<Option<i64>, ApiError>;

    async fn submit_login(&mut self, submission: &LoginSubmission) -> Result<LoginResult, ApiError>;

    /// Visit the login landing page so the service sets its session cookies.
    async fn open_login_page(&mut self) -> Result<(), ApiError>;

    /// First step of the token exchange: a temporary authorization ticket.
    async fn request_uamtk(&mut self) -> Result<Option<String>, ApiError>;

    /// Second step: trade the ticket for the account's display name.
    async fn exchange_uamtk(&mut self, tk: &str) -> Result<Option<String>, ApiError>;
}
