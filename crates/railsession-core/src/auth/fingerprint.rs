//! Anti-bot device fingerprint (`RAIL_DEVICEID` / `RAIL_EXPIRATION` cookies).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::LoginError;
use crate::api::{ApiError, TicketService};
use crate::models::cookies::{RAIL_DEVICEID, RAIL_EXPIRATION};
use crate::models::CookieJar;
use crate::session::Liveness;
use crate::utils::Clock;

/// Default fingerprint service; answers with a base64 URL to follow.
pub const DEFAULT_FINGERPRINT_URL: &str = "https://12306-rail-id-v2.pjialin.com/";

/// Envelope the fingerprint script wraps its JSON in.
const CALLBACK_PREFIX: &str = "callbackFunction(";

/// How the fingerprint endpoint answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintEndpoint {
    /// Body is the fingerprint itself, wrapped in `callbackFunction('...')`.
    Direct,
    /// Body is `{"id": base64(url)}`; the decoded URL yields the fingerprint.
    #[default]
    Indirect,
}

/// Fixed fingerprint pair used instead of the observed one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinnedFingerprint {
    pub expiration: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintSettings {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub endpoint: FingerprintEndpoint,
    /// Cache mode: still fetch, but install this pair.
    #[serde(default)]
    pub pinned: Option<PinnedFingerprint>,
}

fn default_url() -> String {
    DEFAULT_FINGERPRINT_URL.to_string()
}

impl Default for FingerprintSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            endpoint: FingerprintEndpoint::default(),
            pinned: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Fingerprint {
    pub expiration: String,
    pub device_id: String,
}

#[derive(Deserialize)]
struct Payload {
    exp: Value,
    dfp: String,
}

#[derive(Deserialize)]
struct Redirect {
    id: String,
}

/// Strip the `callbackFunction('...')` envelope when present.
pub(crate) fn strip_callback(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.find(CALLBACK_PREFIX) {
        Some(start) => trimmed[start + CALLBACK_PREFIX.len()..]
            .trim_end()
            .trim_end_matches(';')
            .trim_end_matches(')')
            .trim_matches('\''),
        None => trimmed,
    }
}

pub(crate) fn parse_payload(text: &str) -> Result<Fingerprint, ApiError> {
    let payload: Payload = serde_json::from_str(strip_callback(text))
        .map_err(|e| ApiError::InvalidResponse(format!("fingerprint payload: {}", e)))?;
    let expiration = match payload.exp {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        other => {
            return Err(ApiError::InvalidResponse(format!(
                "fingerprint expiry is not a timestamp: {}",
                other
            )))
        }
    };
    if payload.dfp.is_empty() {
        return Err(ApiError::InvalidResponse("empty device fingerprint".into()));
    }
    Ok(Fingerprint {
        expiration,
        device_id: payload.dfp,
    })
}

pub struct FingerprintAcquirer {
    settings: FingerprintSettings,
    clock: Clock,
    alive: Liveness,
}

impl FingerprintAcquirer {
    pub fn new(settings: FingerprintSettings) -> Self {
        Self {
            settings,
            clock: Clock::new(),
            alive: Liveness::new(),
        }
    }

    pub(crate) fn bind_liveness(&mut self, alive: Liveness) {
        self.alive = alive;
    }

    /// Whether the jar carries a fingerprint that has not expired yet.
    pub fn is_current(&self, jar: &CookieJar) -> bool {
        jar.get(RAIL_EXPIRATION)
            .and_then(|exp| exp.trim().parse::<i64>().ok())
            .map(|exp| exp > self.clock.now_millis())
            .unwrap_or(false)
    }

    /// Make sure the service's jar has a usable fingerprint.
    ///
    /// Failed or malformed responses are retried immediately and without
    /// bound; only destroying the session stops the loop.
    pub async fn ensure(
        &self,
        service: &mut dyn TicketService,
        force_renew: bool,
    ) -> Result<(), LoginError> {
        if !force_renew && self.is_current(service.cookies()) {
            return Ok(());
        }

        let mut attempts: u64 = 0;
        loop {
            if !self.alive.is_alive() {
                return Err(LoginError::Cancelled);
            }
            attempts += 1;
            match self.acquire(service).await {
                Ok(fingerprint) => {
                    let installed = match &self.settings.pinned {
                        Some(pinned) => Fingerprint {
                            expiration: pinned.expiration.clone(),
                            device_id: pinned.device_id.clone(),
                        },
                        None => fingerprint,
                    };
                    let jar = service.cookies_mut();
                    jar.set(RAIL_EXPIRATION, installed.expiration);
                    jar.set(RAIL_DEVICEID, installed.device_id);
                    debug!(attempts, pinned = self.settings.pinned.is_some(), "Device fingerprint installed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Device fingerprint request failed, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn acquire(&self, service: &mut dyn TicketService) -> Result<Fingerprint, ApiError> {
        let body = service.fetch_text(&self.settings.url).await?;
        match self.settings.endpoint {
            FingerprintEndpoint::Direct => parse_payload(&body),
            FingerprintEndpoint::Indirect => {
                let redirect: Redirect = serde_json::from_str(&body)
                    .map_err(|e| ApiError::InvalidResponse(format!("fingerprint redirect: {}", e)))?;
                let url = STANDARD
                    .decode(redirect.id.trim())
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .ok_or_else(|| ApiError::InvalidResponse("fingerprint redirect is not base64 text".into()))?;
                let script = service.fetch_text(&url).await?;
                parse_payload(&script)
            }
        }
    }
}
