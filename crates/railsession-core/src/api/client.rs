//! API client for the ticketing service.
//!
//! This module provides the `ApiClient` struct, which implements
//! [`TicketService`] over reqwest and keeps the account's cookie jar.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use super::json::{lookup, lookup_i64, lookup_string};
use super::{ApiError, LoginResult, LoginSubmission, QrIssue, TicketService};
use crate::models::cookies::{RAIL_DEVICEID, RAIL_EXPIRATION};
use crate::models::{CookieJar, Passenger, PassengerListing, Profile};

// ============================================================================
// Constants
// ============================================================================

/// Default service host
pub const DEFAULT_BASE_URL: &str = "https://kyfw.12306.cn";

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// The service rejects requests without a desktop browser user agent.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/94.0.4606.61 Safari/537.36";

/// Marker the service embeds in HTML pages when it sheds load.
const BUSY_MARKER: &str = "系统忙，请稍后重试";

/// Application id every passport endpoint expects.
const APP_ID: &str = "otn";

const LOGIN_CHECK_PATH: &str = "/otn/login/conf";
const USER_INFO_PATH: &str = "/otn/modifyUser/initQueryUserInfoApi";
const PASSENGERS_PATH: &str = "/otn/confirmPassenger/getPassengerDTOs";
const CAPTCHA_IMAGE_PATH: &str =
    "/passport/captcha/captcha-image64?login_site=E&module=login&rand=sjrand";
const QR_CREATE_PATH: &str = "/passport/web/create-qr64";
const QR_CHECK_PATH: &str = "/passport/web/checkqr";
const LOGIN_PATH: &str = "/passport/web/login";
const USER_LOGIN_PATH: &str = "/otn/login/userLogin";
const UAMTK_PATH: &str = "/passport/web/auth/uamtk";
const UAMAUTHCLIENT_PATH: &str = "/otn/uamauthclient";

/// HTTP client for one account. Not shared between sessions: the cookie
/// jar belongs to exactly one user.
pub struct ApiClient {
    client: Client,
    base_url: String,
    jar: CookieJar,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            jar: CookieJar::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn absorb_cookies(&mut self, response: &Response) {
        for value in response.headers().get_all(header::SET_COOKIE) {
            if let Ok(value) = value.to_str() {
                self.jar.absorb_set_cookie(value);
            }
        }
    }

    /// Send a request built by `build`, attaching the cookie jar and retrying
    /// rate-limited responses with exponential backoff.
    async fn send<F>(&mut self, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder + Send,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = build(&self.client);
            if let Some(cookie) = self.jar.header_value() {
                request = request.header(header::COOKIE, cookie);
            }

            let response = request.send().await?;
            self.absorb_cookies(&response);

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                warn!(url = %response.url(), retry = retries, backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }
    }

    async fn send_text<F>(&mut self, build: F) -> Result<String, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder + Send,
    {
        let text = self.send(build).await?.text().await?;
        if text.contains(BUSY_MARKER) {
            return Err(ApiError::SystemBusy);
        }
        Ok(text)
    }

    /// Parse a JSON response, turning the service's `noLogin` flag into
    /// [`ApiError::SessionExpired`].
    async fn send_json<F>(&mut self, build: F) -> Result<Value, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder + Send,
    {
        let text = self.send_text(build).await?;
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("{}: {}", e, ApiError::truncate_body(&text)))
        })?;
        if lookup_string(&value, "data.noLogin").as_deref() == Some("true") {
            debug!("Response flagged the session as logged out");
            return Err(ApiError::SessionExpired);
        }
        Ok(value)
    }
}

/// Flatten the service's `messages` field (a string or a list of strings).
fn messages_of(value: &Value) -> Option<String> {
    match lookup(value, "messages")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => {
            let joined = items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; ");
            (!joined.is_empty()).then_some(joined)
        }
        _ => None,
    }
}

#[async_trait]
impl TicketService for ApiClient {
    fn cookies(&self) -> &CookieJar {
        &self.jar
    }

    fn cookies_mut(&mut self) -> &mut CookieJar {
        &mut self.jar
    }

    async fn check_login(&mut self) -> Result<bool, ApiError> {
        let url = self.url(LOGIN_CHECK_PATH);
        let value = self.send_json(|c| c.post(&url)).await?;
        Ok(lookup_string(&value, "data.is_login").as_deref() == Some("Y"))
    }

    async fn fetch_profile(&mut self) -> Result<Option<Profile>, ApiError> {
        let url = self.url(USER_INFO_PATH);
        let value = self.send_json(|c| c.post(&url)).await?;
        let Some(Value::Object(user)) = lookup(&value, "data.userDTO.loginUserDTO") else {
            return Ok(None);
        };
        let name = user.get("name").and_then(Value::as_str).map(str::to_string);
        let mut profile = Profile::from(user.clone());
        if let Some(name) = name {
            profile.set_display_name(name);
        }
        Ok(Some(profile))
    }

    async fn fetch_passengers(&mut self) -> Result<PassengerListing, ApiError> {
        let url = self.url(PASSENGERS_PATH);
        let form = [("_json_att", "")];
        let value = self.send_json(|c| c.post(&url).form(&form)).await?;

        let passengers = match lookup(&value, "data.normal_passengers") {
            Some(list @ Value::Array(_)) => serde_json::from_value::<Vec<Passenger>>(list.clone())
                .map_err(|e| ApiError::InvalidResponse(format!("passenger list: {}", e)))?,
            _ => Vec::new(),
        };

        Ok(PassengerListing {
            passengers,
            messages: messages_of(&value),
        })
    }

    async fn fetch_text(&mut self, url: &str) -> Result<String, ApiError> {
        let response = self.send(|c| c.get(url)).await?;
        Ok(response.text().await?)
    }

    async fn fetch_captcha_image(&mut self) -> Result<String, ApiError> {
        let url = self.url(CAPTCHA_IMAGE_PATH);
        let value = self.send_json(|c| c.get(&url)).await?;
        lookup_string(&value, "image")
            .ok_or_else(|| ApiError::InvalidResponse("captcha response without image".into()))
    }

    async fn issue_qr(&mut self) -> Result<QrIssue, ApiError> {
        let url = self.url(QR_CREATE_PATH);
        let form = [("appid", APP_ID)];
        let value = self.send_json(|c| c.post(&url).form(&form)).await?;

        if lookup_i64(&value, "result_code") != Some(0) {
            let message = lookup_string(&value, "result_message").unwrap_or_default();
            return Err(ApiError::InvalidResponse(format!("QR issue refused: {}", message)));
        }
        match (lookup_string(&value, "uuid"), lookup_string(&value, "image")) {
            (Some(uuid), Some(image)) => Ok(QrIssue { uuid, image }),
            _ => Err(ApiError::InvalidResponse("QR response without uuid or image".into())),
        }
    }

    async fn poll_qr(&mut self, uuid: &str) -> Result<Option<i64>, ApiError> {
        let url = self.url(QR_CHECK_PATH);
        let device_id = self.jar.get(RAIL_DEVICEID).unwrap_or_default().to_string();
        let expiration = self.jar.get(RAIL_EXPIRATION).unwrap_or_default().to_string();
        let form = [
            ("RAIL_DEVICEID", device_id.as_str()),
            ("RAIL_EXPIRATION", expiration.as_str()),
            ("uuid", uuid),
            ("appid", APP_ID),
        ];
        let value = self.send_json(|c| c.post(&url).form(&form)).await?;
        Ok(lookup_i64(&value, "result_code"))
    }

    async fn submit_login(&mut self, submission: &LoginSubmission) -> Result<LoginResult, ApiError> {
        let url = self.url(LOGIN_PATH);
        let value = match submission {
            LoginSubmission::Credentials {
                username,
                password,
                answer,
            } => {
                let form = [
                    ("username", username.as_str()),
                    ("password", password.as_str()),
                    ("appid", APP_ID),
                    ("answer", answer.as_str()),
                ];
                self.send_json(|c| c.post(&url).form(&form)).await?
            }
            LoginSubmission::Slide { query } => {
                let url = format!("{}?{}", url, query);
                self.send_json(|c| c.post(&url)).await?
            }
        };

        Ok(LoginResult {
            result_code: lookup_i64(&value, "result_code"),
            message: lookup_string(&value, "result_message")
                .or_else(|| lookup_string(&value, "message")),
        })
    }

    async fn open_login_page(&mut self) -> Result<(), ApiError> {
        let url = self.url(USER_LOGIN_PATH);
        self.send(|c| c.get(&url)).await?;
        Ok(())
    }

    async fn request_uamtk(&mut self) -> Result<Option<String>, ApiError> {
        let url = self.url(UAMTK_PATH);
        let referer = self.url("/otn/passport?redirect=/otn/login/userLogin");
        let origin = self.base_url.clone();
        let form = [("appid", APP_ID)];
        let value = self
            .send_json(|c| {
                c.post(&url)
                    .header(header::REFERER, &referer)
                    .header(header::ORIGIN, &origin)
                    .form(&form)
            })
            .await?;
        Ok(lookup_string(&value, "newapptk"))
    }

    async fn exchange_uamtk(&mut self, tk: &str) -> Result<Option<String>, ApiError> {
        let url = self.url(UAMAUTHCLIENT_PATH);
        let form = [("tk", tk)];
        let value = self.send_json(|c| c.post(&url).form(&form)).await?;
        Ok(lookup_string(&value, "username"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_joins_without_double_slash() {
        let client = ApiClient::new("https://example.test/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.url(LOGIN_CHECK_PATH), "https://example.test/otn/login/conf");
    }

    #[test]
    fn test_messages_of() {
        assert_eq!(messages_of(&json!({"messages": ["a", "b"]})).as_deref(), Some("a; b"));
        assert_eq!(messages_of(&json!({"messages": "busy"})).as_deref(), Some("busy"));
        assert_eq!(messages_of(&json!({"messages": []})), None);
        assert_eq!(messages_of(&json!({})), None);
    }

    #[test]
    fn test_new_client_starts_with_empty_jar() {
        let client = ApiClient::new(DEFAULT_BASE_URL, Duration::from_secs(5)).unwrap();
        assert!(client.cookies().is_empty());
    }
}
