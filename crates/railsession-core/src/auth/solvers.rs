//! External services a login leans on: captcha solving, slide-captcha
//! automation and showing QR codes to a human.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::info;

use super::AccountCredentials;
use crate::models::CookieJar;

/// Side length of one tile in the 4x2 captcha grid, in pixels.
const CAPTCHA_TILE_PX: i64 = 75;

/// Solver requests are slower than service calls.
const SOLVER_TIMEOUT_SECS: u64 = 60;

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Answer for a base64 captcha image, in the form the login endpoint
    /// expects (`x1,y1,x2,y2,...`).
    async fn solve(&self, image_base64: &str) -> Result<String>;
}

/// Cookies and query string produced by a slide-captcha run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SlideTicket {
    #[serde(default)]
    pub cookies: Vec<(String, String)>,
    #[serde(default)]
    pub query: String,
}

impl SlideTicket {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() || self.query.is_empty()
    }
}

#[async_trait]
pub trait SlideSolver: Send + Sync {
    /// `Ok(None)` means "not yet"; the caller keeps asking.
    async fn solve(
        &self,
        cookies: &CookieJar,
        account: &AccountCredentials,
    ) -> Result<Option<SlideTicket>>;
}

#[async_trait]
pub trait QrPresenter: Send + Sync {
    /// Make the saved QR image reachable by whoever has to scan it.
    async fn present(&self, path: &Path) -> Result<()>;
}

/// Presenter that only logs where the image was saved.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPresenter;

#[async_trait]
impl QrPresenter for LogPresenter {
    async fn present(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "New login QR code, open and scan it with the mobile app");
        Ok(())
    }
}

/// Convert 1-based captcha tile indices into click coordinates near each
/// tile's centre.
pub fn tile_positions(tiles: &[u8]) -> Vec<i64> {
    let mut rng = rand::thread_rng();
    let mut positions = Vec::with_capacity(tiles.len() * 2);
    for &tile in tiles {
        let tile = i64::from(tile.max(1));
        let column = (tile - 1) % 4 + 1;
        let row = (tile + 3) / 4;
        positions.push(CAPTCHA_TILE_PX * column - CAPTCHA_TILE_PX / 2 + rng.gen_range(-5..=5));
        positions.push(CAPTCHA_TILE_PX * row - CAPTCHA_TILE_PX / 2 + rng.gen_range(-5..=5));
    }
    positions
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    result: Vec<u8>,
}

/// Captcha solver backed by an HTTP OCR service that answers with the
/// indices of the matching tiles.
pub struct HttpCaptchaSolver {
    client: reqwest::Client,
    url: String,
}

impl HttpCaptchaSolver {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SOLVER_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CaptchaSolver for HttpCaptchaSolver {
    async fn solve(&self, image_base64: &str) -> Result<String> {
        let response: OcrResponse = self
            .client
            .post(&self.url)
            .form(&[("img", image_base64)])
            .send()
            .await
            .context("Failed to reach captcha service")?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse captcha service response")?;

        if response.msg != "success" || response.result.is_empty() {
            bail!("captcha service could not solve the image: {}", response.msg);
        }
        Ok(tile_positions(&response.result)
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(","))
    }
}

#[derive(Deserialize)]
struct SlideCookie {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct SlideResponse {
    #[serde(default)]
    cookies: Vec<SlideCookie>,
    #[serde(default)]
    query: String,
}

/// Slide solver backed by a browser-automation helper service.
pub struct HttpSlideSolver {
    client: reqwest::Client,
    url: String,
}

impl HttpSlideSolver {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SOLVER_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SlideSolver for HttpSlideSolver {
    async fn solve(
        &self,
        cookies: &CookieJar,
        account: &AccountCredentials,
    ) -> Result<Option<SlideTicket>> {
        let body = serde_json::json!({
            "username": account.username,
            "password": account.password,
            "user_card": account.user_card,
            "cookies": cookies,
        });
        let response: SlideResponse = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("Failed to reach slide solver")?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse slide solver response")?;

        let ticket = SlideTicket {
            cookies: response
                .cookies
                .into_iter()
                .map(|c| (c.name, c.value))
                .collect(),
            query: response.query,
        };
        Ok((!ticket.is_empty()).then_some(ticket))
    }
}
