use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::models::{CookieJar, Passenger};

/// Consider the passenger snapshot stale after 1 hour.
/// Rosters change rarely, but a stale encrypted token breaks booking.
const CACHE_STALE_MINUTES: i64 = 60;

/// Directory (under the data dir) for downloaded QR images
const QR_DIR: &str = "qrcode";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Covers clock skew too
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }

    pub fn is_stale(&self) -> bool {
        self.age_minutes() > CACHE_STALE_MINUTES
    }
}

/// Turn a user identity into something safe to use as a file name.
pub fn file_stem(identity: &str) -> String {
    // "", "." and ".." would name the parent directory itself
    if identity.chars().all(|c| c == '.') {
        return "_".repeat(identity.len().max(1));
    }
    identity
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect()
}

pub struct LocalStore {
    data_dir: PathBuf,
}

impl LocalStore {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn qr_dir(&self) -> PathBuf {
        self.data_dir.join(QR_DIR)
    }

    pub fn cookie_path(&self, identity: &str) -> PathBuf {
        self.data_dir.join(format!("{}.cookie", file_stem(identity)))
    }

    pub fn passengers_path(&self, identity: &str) -> PathBuf {
        self.data_dir
            .join(format!("passengers_{}.json", file_stem(identity)))
    }

    fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    fn save<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let contents = serde_json::to_string_pretty(value)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(path = %path.display(), "Saved local file");
        Ok(())
    }

    // ===== Cookies =====

    pub fn has_cookies(&self, identity: &str) -> bool {
        self.cookie_path(identity).exists()
    }

    pub fn load_cookies(&self, identity: &str) -> Result<Option<CookieJar>> {
        self.load(&self.cookie_path(identity))
    }

    pub fn save_cookies(&self, identity: &str, jar: &CookieJar) -> Result<()> {
        self.save(&self.cookie_path(identity), jar)
    }

    // ===== Passengers =====

    pub fn load_passengers(&self, identity: &str) -> Result<Option<CachedData<Vec<Passenger>>>> {
        self.load(&self.passengers_path(identity))
    }

    pub fn save_passengers(&self, identity: &str, passengers: &[Passenger]) -> Result<()> {
        self.save(&self.passengers_path(identity), &CachedData::new(passengers))
    }
}

// ============================================================================
// Tests
// ============================================================================
