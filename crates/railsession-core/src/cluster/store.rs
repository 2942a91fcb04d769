use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::Profile;

const COOKIE_FILE: &str = "cookie";
const INFO_FILE: &str = "info.json";
const HEARTBEAT_FILE: &str = "heartbeat";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store value for {identity}/{field}: {reason}")]
    Corrupt {
        identity: String,
        field: &'static str,
        reason: String,
    },
}

/// Shared key-value store visible to every cluster member.
///
/// Values are keyed by user identity plus field. No transactional guarantee
/// spans calls; readers tolerate staleness bounded by their poll interval.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_cookie(&self, identity: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set_cookie(&self, identity: &str, cookie: &[u8]) -> Result<(), StoreError>;
    async fn get_info(&self, identity: &str) -> Result<Option<Profile>, StoreError>;
    async fn set_info(&self, identity: &str, info: &Profile) -> Result<(), StoreError>;
    /// Last heartbeat in seconds, `0` when never written.
    async fn get_heartbeat(&self, identity: &str) -> Result<i64, StoreError>;
    async fn set_heartbeat(&self, identity: &str, at: i64) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
struct Entry {
    cookie: Option<Vec<u8>>,
    info: Option<Profile>,
    heartbeat: i64,
}

/// In-process store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get_cookie(&self, identity: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .get(identity)
            .and_then(|e| e.cookie.clone()))
    }

    async fn set_cookie(&self, identity: &str, cookie: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.entry(identity.to_string()).or_default().cookie = Some(cookie.to_vec());
        Ok(())
    }

    async fn get_info(&self, identity: &str) -> Result<Option<Profile>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .get(identity)
            .and_then(|e| e.info.clone()))
    }

    async fn set_info(&self, identity: &str, info: &Profile) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.entry(identity.to_string()).or_default().info = Some(info.clone());
        Ok(())
    }

    async fn get_heartbeat(&self, identity: &str) -> Result<i64, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .get(identity)
            .map(|e| e.heartbeat)
            .unwrap_or(0))
    }

    async fn set_heartbeat(&self, identity: &str, at: i64) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.entry(identity.to_string()).or_default().heartbeat = at;
        Ok(())
    }
}

/// File-per-field store rooted at a directory every node can reach
/// (a shared mount, for instance).
///
/// Layout: `<root>/<identity>/{cookie, info.json, heartbeat}`. Each write
/// lands in a temp file that is renamed into place.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn field_path(&self, identity: &str, field: &str) -> PathBuf {
        self.root.join(crate::cache::file_stem(identity)).join(field)
    }

    async fn read(&self, identity: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.field_path(identity, field)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, identity: &str, field: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.field_path(identity, field);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(identity, field, bytes = bytes.len(), "Wrote store field");
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for DirectoryStore {
    async fn get_cookie(&self, identity: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.read(identity, COOKIE_FILE).await
    }

    async fn set_cookie(&self, identity: &str, cookie: &[u8]) -> Result<(), StoreError> {
        self.write(identity, COOKIE_FILE, cookie).await
    }

    async fn get_info(&self, identity: &str) -> Result<Option<Profile>, StoreError> {
        let Some(bytes) = self.read(identity, INFO_FILE).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                identity: identity.to_string(),
                field: INFO_FILE,
                reason: e.to_string(),
            })
    }

    async fn set_info(&self, identity: &str, info: &Profile) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(info).map_err(|e| StoreError::Corrupt {
            identity: identity.to_string(),
            field: INFO_FILE,
            reason: e.to_string(),
        })?;
        self.write(identity, INFO_FILE, &bytes).await
    }

    async fn get_heartbeat(&self, identity: &str) -> Result<i64, StoreError> {
        let Some(bytes) = self.read(identity, HEARTBEAT_FILE).await? else {
            return Ok(0);
        };
        String::from_utf8_lossy(&bytes)
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| StoreError::Corrupt {
                identity: identity.to_string(),
                field: HEARTBEAT_FILE,
                reason: e.to_string(),
            })
    }

    async fn set_heartbeat(&self, identity: &str, at: i64) -> Result<(), StoreError> {
        self.write(identity, HEARTBEAT_FILE, at.to_string().as_bytes())
            .await
    }
}
