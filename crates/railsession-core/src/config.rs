//! Application configuration management.
//!
//! Configuration is a JSON file, by default at
//! `~/.config/railsession/config.json`. Every tunable has a default; only the
//! user list is required.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::client::DEFAULT_BASE_URL;
use crate::auth::{AccountCredentials, FingerprintSettings, Keychain, LoginVariant};
use crate::cluster::ClusterRole;
use crate::utils::SleepInterval;

/// Application name used for config/data directory paths
const APP_NAME: &str = "railsession";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "RAILSESSION_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub fingerprint: FingerprintSettings,
    /// OCR service for the credential login captcha
    #[serde(default)]
    pub captcha_service_url: Option<String>,
    /// Browser-automation helper for the slide login
    #[serde(default)]
    pub slide_solver_url: Option<String>,
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a confirmed login stays trusted before it is re-validated
    pub heartbeat_interval_secs: i64,
    /// Seconds between session loop passes
    pub poll_interval_secs: u64,
    /// Fixed delay for follower bootstrap and `wait_for_ready`
    pub retry_secs: u64,
    /// Attempt ceiling for bounded-retry calls
    pub request_max_retry: u32,
    /// Randomized sleep range for polling and transient failures
    pub sleep_interval: SleepInterval,
    /// Run one loop pass and return
    pub single_pass: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 120,
            poll_interval_secs: 5,
            retry_secs: 3,
            request_max_retry: 5,
            sleep_interval: SleepInterval::default(),
            single_pass: false,
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_time(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Slave,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub role: Option<NodeRole>,
    /// Root of the shared credential store
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Stable identity used for store keys and file names
    pub key: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub user_card: Option<String>,
    #[serde(rename = "type", default)]
    pub variant: LoginVariant,
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("key", &self.key)
            .field("user_name", &self.user_name)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("variant", &self.variant)
            .finish()
    }
}

impl UserConfig {
    /// Credentials for the login protocol. QR logins need no password; the
    /// other variants fall back to the OS keychain when the config has none.
    pub fn account(&self) -> Result<AccountCredentials, ConfigError> {
        let password = match (&self.password, self.variant) {
            (Some(password), _) => password.clone(),
            (None, LoginVariant::Qr) => String::new(),
            (None, _) => Keychain::get_password(&self.user_name).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "user '{}' has no password in config or keychain: {:#}",
                    self.key, e
                ))
            })?,
        };
        Ok(AccountCredentials {
            username: self.user_name.clone(),
            password,
            user_card: self.user_card.clone(),
        })
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

impl Config {
    /// Load from `path`, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_json(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path, source },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let config_dir = dirs::config_dir().ok_or_else(|| {
            ConfigError::ValidationError("Could not find config directory".to_string())
        })?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Resolve this process's role once.
    pub fn role(&self) -> ClusterRole {
        match (self.cluster.enabled, self.cluster.role) {
            (false, _) => ClusterRole::Single,
            (true, Some(NodeRole::Slave)) => ClusterRole::Follower,
            (true, _) => ClusterRole::Authority,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.users.is_empty() {
            return invalid("at least one user is required".into());
        }
        let mut seen = HashSet::new();
        for user in &self.users {
            if user.key.trim().is_empty() {
                return invalid("user key must not be empty".into());
            }
            if !seen.insert(user.key.as_str()) {
                return invalid(format!("duplicate user key '{}'", user.key));
            }
            if user.variant != LoginVariant::Qr && user.user_name.is_empty() {
                return invalid(format!("user '{}' needs user_name for {} login", user.key, user.variant));
            }
            if user.variant == LoginVariant::Credentials && self.captcha_service_url.is_none() {
                return invalid(format!("user '{}' uses credential login but captcha_service_url is unset", user.key));
            }
            if user.variant == LoginVariant::Slide && self.slide_solver_url.is_none() {
                return invalid(format!("user '{}' uses slide login but slide_solver_url is unset", user.key));
            }
        }
        if self.cluster.enabled {
            if self.cluster.role.is_none() {
                return invalid("cluster.role must be 'master' or 'slave' when clustering is enabled".into());
            }
            if self.cluster.store_dir.is_none() {
                return invalid("cluster.store_dir is required when clustering is enabled".into());
            }
        }
        if self.session.heartbeat_interval_secs <= 0 {
            return invalid("session.heartbeat_interval_secs must be positive".into());
        }
        if !self.session.sleep_interval.is_valid() {
            return invalid("session.sleep_interval needs 0 <= min <= max".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{"users": [{"key": "u1"}]}"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.role(), ClusterRole::Single);
        assert_eq!(config.session.heartbeat_interval_secs, 120);
        assert_eq!(config.session.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.session.sleep_interval, SleepInterval { min: 0.1, max: 5.0 });
        assert_eq!(config.users[0].variant, LoginVariant::Qr);
        assert_eq!(config.service.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_role_resolution() {
        let slave = Config::from_json(
            r#"{"cluster": {"enabled": true, "role": "slave", "store_dir": "/mnt/shared"},
                "users": [{"key": "u1"}]}"#,
        )
        .unwrap();
        assert_eq!(slave.role(), ClusterRole::Follower);

        let master = Config::from_json(
            r#"{"cluster": {"enabled": true, "role": "master", "store_dir": "/mnt/shared"},
                "users": [{"key": "u1"}]}"#,
        )
        .unwrap();
        assert_eq!(master.role(), ClusterRole::Authority);

        // Role is ignored while clustering is off
        let single = Config::from_json(
            r#"{"cluster": {"enabled": false, "role": "slave"}, "users": [{"key": "u1"}]}"#,
        )
        .unwrap();
        assert_eq!(single.role(), ClusterRole::Single);
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            r#"{"users": []}"#,
            r#"{"users": [{"key": "u1"}, {"key": "u1"}]}"#,
            r#"{"users": [{"key": "u1", "type": "credentials", "user_name": "a"}]}"#,
            r#"{"users": [{"key": "u1", "type": "slide"}]}"#,
            r#"{"cluster": {"enabled": true}, "users": [{"key": "u1"}]}"#,
            r#"{"session": {"heartbeat_interval_secs": 0}, "users": [{"key": "u1"}]}"#,
            r#"{"session": {"sleep_interval": {"min": 5, "max": 1}}, "users": [{"key": "u1"}]}"#,
        ];
        for case in cases {
            assert!(
                matches!(Config::from_json(case), Err(ConfigError::ValidationError(_))),
                "expected validation error for {}",
                case
            );
        }
    }

    #[test]
    fn test_parse_error_names_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        match Config::load(Some(&path)) {
            Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_account_for_qr_needs_no_password() {
        let config = Config::from_json(MINIMAL).unwrap();
        let account = config.users[0].account().unwrap();
        assert!(account.password.is_empty());
    }

    #[test]
    fn test_account_prefers_config_password() {
        let config = Config::from_json(
            r#"{"captcha_service_url": "http://ocr.test/check/",
                "users": [{"key": "u1", "type": "credentials", "user_name": "alice", "password": "pw"}]}"#,
        )
        .unwrap();
        assert_eq!(config.users[0].account().unwrap().password, "pw");
        assert!(!format!("{:?}", config.users[0]).contains("pw\""));
    }
}
