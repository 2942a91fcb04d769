use std::collections::BTreeMap;

use chrono::Utc;
use cookie::Cookie;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Cookie carrying the device fingerprint expiry (milliseconds since epoch).
pub const RAIL_EXPIRATION: &str = "RAIL_EXPIRATION";

/// Cookie carrying the device fingerprint itself.
pub const RAIL_DEVICEID: &str = "RAIL_DEVICEID";

/// Ordered cookie set for one account.
///
/// Serialized as a flat JSON object; this is the blob replicated through the
/// credential store and written to the per-user cookie file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CookieJar(BTreeMap<String, String>);

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    /// Merge `other` into this jar, overwriting cookies with the same name.
    pub fn merge<I, K, V>(&mut self, other: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in other {
            self.set(name, value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Value for an outgoing `Cookie` header, or `None` for an empty jar.
    pub fn header_value(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        Some(
            self.0
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Absorb one `Set-Cookie` header. A cookie that arrives already expired
    /// (`Max-Age` of zero or less, or an `Expires` date in the past) is
    /// removed. Path and domain are dropped: the jar only ever talks to one
    /// host.
    pub fn absorb_set_cookie(&mut self, header: &str) {
        let parsed = match Cookie::parse(header) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed Set-Cookie header");
                return;
            }
        };
        let name = parsed.name().trim();
        if name.is_empty() {
            return;
        }

        // Max-Age wins over Expires when both are present
        let expired = match parsed.max_age() {
            Some(age) => age.whole_seconds() <= 0,
            None => parsed
                .expires_datetime()
                .is_some_and(|at| at.unix_timestamp() <= Utc::now().timestamp()),
        };
        if expired {
            self.0.remove(name);
        } else {
            self.set(name, parsed.value().trim_matches('"'));
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CookieJar {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut jar = CookieJar::new();
        jar.merge(iter);
        jar
    }
}
