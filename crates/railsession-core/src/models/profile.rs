use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key holding the account's display name.
pub const DISPLAY_NAME_KEY: &str = "user_name";

/// Resolved account attributes (display name, contact details, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Profile(BTreeMap<String, Value>);

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_display_name(name: impl Into<String>) -> Self {
        let mut profile = Self::new();
        profile.set_display_name(name);
        profile
    }

    pub fn display_name(&self) -> &str {
        self.0
            .get(DISPLAY_NAME_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.0
            .insert(DISPLAY_NAME_KEY.to_string(), Value::String(name.into()));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Overlay `other` on top of this profile.
    pub fn merge(&mut self, other: Profile) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<serde_json::Map<String, Value>> for Profile {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_unrelated_keys() {
        let mut profile = Profile::with_display_name("Old Name");
        profile.insert("email", json!("a@example.com"));

        let mut update = Profile::with_display_name("New Name");
        update.insert("mobile_no", json!("13800000000"));
        profile.merge(update);

        assert_eq!(profile.display_name(), "New Name");
        assert_eq!(profile.get("email"), Some(&json!("a@example.com")));
        assert_eq!(profile.get("mobile_no"), Some(&json!("13800000000")));
    }

    #[test]
    fn test_display_name_defaults_to_empty() {
        assert_eq!(Profile::new().display_name(), "");
    }
}
