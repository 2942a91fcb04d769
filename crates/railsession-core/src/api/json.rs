//! Dotted-path access into loosely typed service responses.

use serde_json::Value;

/// Follow a dotted path such as `data.userDTO.loginUserDTO`.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

/// String at `path`; numbers and booleans are rendered, empty strings and
/// nulls count as absent.
pub fn lookup_string(value: &Value, path: &str) -> Option<String> {
    match lookup(value, path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Integer at `path`, accepting numeric strings (`"0"`) as well as numbers.
pub fn lookup_i64(value: &Value, path: &str) -> Option<i64> {
    match lookup(value, path)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested() {
        let v = json!({"data": {"is_login": "Y", "userDTO": {"loginUserDTO": {"name": "张三"}}}});
        assert_eq!(lookup_string(&v, "data.is_login").as_deref(), Some("Y"));
        assert_eq!(
            lookup_string(&v, "data.userDTO.loginUserDTO.name").as_deref(),
            Some("张三")
        );
        assert!(lookup(&v, "data.missing.deeper").is_none());
    }

    #[test]
    fn test_lookup_i64_accepts_strings() {
        let v = json!({"a": "0", "b": 2, "c": "x", "d": null});
        assert_eq!(lookup_i64(&v, "a"), Some(0));
        assert_eq!(lookup_i64(&v, "b"), Some(2));
        assert_eq!(lookup_i64(&v, "c"), None);
        assert_eq!(lookup_i64(&v, "d"), None);
    }

    #[test]
    fn test_empty_string_is_absent() {
        let v = json!({"newapptk": ""});
        assert_eq!(lookup_string(&v, "newapptk"), None);
    }
}
