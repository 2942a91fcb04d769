//! Small helpers shared across modules.

pub mod backoff;
pub mod clock;

pub use backoff::{exponential_backoff, jitter, SleepInterval};
pub use clock::Clock;

/// True when the string is a non-empty run of ASCII digits.
pub fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_number() {
        assert!(is_number("1"));
        assert!(is_number("0042"));
        assert!(!is_number(""));
        assert!(!is_number("12a"));
        assert!(!is_number("-3"));
        assert!(!is_number("张三"));
    }
}
