use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};

const MAX_LOG_VALUE_LEN: usize = 200;
const MAX_IDENTIFIER_LEN: usize = 50;

/// Current Unix time with sub-second precision
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn datetime_from_ts(ts: f64) -> DateTime<Utc> {
    let secs = ts.trunc() as i64;
    let nanos = (ts.fract() * 1_000_000_000.0) as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_else(Utc::now)
}

pub fn format_rate_limit_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Strip control characters and bound the length of a value headed for the logs
pub fn sanitize_for_logging(value: &str) -> String {
    let mut sanitized: String = value.chars().filter(|c| !c.is_control()).collect();
    if sanitized.chars().count() > MAX_LOG_VALUE_LEN {
        sanitized = sanitized.chars().take(MAX_LOG_VALUE_LEN).collect();
        sanitized.push_str("...");
    }
    sanitized
}

/// Operator-supplied identifiers: IP literals or opaque ids made of `[A-Za-z0-9.:-]`
pub fn is_valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier.len() <= MAX_IDENTIFIER_LEN
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_control_characters() {
        assert_eq!(sanitize_for_logging("1.2.3.4\r\nforged"), "1.2.3.4forged");
    }

    #[test]
    fn test_sanitize_truncates_long_values() {
        let long = "a".repeat(500);
        let sanitized = sanitize_for_logging(&long);
        assert_eq!(sanitized.len(), MAX_LOG_VALUE_LEN + 3);
        assert!(sanitized.ends_with("..."));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("203.0.113.7"));
        assert!(is_valid_identifier("2001:db8::1"));
        assert!(is_valid_identifier("user-42"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("rl:*"));
        assert!(!is_valid_identifier("a b"));
        assert!(!is_valid_identifier(&"1".repeat(51)));
    }

    #[test]
    fn test_datetime_round_trip() {
        let dt = datetime_from_ts(1_700_000_000.5);
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 500);
    }
}
