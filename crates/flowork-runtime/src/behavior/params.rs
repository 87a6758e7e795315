//! Lenient readers for node configuration values.
//!
//! Node configurations come from a visual editor and are not always typed
//! consistently: numbers may arrive as strings and flags as `"true"` or `1`.

use crate::instance::Payload;
use std::time::Duration;

pub(crate) fn get_bool(config: &Payload, key: &str) -> Option<bool> {
    match config.get(key)? {
        Payload::Bool(b) => Some(*b),
        Payload::Number(n) => n.as_f64().map(|n| n != 0.0),
        Payload::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn get_f64(config: &Payload, key: &str) -> Option<f64> {
    let value = match config.get(key)? {
        Payload::Number(n) => n.as_f64(),
        Payload::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    value.is_finite().then_some(value)
}

/// Non-negative whole number; fractional values are truncated.
pub(crate) fn get_u32(config: &Payload, key: &str) -> Option<u32> {
    let value = get_f64(config, key)?;
    if value < 0.0 {
        return None;
    }
    Some(value.min(u32::MAX as f64) as u32)
}

/// Non-negative number of seconds. Values beyond what a `Duration` holds
/// saturate to `Duration::MAX`.
pub(crate) fn get_seconds(config: &Payload, key: &str) -> Option<Duration> {
    let secs = get_f64(config, key).filter(|secs| *secs >= 0.0)?;
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

pub(crate) fn get_str<'a>(config: &'a Payload, key: &str) -> Option<&'a str> {
    config
        .get(key)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Python-style truthiness of a JSON value.
pub(crate) fn is_truthy(value: &Payload) -> bool {
    match value {
        Payload::Null => false,
        Payload::Bool(b) => *b,
        Payload::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Payload::String(s) => !s.is_empty(),
        Payload::Array(a) => !a.is_empty(),
        Payload::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seconds_saturate_instead_of_overflowing() {
        let config = json!({ "half": 0.5, "huge": 1e20, "neg": -1, "text": "2" });
        assert_eq!(get_seconds(&config, "half"), Some(Duration::from_millis(500)));
        assert_eq!(get_seconds(&config, "huge"), Some(Duration::MAX));
        assert_eq!(get_seconds(&config, "neg"), None);
        assert_eq!(get_seconds(&config, "text"), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_lenient_numbers_and_flags() {
        let config = json!({
            "a": "3", "b": 2.9, "c": -1, "d": "x",
            "on": "True", "off": 0, "flag": true
        });
        assert_eq!(get_u32(&config, "a"), Some(3));
        assert_eq!(get_u32(&config, "b"), Some(2));
        assert_eq!(get_u32(&config, "c"), None);
        assert_eq!(get_u32(&config, "d"), None);
        assert_eq!(get_bool(&config, "on"), Some(true));
        assert_eq!(get_bool(&config, "off"), Some(false));
        assert_eq!(get_bool(&config, "flag"), Some(true));
        assert_eq!(get_bool(&config, "missing"), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("more")));
        assert!(is_truthy(&json!({ "k": 1 })));
    }
}
