//! Rate-limit detection
//!
//! Providers report throttling in different ways: a bare 429, a 200/400 with a
//! nested error object, or only a message. All of them are recognised here.

use crate::error::GatewayError;
use serde_json::Value;

const RATE_LIMIT_PHRASES: [&str; 3] = ["429", "rate limit", "too many requests"];

/// Whether `error` means the key in use has been rate limited
pub fn is_rate_limit_error(error: &GatewayError) -> bool {
    match error {
        GatewayError::Api {
            status,
            message,
            details,
            ..
        } => {
            *status == 429
                || details.as_ref().is_some_and(details_signal_rate_limit)
                || message_signals_rate_limit(message)
        }
        _ => false,
    }
}

fn details_signal_rate_limit(details: &Value) -> bool {
    let nested = details.get("error");
    let candidates = [
        nested.and_then(|e| e.get("code")),
        nested.and_then(|e| e.get("status")),
        details.get("status"),
        details.get("code"),
    ];

    if candidates.into_iter().flatten().any(is_429) {
        return true;
    }

    nested
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .is_some_and(message_signals_rate_limit)
}

fn is_429(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_u64() == Some(429),
        Value::String(s) => s == "429" || s.eq_ignore_ascii_case("RESOURCE_EXHAUSTED"),
        _ => false,
    }
}

fn message_signals_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api(status: u16, message: &str, details: Option<Value>) -> GatewayError {
        GatewayError::Api {
            status,
            provider: "p".into(),
            model: "m".into(),
            message: message.into(),
            details,
        }
    }

    #[test]
    fn test_status_429() {
        assert!(is_rate_limit_error(&api(429, "", None)));
    }

    #[test]
    fn test_nested_code() {
        let details = json!({"error": {"code": 429, "message": "slow down"}});
        assert!(is_rate_limit_error(&api(400, "bad", Some(details))));

        let details = json!({"error": {"status": "429"}});
        assert!(is_rate_limit_error(&api(200, "", Some(details))));

        let details = json!({"status": 429});
        assert!(is_rate_limit_error(&api(400, "", Some(details))));
    }

    #[test]
    fn test_message_phrases() {
        assert!(is_rate_limit_error(&api(400, "Rate limit exceeded", None)));
        assert!(is_rate_limit_error(&api(503, "Too Many Requests", None)));
        assert!(!is_rate_limit_error(&api(500, "internal failure", None)));
    }

    #[test]
    fn test_other_errors_ignored() {
        assert!(!is_rate_limit_error(&GatewayError::configuration("rate limit")));
    }
}
