//! HTTP error mapping utilities

use crate::error::{GatewayError, NetworkErrorKind};
use serde_json::Value;

/// Map a non-success status and response body to a [`GatewayError::Api`]
pub fn map_http_error(
    status: u16,
    body: Option<String>,
    provider: &str,
    model: &str,
) -> GatewayError {
    let details = body
        .as_deref()
        .and_then(|b| serde_json::from_str::<Value>(b).ok());

    let message = details
        .as_ref()
        .and_then(extract_error_message)
        .or_else(|| body.filter(|b| !b.trim().is_empty()))
        .unwrap_or_else(|| format!("HTTP error {}", status));

    GatewayError::Api {
        status,
        provider: provider.to_string(),
        model: model.to_string(),
        message,
        details,
    }
}

/// Extract a human-readable message from common error body shapes
fn extract_error_message(json: &Value) -> Option<String> {
    // { "error": { "message": "..." } } (OpenAI, Anthropic, Gemini)
    if let Some(message) = json
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return Some(message.to_string());
    }

    // [{ "error": {...} }] (Vertex streaming errors)
    if let Some(first) = json.as_array().and_then(|a| a.first()) {
        return extract_error_message(first);
    }

    if let Some(message) = json.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }

    json.get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Classify a reqwest failure
pub fn map_transport_error(error: &reqwest::Error) -> GatewayError {
    let kind = if error.is_timeout() {
        NetworkErrorKind::Timeout
    } else if error.is_connect() {
        if looks_like_dns_failure(error) {
            NetworkErrorKind::Dns
        } else {
            NetworkErrorKind::Connect
        }
    } else if error.is_body() || error.is_decode() {
        NetworkErrorKind::Body
    } else {
        NetworkErrorKind::Other
    };

    GatewayError::Network {
        kind,
        message: error.to_string(),
    }
}

fn looks_like_dns_failure(error: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = source {
        let text = err.to_string().to_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_openai_error_body() {
        let body = json!({"error": {"message": "bad key", "type": "invalid_request_error"}});
        let err = map_http_error(401, Some(body.to_string()), "a", "m1");
        match err {
            GatewayError::Api {
                status,
                message,
                details,
                ..
            } => {
                assert_eq!(status, 401);
                assert_eq!(message, "bad key");
                assert_eq!(details.unwrap()["error"]["type"], "invalid_request_error");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_plain_text_body() {
        let err = map_http_error(502, Some("upstream down".into()), "a", "m1");
        assert!(err.to_string().contains("upstream down"));
    }

    #[test]
    fn test_empty_body() {
        let err = map_http_error(503, None, "a", "m1");
        assert!(err.to_string().contains("HTTP error 503"));
    }
}
