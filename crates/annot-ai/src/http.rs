//! Audit capture of raw HTTP exchanges

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A request/response pair stripped down to what is worth keeping in logs.
///
/// Bodies are stored as JSON. A response body that is not JSON is kept as a
/// JSON string so nothing is lost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpExchange {
    pub status_code: u16,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    pub request_body: serde_json::Value,
    pub response_body: serde_json::Value,
    pub url: String,
    /// Seconds from sending the request until the body was read
    pub elapsed_time: f64,
}

impl HttpExchange {
    /// Whether the status code is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Copy a header map into plain strings, redacting credentials.
pub(crate) fn header_map(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if name == reqwest::header::AUTHORIZATION {
                "[redacted]".to_string()
            } else {
                value.to_str().unwrap_or("[binary]").to_string()
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}

/// Parse a body as JSON, falling back to a JSON string.
pub(crate) fn body_value(bytes: &[u8]) -> serde_json::Value {
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};

    #[test]
    fn test_authorization_is_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-secret"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let map = header_map(&headers);
        assert_eq!(map["authorization"], "[redacted]");
        assert_eq!(map["content-type"], "application/json");
    }

    #[test]
    fn test_body_value_fallbacks() {
        assert_eq!(body_value(b""), serde_json::Value::Null);
        assert_eq!(body_value(br#"{"a":1}"#), serde_json::json!({"a": 1}));
        assert_eq!(
            body_value(b"<html>bad gateway</html>"),
            serde_json::Value::String("<html>bad gateway</html>".into())
        );
    }

    #[test]
    fn test_is_success() {
        let mut exchange = HttpExchange {
            status_code: 200,
            ..Default::default()
        };
        assert!(exchange.is_success());
        exchange.status_code = 429;
        assert!(!exchange.is_success());
    }
}
