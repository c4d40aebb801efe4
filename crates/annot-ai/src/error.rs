//! Error types for annot-ai

use thiserror::Error;

use crate::http::HttpExchange;

/// Result type alias using annot-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the OpenRouter API
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed before a response arrived
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The per-call timeout elapsed
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The endpoint answered with a non-2xx status. The exchange is kept so
    /// it can still be written to the audit log.
    #[error("HTTP status {status} from {}", exchange.url)]
    Status {
        status: u16,
        exchange: Box<HttpExchange>,
    },

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned a structured error payload
    #[error("{code}: {message}\nMetadata: {metadata}")]
    Api {
        code: i64,
        message: String,
        metadata: serde_json::Value,
    },

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Dry-run mode, no request was sent
    #[error("Dry run, no request sent")]
    DryRun,
}

impl Error {
    /// Create an API error from a code and message
    pub fn api(code: i64, message: impl Into<String>) -> Self {
        Self::Api {
            code,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// The HTTP exchange attached to this error, if the endpoint answered at all
    pub fn exchange(&self) -> Option<&HttpExchange> {
        match self {
            Error::Status { exchange, .. } => Some(exchange),
            _ => None,
        }
    }

    /// Check if this error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::Timeout(_) | Error::Status { .. } => true,
            Error::Api { code, message, .. } => {
                let msg = message.to_lowercase();
                *code == 429
                    || *code >= 500
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(status: u16) -> HttpExchange {
        HttpExchange {
            status_code: status,
            url: "https://openrouter.ai/api/v1/chat/completions".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_retryable_transport_variants() {
        assert!(Error::Timeout(std::time::Duration::from_secs(30)).is_retryable());
        let e = Error::Status {
            status: 502,
            exchange: Box::new(exchange(502)),
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn test_retryable_api_rate_limit_code() {
        assert!(Error::api(429, "Slow down").is_retryable());
        assert!(Error::api(503, "Provider unavailable").is_retryable());
    }

    #[test]
    fn test_retryable_api_overloaded_message() {
        assert!(Error::api(400, "Upstream model is overloaded").is_retryable());
    }

    #[test]
    fn test_not_retryable() {
        assert!(!Error::api(401, "No auth credentials found").is_retryable());
        assert!(!Error::InvalidApiKey.is_retryable());
        assert!(!Error::DryRun.is_retryable());
    }

    #[test]
    fn test_status_error_keeps_exchange() {
        let e = Error::Status {
            status: 500,
            exchange: Box::new(exchange(500)),
        };
        assert_eq!(e.exchange().map(|x| x.status_code), Some(500));
        assert!(e.to_string().contains("500"));
        assert!(Error::DryRun.exchange().is_none());
    }

    #[test]
    fn test_api_error_display() {
        let e = Error::Api {
            code: 402,
            message: "Insufficient credits".into(),
            metadata: serde_json::json!({"provider": "x"}),
        };
        let text = e.to_string();
        assert!(text.starts_with("402: Insufficient credits"));
        assert!(text.contains("Metadata"));
    }
}
