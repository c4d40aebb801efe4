//! Outbound call contract and its OpenRouter implementation

pub mod openrouter;

use crate::{Error, HttpExchange, Request, Result};
use async_trait::async_trait;

/// One outbound chat-completions call.
///
/// Implementations must return an error for non-2xx answers so callers can
/// retry. A successful call yields the raw exchange; parsing the body is left
/// to the caller so the exchange can be audit-logged whatever it contains.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<HttpExchange>;
}

/// Get an API key from the provided value or the environment
pub fn get_api_key(provided: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = provided.filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }

    std::env::var(env_var)
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or(Error::InvalidApiKey)
}
