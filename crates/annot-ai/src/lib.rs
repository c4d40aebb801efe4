//! annot-ai: OpenRouter chat-completions layer
//!
//! This crate provides the request/response envelopes of the OpenRouter API,
//! the audit capture of raw HTTP exchanges, and the transport used to send
//! chat-completion requests.

pub mod error;
pub mod http;
pub mod providers;
pub mod types;

pub use error::{Error, Result};
pub use http::HttpExchange;
pub use providers::{Transport, openrouter::OpenRouterClient};
pub use types::*;
