//! OpenRouter chat-completions client

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};

use super::Transport;
use crate::{
    error::{Error, Result},
    http::{HttpExchange, body_value, header_map},
    types::{KeyInfo, KeyInfoWrap, Request},
};

/// Default base URL of the OpenRouter API
pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1/";

/// Environment variable holding the API key
pub const API_KEY_ENV_VAR: &str = "OPENROUTER_API_KEY";

/// Default per-call timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenRouter API client
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    timeout: Duration,
    dry_run: bool,
}

impl OpenRouterClient {
    /// Create a new client with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: DEFAULT_API_URL.to_string(),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
            dry_run: false,
        }
    }

    /// Use a different API base URL
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Set the per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Skip all network I/O. Every call fails with [`Error::DryRun`].
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| Error::InvalidApiKey)?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn map_send_error(&self, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::Http(error)
        }
    }

    /// Retrieve information about the API key (usage, limits)
    pub async fn key_info(&self) -> Result<KeyInfo> {
        let response = self
            .client
            .get(self.endpoint("auth/key"))
            .headers(self.headers()?)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::api(i64::from(status), text));
        }

        Ok(redact_label(response.json::<KeyInfoWrap>().await?.data))
    }
}

/// The label contains part of the key
fn redact_label(mut info: KeyInfo) -> KeyInfo {
    info.label = "[redacted]".to_string();
    info
}

#[async_trait]
impl Transport for OpenRouterClient {
    async fn send(&self, request: &Request) -> Result<HttpExchange> {
        if self.dry_run {
            tracing::info!("Dry run, not sending request");
            return Err(Error::DryRun);
        }

        let url = self.endpoint("chat/completions");
        let headers = self.headers()?;
        let request_body = serde_json::to_value(request)?;

        tracing::debug!(%url, model = %request.model, "Sending request");
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .headers(headers.clone())
            .json(&request_body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status().as_u16();
        let response_headers = header_map(response.headers());
        let final_url = response.url().to_string();
        let bytes = response.bytes().await.map_err(|e| self.map_send_error(e))?;

        let exchange = HttpExchange {
            status_code: status,
            request_headers: header_map(&headers),
            response_headers,
            request_body,
            response_body: body_value(&bytes),
            url: final_url,
            elapsed_time: started.elapsed().as_secs_f64(),
        };

        if !exchange.is_success() {
            return Err(Error::Status {
                status,
                exchange: Box::new(exchange),
            });
        }

        Ok(exchange)
    }
}
