//! Entity lookup collaborator used by the entity lookup tool handler

use std::sync::Arc;

use annot_ai::Tool;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::queue::{QueueConfig, RateLimitedQueue};

/// Arguments of one lookup, as emitted by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityQuery {
    /// Free text naming the entity
    pub query: String,
    /// Service-specific refinements such as a concept type or a limit
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl EntityQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            options: Map::new(),
        }
    }
}

/// A service that resolves free text to entity identifiers.
///
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait EntityLookup: Send + Sync {
    /// Function name offered to the model
    fn tool_name(&self) -> &str;

    fn tool_description(&self) -> &str;

    /// JSON schema of the tool arguments
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The free text query representing the entity name to search for."
                }
            }
        })
    }

    /// Tool definition for the request
    fn tool(&self) -> Tool {
        Tool::function(self.tool_name(), self.tool_description(), self.parameters())
    }

    async fn find_ids(&self, query: &EntityQuery) -> Result<Value>;

    /// Render results as the tool answer the model will read
    fn format_results(&self, query: &EntityQuery, results: &Value) -> String {
        let pretty = serde_json::to_string_pretty(results).unwrap_or_else(|_| results.to_string());
        format!(
            "Entity search results for query: '{}'\n```json\n{}\n```",
            query.query, pretty
        )
    }
}

/// Default rate parameters for lookup services
pub fn default_lookup_queue_config() -> QueueConfig {
    QueueConfig {
        name: "entity_lookup".to_string(),
        min_rps: 1.0,
        max_rps: 2.0,
        initial_rps: 2.0,
        ..QueueConfig::default()
    }
}

/// Puts every `find_ids` call of another lookup behind its own rate-limited
/// queue, independent of the one in front of the model endpoint.
pub struct QueuedEntityLookup<L> {
    inner: Arc<L>,
    queue: RateLimitedQueue<Value, Error>,
}

impl<L: EntityLookup + 'static> QueuedEntityLookup<L> {
    /// Wrap `inner` with the default lookup rate parameters
    pub fn new(inner: L) -> Result<Self> {
        Self::with_config(inner, default_lookup_queue_config())
    }

    pub fn with_config(inner: L, config: QueueConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(inner),
            queue: RateLimitedQueue::new(config)?,
        })
    }

    pub fn queue(&self) -> &RateLimitedQueue<Value, Error> {
        &self.queue
    }
}

#[async_trait]
impl<L: EntityLookup + 'static> EntityLookup for QueuedEntityLookup<L> {
    fn tool_name(&self) -> &str {
        self.inner.tool_name()
    }

    fn tool_description(&self) -> &str {
        self.inner.tool_description()
    }

    fn parameters(&self) -> Value {
        self.inner.parameters()
    }

    async fn find_ids(&self, query: &EntityQuery) -> Result<Value> {
        let inner = Arc::clone(&self.inner);
        let query = query.clone();
        let results = self
            .queue
            .enqueue(move || {
                let inner = Arc::clone(&inner);
                let query = query.clone();
                async move { inner.find_ids(&query).await }
            })
            .await?;
        Ok(results)
    }

    fn format_results(&self, query: &EntityQuery, results: &Value) -> String {
        self.inner.format_results(query, results)
    }
}
