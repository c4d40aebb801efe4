use annot_ai::Response;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{OutputSchema, extract_fenced_json};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::handler::Handler;

fn default_fail_on_parsing_error() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FencedJsonBlockConfig {
    /// Response format definition: `{ name, strict, schema }`
    pub json_schema: Value,
    #[serde(default)]
    pub key_for_context_storage: Option<String>,
    /// Stop the conversation when no valid block is found
    #[serde(default = "default_fail_on_parsing_error")]
    pub fail_on_parsing_error: bool,
}

/// Extracts and validates a ```json block from the answer, for models that
/// cannot produce schema-constrained output natively.
pub struct FencedJsonBlock {
    schema: OutputSchema,
    key_for_context_storage: Option<String>,
    fail_on_parsing_error: bool,
}

impl FencedJsonBlock {
    pub const TYPE: &'static str = "FencedJsonBlock";

    pub fn new(config: FencedJsonBlockConfig) -> Result<Self> {
        Ok(Self {
            schema: OutputSchema::new(Self::TYPE, config.json_schema)?,
            key_for_context_storage: config.key_for_context_storage,
            fail_on_parsing_error: config.fail_on_parsing_error,
        })
    }

    fn parse(&self, content: &str) -> std::result::Result<Value, String> {
        let block = extract_fenced_json(content)?;
        let object: Value =
            serde_json::from_str(block).map_err(|e| format!("Failed to parse JSON block: {e}"))?;
        self.schema
            .validate(&object)
            .map_err(|e| format!("JSON block does not match schema: {e}"))?;
        Ok(object)
    }
}

#[async_trait]
impl Handler for FencedJsonBlock {
    fn name(&self) -> &str {
        Self::TYPE
    }

    async fn handle_response(
        &self,
        response: Response,
        context: &mut Context,
        _is_tool_cycle: bool,
    ) -> Result<Response> {
        let Some(last) = response.choices.last() else {
            return Ok(response);
        };
        let Some(choice) = last.as_non_streaming() else {
            tracing::error!("Last choice is not a completed message, skipping");
            return Ok(response);
        };

        tracing::debug!("Parsing response for fenced JSON block");
        let content = choice.message.content.as_deref().unwrap_or_default();
        match self.parse(content) {
            Ok(object) => {
                if let Some(key) = &self.key_for_context_storage {
                    context.insert(key.clone(), object);
                }
            }
            Err(message) if self.fail_on_parsing_error => {
                return Err(Error::handler(Self::TYPE, message));
            }
            Err(message) => tracing::warn!("Continuing despite error: {}", message),
        }
        Ok(response)
    }
}
