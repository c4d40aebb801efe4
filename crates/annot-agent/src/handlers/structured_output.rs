use annot_ai::{Request, Response, ResponseFormat};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{OutputSchema, parse_lenient};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::handler::Handler;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredOutputConfig {
    /// Response format definition: `{ name, strict, schema }`
    pub json_schema: Value,
    /// Context key the validated object is stored under
    #[serde(default)]
    pub key_for_context_storage: Option<String>,
    /// Whether to act on the tool cycle pass instead of the first pass
    #[serde(default)]
    pub apply_in_tool_cycle: bool,
}

/// Demands a schema-constrained JSON answer, then validates and stores it.
///
/// Acts only on the pass selected by `apply_in_tool_cycle`, because a model
/// asked for structured output cannot also call tools.
pub struct StructuredOutput {
    schema: OutputSchema,
    key_for_context_storage: Option<String>,
    apply_in_tool_cycle: bool,
}

impl StructuredOutput {
    pub const TYPE: &'static str = "StructuredOutput";

    pub fn new(config: StructuredOutputConfig) -> Result<Self> {
        Ok(Self {
            schema: OutputSchema::new(Self::TYPE, config.json_schema)?,
            key_for_context_storage: config.key_for_context_storage,
            apply_in_tool_cycle: config.apply_in_tool_cycle,
        })
    }
}

#[async_trait]
impl Handler for StructuredOutput {
    fn name(&self) -> &str {
        Self::TYPE
    }

    async fn handle_request(
        &self,
        mut request: Request,
        _context: &mut Context,
        is_tool_cycle: bool,
    ) -> Result<Request> {
        if self.apply_in_tool_cycle == is_tool_cycle {
            tracing::debug!("Enabling structured output");
            request.response_format =
                Some(ResponseFormat::json_schema(self.schema.definition().clone()));
        } else {
            tracing::debug!("Not in targeted cycle, not requesting structured output");
        }
        Ok(request)
    }

    async fn handle_response(
        &self,
        mut response: Response,
        context: &mut Context,
        is_tool_cycle: bool,
    ) -> Result<Response> {
        if self.apply_in_tool_cycle != is_tool_cycle {
            return Ok(response);
        }
        let Some(choice) = response.last_non_streaming_mut() else {
            return Ok(response);
        };

        tracing::debug!("Validating JSON response");
        let content = choice.message.content.as_deref().unwrap_or_default();
        let object = parse_lenient(content)
            .and_then(|object| self.schema.validate(&object).map(|()| object))
            .map_err(|e| {
                Error::handler(
                    Self::TYPE,
                    format!("LLM did not emit valid JSON or follow output schema: {e}"),
                )
            })?;

        let pretty = serde_json::to_string_pretty(&object)?;
        choice.message.content = Some(format!("```json\n{pretty}\n```"));

        if let Some(key) = &self.key_for_context_storage {
            context.insert(key.clone(), object);
        }
        Ok(response)
    }
}
