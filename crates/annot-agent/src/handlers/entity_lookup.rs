use std::sync::Arc;

use annot_ai::{MALFORMED_FUNCTION_CALL, Request, Response, ToolCall, ToolChoice, ToolChoiceMode};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::context::{self, Context};
use crate::entity::{EntityLookup, EntityQuery};
use crate::error::{Error, Result};
use crate::handler::Handler;

fn default_max_concurrent_lookups() -> usize {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityLookupToolUseConfig {
    /// Require the model to call a tool on the first pass
    #[serde(default)]
    pub force_tool_use: bool,
    /// Lookups of one response in flight at once
    #[serde(default = "default_max_concurrent_lookups")]
    pub max_concurrent_lookups: usize,
}

impl Default for EntityLookupToolUseConfig {
    fn default() -> Self {
        Self {
            force_tool_use: false,
            max_concurrent_lookups: default_max_concurrent_lookups(),
        }
    }
}

/// Offers the entity lookup tool to the model and answers its calls.
///
/// The answers are written to the context under [`context::TOOL_CALLS`] so
/// the conversation can send them back on the tool cycle pass; arguments
/// and raw results go under [`context::ENTITY_LOOKUP`].
pub struct EntityLookupToolUse {
    config: EntityLookupToolUseConfig,
    lookup: Arc<dyn EntityLookup>,
}

impl EntityLookupToolUse {
    pub const TYPE: &'static str = "EntityLookupToolUse";

    pub fn new(config: EntityLookupToolUseConfig, lookup: Arc<dyn EntityLookup>) -> Self {
        Self { config, lookup }
    }

    fn parse_query(call: &ToolCall) -> Result<EntityQuery> {
        serde_json::from_str(&call.function.arguments).map_err(|e| {
            Error::handler(
                Self::TYPE,
                format!("Invalid arguments for tool call '{}': {}", call.id, e),
            )
        })
    }

    /// Run every lookup; nothing is written unless all of them succeed
    async fn process_tool_calls(&self, calls: Vec<ToolCall>, context: &mut Context) -> Result<()> {
        let total = calls.len();
        let queries = calls
            .into_iter()
            .filter(|call| call.function.name == self.lookup.tool_name())
            .map(|call| Self::parse_query(&call).map(|query| (call.id, query)))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("Queued {} entity lookups of {} tool calls", queries.len(), total);

        let lookup = &self.lookup;
        let answers: Vec<_> = stream::iter(queries)
            .map(|(id, query)| async move {
                tracing::info!(call = %id, "Searching entities with arguments {:?}", query);
                let results = lookup.find_ids(&query).await?;
                Ok::<_, Error>((id, query, results))
            })
            .buffer_unordered(self.config.max_concurrent_lookups.max(1))
            .try_collect()
            .await?;

        for (id, query, results) in answers {
            let answer = self.lookup.format_results(&query, &results);
            context.insert_namespaced(
                context::ENTITY_LOOKUP,
                id.clone(),
                json!({
                    "arguments": query,
                    "search_results": results,
                }),
            );
            context.set_tool_result(id, answer);
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for EntityLookupToolUse {
    fn name(&self) -> &str {
        Self::TYPE
    }

    async fn handle_request(
        &self,
        mut request: Request,
        _context: &mut Context,
        is_tool_cycle: bool,
    ) -> Result<Request> {
        if is_tool_cycle {
            return Ok(request);
        }

        tracing::debug!("Enabling entity lookup tool use");
        request.add_tool(self.lookup.tool());
        if self.config.force_tool_use {
            request.tool_choice = Some(ToolChoice::Mode(ToolChoiceMode::Required));
        }
        Ok(request)
    }

    async fn handle_response(
        &self,
        response: Response,
        context: &mut Context,
        is_tool_cycle: bool,
    ) -> Result<Response> {
        // Calls are answered before the tool cycle starts
        if is_tool_cycle {
            return Ok(response);
        }

        tracing::debug!("Looking for entity lookup tool calls");

        // Finish reason is "stop" but the model failed to produce the call
        let malformed = response.choices.iter().any(|choice| {
            choice.as_non_streaming().is_some_and(|c| {
                c.native_finish_reason.as_deref() == Some(MALFORMED_FUNCTION_CALL)
            })
        });
        if malformed {
            return Err(Error::handler(
                Self::TYPE,
                "Malformed function call detected. Aborting.",
            ));
        }

        let calls = response.tool_calls();
        if !calls.is_empty() {
            self.process_tool_calls(calls, context).await?;
        }
        Ok(response)
    }
}
