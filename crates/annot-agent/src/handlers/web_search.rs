use annot_ai::{Request, WebPlugin};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::Result;
use crate::handler::Handler;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSearchConfig {
    /// Maximum number of results shown to the model
    pub max_results: u32,
    pub search_prompt: Option<String>,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            max_results: 3,
            search_prompt: None,
        }
    }
}

/// Enables the endpoint's web search plugin
pub struct WebSearch {
    config: WebSearchConfig,
}

impl WebSearch {
    pub const TYPE: &'static str = "WebSearch";

    pub fn new(config: WebSearchConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Handler for WebSearch {
    fn name(&self) -> &str {
        Self::TYPE
    }

    async fn handle_request(
        &self,
        mut request: Request,
        _context: &mut Context,
        _is_tool_cycle: bool,
    ) -> Result<Request> {
        tracing::debug!("Enabling web search");
        request.add_plugin(WebPlugin::new(
            self.config.max_results,
            self.config.search_prompt.clone(),
        ));
        Ok(request)
    }
}
