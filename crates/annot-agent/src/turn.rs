//! One configured step of a conversation

use annot_ai::{Request, Response};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::Result;
use crate::handler::{BoxedHandler, HandlerRegistry, HandlerSpec};

/// Handler chains of a turn, in execution order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub name: String,
    pub request_handlers: Vec<HandlerSpec>,
    pub response_handlers: Vec<HandlerSpec>,
}

/// Runs the request chain before, and the response chain after, one
/// exchange with the model.
pub struct Turn {
    name: String,
    request_handlers: Vec<BoxedHandler>,
    response_handlers: Vec<BoxedHandler>,
}

impl Turn {
    pub fn new(
        name: impl Into<String>,
        request_handlers: Vec<BoxedHandler>,
        response_handlers: Vec<BoxedHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            request_handlers,
            response_handlers,
        }
    }

    /// Build both chains, preserving the configured order
    pub fn from_config(config: &TurnConfig, registry: &HandlerRegistry) -> Result<Self> {
        let build = |specs: &[HandlerSpec]| {
            specs
                .iter()
                .map(|spec| registry.build(spec))
                .collect::<Result<Vec<_>>>()
        };
        Ok(Self::new(
            config.name.clone(),
            build(&config.request_handlers)?,
            build(&config.response_handlers)?,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn prepare_request(
        &self,
        mut request: Request,
        context: &mut Context,
        is_tool_cycle: bool,
    ) -> Result<Request> {
        tracing::debug!(turn = %self.name, is_tool_cycle, "Preparing request");
        for handler in &self.request_handlers {
            request = handler
                .handle_request(request, context, is_tool_cycle)
                .await?;
        }
        Ok(request)
    }

    pub async fn parse_response(
        &self,
        mut response: Response,
        context: &mut Context,
        is_tool_cycle: bool,
    ) -> Result<Response> {
        tracing::debug!(turn = %self.name, is_tool_cycle, "Parsing response");
        for handler in &self.response_handlers {
            response = handler
                .handle_response(response, context, is_tool_cycle)
                .await?;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use annot_ai::Message;
    use async_trait::async_trait;
    use serde_json::json;

    /// Appends its tag to the "trace" list and, on requests, a user message
    struct Tagger(&'static str);

    #[async_trait]
    impl Handler for Tagger {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle_request(
            &self,
            mut request: Request,
            context: &mut Context,
            is_tool_cycle: bool,
        ) -> Result<Request> {
            context.push("trace", json!(format!("{}:{}", self.0, is_tool_cycle)));
            request.messages.push(Message::user(self.0));
            Ok(request)
        }

        async fn handle_response(
            &self,
            response: Response,
            context: &mut Context,
            _is_tool_cycle: bool,
        ) -> Result<Response> {
            context.push("trace", json!(self.0));
            Ok(response)
        }
    }

    fn response() -> Response {
        serde_json::from_value(json!({
            "id": "r", "choices": [], "created": 0, "model": "m", "object": "chat.completion"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_request_chain_runs_in_order() {
        let turn = Turn::new(
            "t",
            vec![Box::new(Tagger("a")), Box::new(Tagger("b"))],
            vec![],
        );
        let mut ctx = Context::new();
        let request = turn
            .prepare_request(Request::new("m", vec![]), &mut ctx, true)
            .await
            .unwrap();
        let texts: Vec<_> = request.messages.iter().map(Message::text).collect();
        assert_eq!(texts, ["a", "b"]);
        assert_eq!(ctx.get("trace"), Some(&json!(["a:true", "b:true"])));
    }

    #[tokio::test]
    async fn test_response_chain_runs_in_order() {
        let turn = Turn::new(
            "t",
            vec![],
            vec![Box::new(Tagger("x")), Box::new(Tagger("y")), Box::new(Tagger("z"))],
        );
        let mut ctx = Context::new();
        turn.parse_response(response(), &mut ctx, false)
            .await
            .unwrap();
        assert_eq!(ctx.get("trace"), Some(&json!(["x", "y", "z"])));
    }

    #[tokio::test]
    async fn test_from_config_uses_registry() {
        let config: TurnConfig = toml::from_str(
            r#"
            name = "extract"

            [[request_handlers]]
            type = "AddUserMessage"
            message = "Read: {publication}"

            [[request_handlers]]
            type = "WebSearch"
            "#,
        )
        .unwrap();
        let registry = HandlerRegistry::with_builtins(None);
        let turn = Turn::from_config(&config, &registry).unwrap();
        assert_eq!(turn.name(), "extract");

        let mut ctx = Context::for_publication("paper", None);
        let request = turn
            .prepare_request(Request::new("m", vec![]), &mut ctx, false)
            .await
            .unwrap();
        assert_eq!(request.messages[0].text(), "Read: paper");
        assert!(request.plugins.is_some());
    }

    #[test]
    fn test_from_config_reports_unknown_handler() {
        let config = TurnConfig {
            name: "t".into(),
            request_handlers: vec![],
            response_handlers: vec![HandlerSpec::new("Missing")],
        };
        let registry = HandlerRegistry::with_builtins(None);
        let err = Turn::from_config(&config, &registry).err().unwrap();
        assert!(err.is_configuration_error());
    }
}
