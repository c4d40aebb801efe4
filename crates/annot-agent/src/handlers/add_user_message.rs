use std::sync::LazyLock;

use annot_ai::{Message, Request};
use async_trait::async_trait;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::handler::Handler;

/// `{{`, `}}` or a `{name}` placeholder
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{|\}\}|\{([^{}]*)\}").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AddUserMessageConfig {
    /// Message template; `{key}` is filled from the context
    pub message: String,
    /// Extra template variables, taking precedence over context keys
    pub additional_context: Option<Map<String, Value>>,
}

/// Appends a user message rendered from a template
pub struct AddUserMessage {
    config: AddUserMessageConfig,
}

impl AddUserMessage {
    pub const TYPE: &'static str = "AddUserMessage";

    pub fn new(config: AddUserMessageConfig) -> Self {
        Self { config }
    }

    fn lookup<'a>(&'a self, context: &'a Context, key: &str) -> Option<&'a Value> {
        self.config
            .additional_context
            .as_ref()
            .and_then(|extra| extra.get(key))
            .or_else(|| context.get(key))
    }

    fn render(&self, context: &Context) -> Result<String> {
        let template = &self.config.message;
        let mut out = String::with_capacity(template.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&template[last..whole.start()]);
            last = whole.end();
            out.push_str(&self.substitute(&caps, context)?);
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    fn substitute(&self, caps: &Captures<'_>, context: &Context) -> Result<String> {
        let Some(key) = caps.get(1) else {
            // An escaped brace
            return Ok(caps[0][..1].to_string());
        };
        let key = key.as_str().trim();
        match self.lookup(context, key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(Error::handler(
                Self::TYPE,
                format!("Unknown placeholder '{{{key}}}' in message template"),
            )),
        }
    }
}

#[async_trait]
impl Handler for AddUserMessage {
    fn name(&self) -> &str {
        Self::TYPE
    }

    async fn handle_request(
        &self,
        mut request: Request,
        context: &mut Context,
        is_tool_cycle: bool,
    ) -> Result<Request> {
        if is_tool_cycle {
            return Ok(request);
        }
        tracing::debug!("Adding user message");
        let text = self.render(context)?;
        request.messages.push(Message::user(text));
        Ok(request)
    }
}
