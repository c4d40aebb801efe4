//! OpenRouter chat-completions wire types
//!
//! Field names follow <https://openrouter.ai/docs/requests> and
//! <https://openrouter.ai/docs/responses>. Everything optional is skipped when
//! serializing so request bodies stay minimal.

use serde::{Deserialize, Serialize};

/// Finish reasons this engine accepts on a completed choice
pub const ACCEPTED_FINISH_REASONS: [&str; 2] = ["stop", "tool_calls"];

/// Native finish reason some providers report for broken tool calls
pub const MALFORMED_FUNCTION_CALL: &str = "MALFORMED_FUNCTION_CALL";

// --------------------------------------------------------
// Messages
// --------------------------------------------------------

/// A content part of a multi-part user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// URL or base64 data URL
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Message content: a plain string or a list of parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of this content
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

/// A chat message as the model sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User {
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    System {
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<MessageContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
    },
    Tool {
        content: String,
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl Message {
    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: MessageContent::Text(text.into()),
            name: None,
        }
    }

    /// Create a system message
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            content: MessageContent::Text(text.into()),
            name: None,
        }
    }

    /// Create an assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
        }
    }

    /// Create a tool result message
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Tool {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            name: Some(name.into()),
        }
    }

    /// Get the role as a string
    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::System { .. } => "system",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        match self {
            Self::User { content, .. } | Self::System { content, .. } => content.text(),
            Self::Assistant { content, .. } => {
                content.as_ref().map(|c| c.text()).unwrap_or_default()
            }
            Self::Tool { content, .. } => content.clone(),
        }
    }

    /// Tool calls carried by an assistant message
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant {
                tool_calls: Some(calls),
                ..
            } => calls,
            _ => &[],
        }
    }
}

// --------------------------------------------------------
// Tools
// --------------------------------------------------------

/// Function metadata inside a tool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescription {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
}

/// Tool definition for function calling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDescription,
}

impl Tool {
    /// Create a function tool definition
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDescription {
                name: name.into(),
                description: Some(description.into()),
                parameters,
            },
        }
    }

    /// Function name of this tool
    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// Name of a function, used when forcing a specific tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionName {
    pub name: String,
}

/// Tool choice modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    None,
    Auto,
    Required,
}

/// How the model may pick tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(ToolChoiceMode),
    Function {
        #[serde(rename = "type")]
        choice_type: String,
        function: FunctionName,
    },
}

/// A function invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_function_type")]
    pub call_type: String,
    pub function: FunctionCall,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

fn default_function_type() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Create a function tool call
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: default_function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
            index: None,
        }
    }
}

// --------------------------------------------------------
// Request
// --------------------------------------------------------

/// Web search plugin (<https://openrouter.ai/docs/web-search>)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebPlugin {
    pub id: String,
    pub max_results: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_prompt: Option<String>,
}

impl WebPlugin {
    pub fn new(max_results: u32, search_prompt: Option<String>) -> Self {
        Self {
            id: "web".to_string(),
            max_results,
            search_prompt,
        }
    }
}

/// Structured output request (<https://openrouter.ai/docs/structured-outputs>)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
    pub json_schema: serde_json::Value,
}

impl ResponseFormat {
    pub fn json_schema(json_schema: serde_json::Value) -> Self {
        Self {
            format_type: "json_schema".to_string(),
            json_schema,
        }
    }
}

/// Provider routing preferences (<https://openrouter.ai/docs/provider-routing>)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_fallbacks: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_parameters: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantizations: Option<Vec<String>>,
}

/// Request envelope for `chat/completions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// An empty list disables the automatic middle-out compression
    #[serde(default)]
    pub transforms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderPreferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<WebPlugin>>,
}

impl Request {
    /// Create a request for a model with the given history
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            response_format: None,
            stop: None,
            stream: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            seed: None,
            tools: None,
            tool_choice: None,
            transforms: Vec::new(),
            provider: None,
            plugins: None,
        }
    }

    /// Add a tool definition
    pub fn add_tool(&mut self, tool: Tool) {
        self.tools.get_or_insert_with(Vec::new).push(tool);
    }

    /// Add a plugin
    pub fn add_plugin(&mut self, plugin: WebPlugin) {
        self.plugins.get_or_insert_with(Vec::new).push(plugin);
    }
}

// --------------------------------------------------------
// Response
// --------------------------------------------------------

/// Error object embedded in choices and error payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Structured API error payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl From<ErrorResponse> for crate::Error {
    fn from(payload: ErrorResponse) -> Self {
        crate::Error::Api {
            code: payload.error.code,
            message: payload.error.message,
            metadata: payload.error.metadata.unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTokenDetails {
    pub cached_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionTokenDetails {
    pub reasoning_tokens: u32,
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokenDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<CompletionTokenDetails>,
}

/// Message inside a response choice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// A completed chat choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonStreamingChoice {
    pub finish_reason: Option<String>,
    pub message: ResponseMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_finish_reason: Option<String>,
}

/// A streaming delta choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingChoice {
    pub finish_reason: Option<String>,
    pub delta: ResponseMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// A non-chat completion choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonChatChoice {
    pub finish_reason: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// One of the choice shapes the API can return
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Choice {
    NonStreaming(NonStreamingChoice),
    Streaming(StreamingChoice),
    NonChat(NonChatChoice),
}

impl Choice {
    /// Tool calls of this choice, if it carries any
    pub fn tool_calls(&self) -> &[ToolCall] {
        let message = match self {
            Choice::NonStreaming(c) => &c.message,
            Choice::Streaming(c) => &c.delta,
            Choice::NonChat(_) => return &[],
        };
        message.tool_calls.as_deref().unwrap_or(&[])
    }

    pub fn as_non_streaming(&self) -> Option<&NonStreamingChoice> {
        match self {
            Choice::NonStreaming(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_non_streaming_mut(&mut self) -> Option<&mut NonStreamingChoice> {
        match self {
            Choice::NonStreaming(c) => Some(c),
            _ => None,
        }
    }
}

/// Response envelope for `chat/completions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    pub created: i64,
    pub model: String,
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// URLs some models cite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<String>>,
    /// Provider that actually served the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl Response {
    /// All tool calls across all choices, in choice order
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.choices
            .iter()
            .flat_map(|c| c.tool_calls().iter().cloned())
            .collect()
    }

    /// The last completed chat choice
    pub fn last_non_streaming_mut(&mut self) -> Option<&mut NonStreamingChoice> {
        self.choices.last_mut().and_then(|c| c.as_non_streaming_mut())
    }
}

// --------------------------------------------------------
// Key info (https://openrouter.ai/docs/limits)
// --------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub label: String,
    pub usage: f64,
    pub limit: Option<f64>,
    #[serde(default)]
    pub limit_remaining: Option<f64>,
    pub is_free_tier: bool,
    #[serde(default)]
    pub rate_limit: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KeyInfoWrap {
    pub data: KeyInfo,
}
