//! Conversation state machine: turns, tool cycles, history and audit log

use std::sync::Arc;

use annot_ai::{
    ACCEPTED_FINISH_REASONS, Choice, ErrorResponse, HttpExchange, Message, MessageContent,
    ProviderPreferences, Request, Response, ToolCall, Transport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::context::{self, Context};
use crate::error::{Error, Result};
use crate::handler::HandlerRegistry;
use crate::queue::{QueueError, RateLimitedQueue};
use crate::turn::{Turn, TurnConfig};

/// Queue in front of the model endpoint
pub type LlmQueue = RateLimitedQueue<HttpExchange, annot_ai::Error>;

/// What to ask, of which model, in which steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub model: String,
    /// Providers to use, in this order, without fallbacks. Unset lets the
    /// endpoint decide.
    #[serde(default)]
    pub providers: Option<Vec<String>>,
    #[serde(default)]
    pub turns: Vec<TurnConfig>,
}

/// A transport behind the shared queue
#[derive(Clone)]
pub struct LlmClient {
    transport: Arc<dyn Transport>,
    queue: Arc<LlmQueue>,
}

impl LlmClient {
    pub fn new(transport: Arc<dyn Transport>, queue: Arc<LlmQueue>) -> Self {
        Self { transport, queue }
    }

    /// Send a request through the queue, retrying per its policy
    pub async fn send(
        &self,
        request: Request,
    ) -> std::result::Result<HttpExchange, QueueError<annot_ai::Error>> {
        let request = Arc::new(request);
        let transport = Arc::clone(&self.transport);
        self.queue
            .enqueue(move || {
                let transport = Arc::clone(&transport);
                let request = Arc::clone(&request);
                async move { transport.send(&request).await }
            })
            .await
    }
}

/// Where a conversation is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    NotStarted,
    Running { turn: usize },
    ToolCycle { turn: usize },
    Succeeded,
    Failed,
}

/// Everything a conversation leaves behind for offline inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub context: Context,
    /// Message history as the model saw it, plus an error marker on failure
    pub conversation: Vec<Message>,
    /// Raw HTTP exchanges, in order
    pub payloads: Vec<HttpExchange>,
}

/// One dialogue with the model about one publication.
///
/// Turns run strictly in sequence. When a reply carries tool calls, the same
/// turn is repeated as a tool cycle with the tool answers appended, until a
/// reply carries none.
pub struct Conversation {
    id: String,
    trial: usize,
    model: String,
    providers: Option<Vec<String>>,
    turns: Vec<Turn>,
    llm: LlmClient,
    context: Context,
    messages: Vec<Message>,
    http_history: Vec<HttpExchange>,
    state: ConversationState,
}

impl Conversation {
    /// Build the turns and set up the context
    pub fn new(
        id: impl Into<String>,
        trial: usize,
        context: Context,
        config: &ConversationConfig,
        registry: &HandlerRegistry,
        llm: LlmClient,
    ) -> Result<Self> {
        let turns = config
            .turns
            .iter()
            .map(|turn| Turn::from_config(turn, registry))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: id.into(),
            trial,
            model: config.model.clone(),
            providers: config.providers.clone(),
            turns,
            llm,
            context,
            messages: Vec::new(),
            http_history: Vec::new(),
            state: ConversationState::NotStarted,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trial(&self) -> usize {
        self.trial
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn http_history(&self) -> &[HttpExchange] {
        &self.http_history
    }

    /// Run every turn. Returns false if the conversation failed; the cause
    /// is then the last message of the history.
    pub async fn converse(&mut self) -> bool {
        let span = tracing::info_span!("conversation", id = %self.id, trial = self.trial as u64);
        self.run().instrument(span).await
    }

    async fn run(&mut self) -> bool {
        tracing::info!("Starting conversation");

        match self.run_turns().await {
            Ok(()) => {
                tracing::info!("Conversation ended");
                self.context.insert(context::SUCCEEDED, Value::Bool(true));
                self.state = ConversationState::Succeeded;
                true
            }
            Err(error) => {
                tracing::error!("Conversation failed with error: {}", error);
                self.context.insert(context::SUCCEEDED, Value::Bool(false));
                self.messages
                    .push(Message::system(format!("[Error] {error}")));
                self.state = ConversationState::Failed;
                false
            }
        }
    }

    async fn run_turns(&mut self) -> Result<()> {
        let turns = std::mem::take(&mut self.turns);
        let mut result = Ok(());
        for (index, turn) in turns.iter().enumerate() {
            if let Err(error) = self.handle_turn(index, turn).await {
                result = Err(error);
                break;
            }
        }
        self.turns = turns;
        result
    }

    async fn handle_turn(&mut self, index: usize, turn: &Turn) -> Result<()> {
        let mut is_tool_cycle = false;
        loop {
            self.state = if is_tool_cycle {
                ConversationState::ToolCycle { turn: index }
            } else {
                ConversationState::Running { turn: index }
            };

            let request = turn
                .prepare_request(self.create_request(), &mut self.context, is_tool_cycle)
                .await?;
            // The history is whatever the request handlers made of it
            self.messages = request.messages.clone();

            let response = self.communicate(request).await?;
            let response = turn
                .parse_response(response, &mut self.context, is_tool_cycle)
                .await?;
            self.append_choices(&response.choices)?;

            let tool_calls = response.tool_calls();
            if tool_calls.is_empty() {
                return Ok(());
            }
            self.add_tool_messages(&tool_calls)?;
            is_tool_cycle = true;
        }
    }

    /// A request for the current history with the routing defaults
    fn create_request(&self) -> Request {
        let mut provider = ProviderPreferences {
            require_parameters: Some(true),
            ..Default::default()
        };
        if let Some(order) = &self.providers {
            provider.allow_fallbacks = Some(false);
            provider.order = Some(order.clone());
        }

        let mut request = Request::new(self.model.clone(), self.messages.clone());
        request.provider = Some(provider);
        request
    }

    /// Send through the queue and turn the exchange into a validated
    /// response. Every exchange is audited, failed ones included.
    async fn communicate(&mut self, request: Request) -> Result<Response> {
        tracing::debug!("Communicating with the model endpoint");

        let exchange = match self.llm.send(request).await {
            Ok(exchange) => exchange,
            Err(QueueError::Operation(error)) => {
                let Some(exchange) = error.exchange().cloned() else {
                    return Err(error.into());
                };
                self.record_exchange(exchange.clone());
                // A structured error body says more than the status code
                return Err(match api_error(&exchange.response_body) {
                    Some(api) => api.into(),
                    None => error.into(),
                });
            }
            Err(other) => return Err(other.into()),
        };

        self.record_exchange(exchange.clone());
        let response = extract_response(&exchange.response_body)?;
        if let Some(usage) = &response.usage {
            self.context.push(context::USAGE, serde_json::to_value(usage)?);
        }
        Ok(response)
    }

    fn record_exchange(&mut self, exchange: HttpExchange) {
        tracing::info!(
            "Received response ({}) after {:.2} seconds",
            exchange.status_code,
            exchange.elapsed_time
        );
        self.context
            .push(context::HTTP_ELAPSED_TIME, Value::from(exchange.elapsed_time));
        self.http_history.push(exchange);
    }

    /// Turn completed choices into assistant messages
    fn append_choices(&mut self, choices: &[Choice]) -> Result<()> {
        for choice in choices {
            let Some(choice) = choice.as_non_streaming() else {
                tracing::warn!("Found unhandled choice type, skipping");
                continue;
            };
            match choice.message.role.as_deref() {
                Some("assistant") | None => self.messages.push(Message::Assistant {
                    content: choice.message.content.clone().map(MessageContent::Text),
                    tool_calls: choice.message.tool_calls.clone(),
                }),
                Some(role) => {
                    return Err(Error::Protocol(format!(
                        "Unhandled message role in choice: {role}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Append one tool message per call, answered from the context. All
    /// answers must be present before anything is appended.
    fn add_tool_messages(&mut self, tool_calls: &[ToolCall]) -> Result<()> {
        let answers = tool_calls
            .iter()
            .map(|call| {
                self.context
                    .tool_result(&call.id)
                    .map(|answer| Message::tool(&call.id, &call.function.name, answer))
                    .ok_or_else(|| Error::MissingToolResult(call.id.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("Added {} tool messages to history", answers.len());
        self.messages.extend(answers);
        Ok(())
    }

    /// Snapshot of context, history and audit log
    pub fn to_record(&self) -> ConversationRecord {
        tracing::debug!(
            id = %self.id,
            "Converting to record. {} messages and {} payloads.",
            self.messages.len(),
            self.http_history.len()
        );
        ConversationRecord {
            context: self.context.clone(),
            conversation: self.messages.clone(),
            payloads: self.http_history.clone(),
        }
    }
}

fn api_error(body: &Value) -> Option<annot_ai::Error> {
    serde_json::from_value::<ErrorResponse>(body.clone())
        .ok()
        .map(Into::into)
}

/// Parse and validate a response body
fn extract_response(body: &Value) -> Result<Response> {
    let response: Response = match serde_json::from_value(body.clone()) {
        Ok(response) => response,
        Err(parse_error) => {
            if let Some(api) = api_error(body) {
                return Err(api.into());
            }
            tracing::error!("Unexpected response from the model endpoint: {}", body);
            return Err(Error::Protocol(format!("Unexpected response: {parse_error}")));
        }
    };

    if response.choices.is_empty() {
        return Err(Error::Protocol("Response contains no choices".to_string()));
    }

    for choice in &response.choices {
        let Some(choice) = choice.as_non_streaming() else {
            return Err(Error::Protocol(
                "Choice in response is of unexpected type".to_string(),
            ));
        };
        if let Some(error) = &choice.error {
            return Err(Error::Protocol(format!(
                "Choice error: {}: {}",
                error.code, error.message
            )));
        }
        let finish_reason = choice.finish_reason.as_deref().unwrap_or_default();
        if !ACCEPTED_FINISH_REASONS.contains(&finish_reason) {
            return Err(Error::Protocol(format!(
                "Unexpected finish reason: {} (native: {})",
                choice.finish_reason.as_deref().unwrap_or("none"),
                choice.native_finish_reason.as_deref().unwrap_or("none")
            )));
        }
    }

    Ok(response)
}
