//! annot-agent: Rate-limited conversation engine
//!
//! This crate drives structured multi-turn dialogues with a chat-completions
//! endpoint. Every call goes through a shared, adaptive, rate-limited queue;
//! each dialogue runs configured turns whose request and response handler
//! chains share a per-conversation context.

pub mod context;
pub mod conversation;
pub mod entity;
pub mod error;
pub mod experiment;
pub mod handler;
pub mod handlers;
pub mod queue;
pub mod rate;
pub mod turn;

pub use context::Context;
pub use conversation::{
    Conversation, ConversationConfig, ConversationRecord, ConversationState, LlmClient, LlmQueue,
};
pub use entity::{EntityLookup, EntityQuery, QueuedEntityLookup};
pub use error::{Direction, Error, Result};
pub use experiment::{EndpointConfig, Experiment, ExperimentConfig, ExperimentSummary, Publication};
pub use handler::{BoxedHandler, Handler, HandlerRegistry, HandlerSpec};
pub use queue::{QueueConfig, QueueError, RateLimitedQueue};
pub use rate::{Adjustment, RateController};
pub use turn::{Turn, TurnConfig};
