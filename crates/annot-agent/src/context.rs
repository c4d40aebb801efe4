//! Per-conversation shared state

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Publication text the conversation is about
pub const PUBLICATION: &str = "publication";
/// Optional schema collection
pub const SCHEMA: &str = "schema";
/// Tool call id -> tool answer text
pub const TOOL_CALLS: &str = "tool_calls";
/// Tool call id -> entity lookup arguments and raw results
pub const ENTITY_LOOKUP: &str = "entity_lookup";
/// List of usage objects, one per response that reported usage
pub const USAGE: &str = "usage";
/// List of seconds each HTTP exchange took
pub const HTTP_ELAPSED_TIME: &str = "http_elapsed_time";
/// Whether the conversation finished all turns
pub const SUCCEEDED: &str = "succeeded";

/// Mutable key/value state shared by a conversation and its handlers.
///
/// Keys are namespaced by convention: nested maps such as [`TOOL_CALLS`] are
/// keyed by call id so handlers never overwrite each other's entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(Map<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the context for a conversation about a publication
    pub fn for_publication(publication: impl Into<String>, schema: Option<Value>) -> Self {
        let mut context = Self::new();
        context.insert(PUBLICATION, Value::String(publication.into()));
        if let Some(schema) = schema {
            context.insert(SCHEMA, schema);
        }
        context
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Append to the list stored at `key`, creating it if needed.
    /// A non-list value under `key` is replaced.
    pub fn push(&mut self, key: &str, value: Value) {
        let entry = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(items) = entry {
            items.push(value);
        }
    }

    /// Insert `value` under `id` in the map stored at `namespace`
    pub fn insert_namespaced(&mut self, namespace: &str, id: impl Into<String>, value: Value) {
        let entry = self
            .0
            .entry(namespace.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(id.into(), value);
        }
    }

    /// Look up `id` in the map stored at `namespace`
    pub fn get_namespaced(&self, namespace: &str, id: &str) -> Option<&Value> {
        self.0.get(namespace).and_then(|ns| ns.get(id))
    }

    /// The tool answer stored for a tool call, rendered as text
    pub fn tool_result(&self, call_id: &str) -> Option<String> {
        self.get_namespaced(TOOL_CALLS, call_id).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Store the tool answer for a tool call
    pub fn set_tool_result(&mut self, call_id: impl Into<String>, answer: impl Into<String>) {
        self.insert_namespaced(TOOL_CALLS, call_id, Value::String(answer.into()));
    }

    pub fn succeeded(&self) -> Option<bool> {
        self.0.get(SUCCEEDED).and_then(Value::as_bool)
    }
}

impl From<Map<String, Value>> for Context {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
