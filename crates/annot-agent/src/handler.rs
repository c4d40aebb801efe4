//! Handler trait and the registry that builds handlers from configuration

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use annot_ai::{Request, Response};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::Context;
use crate::entity::EntityLookup;
use crate::error::{Direction, Error, Result};
use crate::handlers::{
    AddUserMessage, EntityLookupToolUse, FencedJsonBlock, StructuredOutput, WebSearch,
};

/// One composable step of request or response transformation.
///
/// Handlers usually act in one direction only; the default implementations
/// reject the call so a handler placed in the wrong chain fails loudly.
/// `is_tool_cycle` is true on the repeated pass of a turn after the model
/// asked for tools.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Registered type id, used in error messages
    fn name(&self) -> &str;

    async fn handle_request(
        &self,
        request: Request,
        context: &mut Context,
        is_tool_cycle: bool,
    ) -> Result<Request> {
        let _ = (request, context, is_tool_cycle);
        Err(Error::unsupported(self.name(), Direction::Request))
    }

    async fn handle_response(
        &self,
        response: Response,
        context: &mut Context,
        is_tool_cycle: bool,
    ) -> Result<Response> {
        let _ = (response, context, is_tool_cycle);
        Err(Error::unsupported(self.name(), Direction::Response))
    }
}

pub type BoxedHandler = Box<dyn Handler>;

/// Configuration of one handler: `{ type = "<id>", ...options }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerSpec {
    #[serde(rename = "type")]
    pub handler_type: String,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl HandlerSpec {
    pub fn new(handler_type: impl Into<String>) -> Self {
        Self {
            handler_type: handler_type.into(),
            options: Map::new(),
        }
    }

    /// Add an option
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Deserialize the options into a handler's own config type
    pub fn options<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.options.clone())).map_err(|e| {
            Error::InvalidConfig(format!("{} options: {}", self.handler_type, e))
        })
    }
}

type Constructor = Arc<dyn Fn(&HandlerSpec) -> Result<BoxedHandler> + Send + Sync>;

/// Maps handler type ids to constructors
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    constructors: HashMap<String, Constructor>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

impl HandlerRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in handler.
    ///
    /// `EntityLookupToolUse` can only be built when a lookup is supplied.
    pub fn with_builtins(lookup: Option<Arc<dyn EntityLookup>>) -> Self {
        let mut registry = Self::new();

        registry.register(AddUserMessage::TYPE, |spec| {
            Ok(Box::new(AddUserMessage::new(spec.options()?)))
        });
        registry.register(WebSearch::TYPE, |spec| {
            Ok(Box::new(WebSearch::new(spec.options()?)))
        });
        registry.register(StructuredOutput::TYPE, |spec| {
            Ok(Box::new(StructuredOutput::new(spec.options()?)?))
        });
        registry.register(FencedJsonBlock::TYPE, |spec| {
            Ok(Box::new(FencedJsonBlock::new(spec.options()?)?))
        });
        registry.register(EntityLookupToolUse::TYPE, move |spec| {
            let lookup = lookup.clone().ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "{} requires an entity lookup service",
                    EntityLookupToolUse::TYPE
                ))
            })?;
            Ok(Box::new(EntityLookupToolUse::new(spec.options()?, lookup)))
        });

        registry
    }

    /// Register a constructor, replacing any previous one for `handler_type`
    pub fn register<F>(&mut self, handler_type: impl Into<String>, constructor: F)
    where
        F: Fn(&HandlerSpec) -> Result<BoxedHandler> + Send + Sync + 'static,
    {
        self.constructors
            .insert(handler_type.into(), Arc::new(constructor));
    }

    pub fn contains(&self, handler_type: &str) -> bool {
        self.constructors.contains_key(handler_type)
    }

    /// Build a handler from its configuration
    pub fn build(&self, spec: &HandlerSpec) -> Result<BoxedHandler> {
        let constructor = self
            .constructors
            .get(&spec.handler_type)
            .ok_or_else(|| Error::UnknownHandler(spec.handler_type.clone()))?;
        constructor(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        fn name(&self) -> &str {
            "Noop"
        }
    }

    #[tokio::test]
    async fn test_default_methods_reject_both_directions() {
        let mut ctx = Context::new();
        let err = Noop
            .handle_request(Request::new("m", vec![]), &mut ctx, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedDirection {
                direction: Direction::Request,
                ..
            }
        ));
    }

    #[test]
    fn test_spec_from_toml_flattens_options() {
        let spec: HandlerSpec = toml::from_str(
            r#"
            type = "WebSearch"
            max_results = 5
            "#,
        )
        .unwrap();
        assert_eq!(spec.handler_type, "WebSearch");
        assert_eq!(spec.options.get("max_results"), Some(&json!(5)));
    }

    #[test]
    fn test_build_unknown_type() {
        let registry = HandlerRegistry::with_builtins(None);
        let err = registry.build(&HandlerSpec::new("Nope")).err().unwrap();
        assert!(matches!(err, Error::UnknownHandler(t) if t == "Nope"));
    }

    #[test]
    fn test_builtins_registered() {
        let registry = HandlerRegistry::with_builtins(None);
        for t in [
            "AddUserMessage",
            "WebSearch",
            "EntityLookupToolUse",
            "StructuredOutput",
            "FencedJsonBlock",
        ] {
            assert!(registry.contains(t), "{t} missing");
        }
    }

    #[test]
    fn test_entity_lookup_requires_service() {
        let registry = HandlerRegistry::with_builtins(None);
        let err = registry
            .build(&HandlerSpec::new("EntityLookupToolUse"))
            .err()
            .unwrap();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_bad_options_rejected() {
        let registry = HandlerRegistry::with_builtins(None);
        let spec = HandlerSpec::new("WebSearch").with("max_results", json!("many"));
        let err = registry.build(&spec).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = HandlerRegistry::new();
        registry.register("Noop", |_| Ok(Box::new(Noop)));
        assert_eq!(registry.build(&HandlerSpec::new("Noop")).unwrap().name(), "Noop");
    }
}
