//! Tool trait and invocation result shape

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::ToolError;
use super::context::ToolInvocation;

/// A tool that can be called from a turn loop or deterministic phase
///
/// Schemas are declared as data, adjacent to the handler - there is no
/// runtime introspection of closures.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (matches the model's tool_use name)
    fn name(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> &str;

    /// JSON Schema for input arguments
    fn input_schema(&self) -> Value;

    /// Context parameters (`_`-prefixed names) this handler wants injected
    fn context_params(&self) -> &[&str] {
        &[]
    }

    /// Execute the tool
    async fn invoke(&self, args: Value, ctx: &ToolInvocation) -> Result<ToolOutput, ToolError>;
}

/// Result of a tool invocation, with reserved keys lifted out
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// The JSON-compatible result stored in the log and shown to the model
    pub content: Value,
    /// Image file paths the result references
    pub images: Vec<PathBuf>,
    /// Routing sentinel (`_route`), stripped from content
    pub route: Option<String>,
    /// Status key, used by deterministic phase routing tables
    pub status: Option<String>,
}

impl ToolOutput {
    /// Plain text result
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Value::String(content.into()),
            ..Default::default()
        }
    }

    /// Interpret a raw handler return value, lifting the reserved keys
    /// `content`, `images`, `_route` and `status`
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self {
                content: value,
                ..Default::default()
            };
        };

        let route = map.remove("_route").and_then(|v| v.as_str().map(str::to_string));
        let status = map.get("status").and_then(|v| v.as_str().map(str::to_string));
        let images = map
            .remove("images")
            .and_then(|v| v.as_array().cloned())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(PathBuf::from))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let content = match map.remove("content") {
            Some(explicit) if map.is_empty() => explicit,
            Some(explicit) => {
                // Explicit content plus extra keys: keep both
                let mut merged = map;
                merged.insert("content".to_string(), explicit);
                Value::Object(merged)
            }
            None => Value::Object(map),
        };

        Self {
            content,
            images,
            route,
            status,
        }
    }

    /// Rendering of the content for a tool-result message
    pub fn content_string(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Tool backed by a synchronous closure with an explicit schema
///
/// Async tools implement [`Tool`] directly; this covers the common case of
/// in-process helpers.
pub struct FnTool<F> {
    name: String,
    description: String,
    schema: Value,
    context_params: Vec<&'static str>,
    handler: F,
}

impl<F> FnTool<F>
where
    F: Fn(Value) -> Result<Value, ToolError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value, handler: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            context_params: Vec::new(),
            handler,
        }
    }

    /// Declare `_`-prefixed context parameters to inject into arguments
    pub fn with_context_params(mut self, params: &[&'static str]) -> Self {
        self.context_params = params.to_vec();
        self
    }
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(Value) -> Result<Value, ToolError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    fn context_params(&self) -> &[&str] {
        &self.context_params
    }

    async fn invoke(&self, args: Value, _ctx: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        (self.handler)(args).map(ToolOutput::from_value)
    }
}

/// Map of injectable context parameter values for one invocation
pub fn context_param_values(ctx: &ToolInvocation) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("_session_id".to_string(), Value::String(ctx.session_id.clone()));
    map.insert("_phase_name".to_string(), Value::String(ctx.phase_name.clone()));
    map.insert("_trace_id".to_string(), Value::String(ctx.trace_id.clone()));
    map.insert("_outputs".to_string(), Value::Object(ctx.outputs.clone()));
    map.insert("_state".to_string(), Value::Object(ctx.state.clone()));
    map
}
