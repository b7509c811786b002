//! ToolRegistry - name -> invocable descriptor resolution
//!
//! Three flavors resolve here: in-process handlers registered directly,
//! declarative specs built into handlers at registration, and sub-cascade
//! tools constructed by the runner. Arguments are validated against the
//! tool's schema before dispatch; declared context parameters are injected
//! afterwards so schemas stay caller-facing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::model::ToolSchema;

use super::context::ToolInvocation;
use super::traits::{Tool, ToolOutput, context_param_values};
use super::ToolError;

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; later registrations replace earlier ones
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(%name, "ToolRegistry: register");
        self.tools.write().unwrap().insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().unwrap().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.read().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for every registered tool, sorted by name
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let tools = self.tools.read().unwrap();
        let mut entries: Vec<&Arc<dyn Tool>> = tools.values().collect();
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        entries
            .into_iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Schemas for a named subset, preserving request order
    pub fn schemas_for(&self, names: &[String]) -> Result<Vec<ToolSchema>, ToolError> {
        let tools = self.tools.read().unwrap();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let tool = tools
                .get(name)
                .ok_or_else(|| ToolError::Unknown { name: name.clone() })?;
            out.push(ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            });
        }
        Ok(out)
    }

    /// Validate arguments against a tool's input schema
    pub fn validate_args(tool_name: &str, schema: &Value, args: &Value) -> Result<(), ToolError> {
        jsonschema::validate(schema, args).map_err(|e| ToolError::usage(tool_name, e.to_string()))
    }

    /// Resolve, validate, inject context parameters, and invoke
    pub async fn invoke(&self, name: &str, args: Value, ctx: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::Unknown { name: name.to_string() })?;

        Self::validate_args(name, &tool.input_schema(), &args)?;

        let args = inject_context_params(args, tool.context_params(), ctx);
        debug!(tool = %name, "ToolRegistry: invoking");
        tool.invoke(args, ctx).await
    }
}

/// Merge declared `_`-prefixed context parameters into the argument object,
/// without clobbering values the caller already set
fn inject_context_params(args: Value, declared: &[&str], ctx: &ToolInvocation) -> Value {
    if declared.is_empty() {
        return args;
    }

    let mut map = match args {
        Value::Object(map) => map,
        other => {
            // Non-object args cannot carry injected parameters
            return other;
        }
    };

    let available = context_param_values(ctx);
    for name in declared {
        if !map.contains_key(*name)
            && let Some(value) = available.get(*name)
        {
            map.insert((*name).to_string(), value.clone());
        }
    }
    Value::Object(map)
}
