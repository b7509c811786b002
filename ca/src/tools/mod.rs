//! Tool system
//!
//! Tools resolve in three flavors: in-process handlers registered on the
//! [`ToolRegistry`], declarative specs (shell/http/native-ref/composite),
//! and sub-cascade tools constructed by the runner. Two synthetic tools are
//! injected by the turn loop rather than registered: `route_to` (dynamic
//! routing) and `set_state` (the only channel that mutates Echo state).

mod context;
mod declarative;
mod error;
mod registry;
mod traits;

pub use context::ToolInvocation;
pub use declarative::{CompositeStep, DeclarativeKind, DeclarativeTool, DeclarativeToolImpl};
pub use error::ToolError;
pub use registry::ToolRegistry;
pub use traits::{FnTool, Tool, ToolOutput, context_param_values};

use serde_json::{Value, json};

use crate::model::{ToolCallRequest, ToolSchema};

/// Name of the synthetic routing tool
pub const ROUTE_TO: &str = "route_to";

/// Name of the synthetic state mutation tool
pub const SET_STATE: &str = "set_state";

/// Schema for the `route_to` tool, constrained to the phase's handoffs
pub fn route_to_schema(handoffs: &[String]) -> ToolSchema {
    ToolSchema {
        name: ROUTE_TO.to_string(),
        description: "Choose the next phase. Call exactly once when you have decided; this ends the current phase."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "target": { "type": "string", "enum": handoffs }
            },
            "required": ["target"]
        }),
    }
}

/// Schema for the `set_state` tool
pub fn set_state_schema() -> ToolSchema {
    ToolSchema {
        name: SET_STATE.to_string(),
        description: "Store a value in session state, visible to later phases as {{state.<key>}}.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "value": {}
            },
            "required": ["key", "value"]
        }),
    }
}

/// Canonical fence for prompt-based tool calling.
///
/// When native tool calling is disabled the system prompt instructs the
/// model to emit:
///
/// ````text
/// ```tool_call
/// {"name": "...", "arguments": {...}}
/// ```
/// ````
///
/// Parsing is strict; anything that does not parse is treated as no tool
/// call and the normal turn-loop termination rules apply.
pub fn parse_tool_call_fence(text: &str) -> Option<ToolCallRequest> {
    let start = text.find("```tool_call")?;
    let after = &text[start + "```tool_call".len()..];
    let end = after.find("```")?;
    let body = after[..end].trim();

    let parsed: Value = serde_json::from_str(body).ok()?;
    let name = parsed.get("name")?.as_str()?.to_string();
    let arguments = parsed.get("arguments").cloned().unwrap_or_else(|| json!({}));
    if !arguments.is_object() {
        return None;
    }

    Some(ToolCallRequest {
        id: format!("fenced_{}", name),
        name,
        arguments,
    })
}

/// Textual tool schema injection for prompt-based tool calling
pub fn render_tool_schemas_prompt(schemas: &[ToolSchema]) -> String {
    let mut out = String::from(
        "You can call tools. To call one, emit exactly one fenced block:\n```tool_call\n{\"name\": \"<tool>\", \
         \"arguments\": {...}}\n```\nAvailable tools:\n",
    );
    for schema in schemas {
        out.push_str(&format!(
            "- {}: {}\n  schema: {}\n",
            schema.name, schema.description, schema.input_schema
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_to_schema_enum() {
        let schema = route_to_schema(&["positive".to_string(), "negative".to_string()]);
        assert_eq!(schema.name, "route_to");
        assert_eq!(schema.input_schema["properties"]["target"]["enum"], json!(["positive", "negative"]));
    }

    #[test]
    fn test_parse_fence_round_trip() {
        let text = "Thinking...\n```tool_call\n{\"name\": \"grep\", \"arguments\": {\"pattern\": \"fn main\"}}\n```\nDone.";
        let call = parse_tool_call_fence(text).unwrap();
        assert_eq!(call.name, "grep");
        assert_eq!(call.arguments["pattern"], "fn main");
    }

    #[test]
    fn test_parse_fence_strictness() {
        // No fence
        assert!(parse_tool_call_fence("just prose").is_none());
        // Unterminated fence
        assert!(parse_tool_call_fence("```tool_call\n{\"name\": \"x\"}").is_none());
        // Malformed JSON
        assert!(parse_tool_call_fence("```tool_call\nnot json\n```").is_none());
        // Missing name
        assert!(parse_tool_call_fence("```tool_call\n{\"arguments\": {}}\n```").is_none());
        // Non-object arguments
        assert!(parse_tool_call_fence("```tool_call\n{\"name\": \"x\", \"arguments\": [1]}\n```").is_none());
    }

    #[test]
    fn test_parse_fence_defaults_empty_arguments() {
        let call = parse_tool_call_fence("```tool_call\n{\"name\": \"list\"}\n```").unwrap();
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn test_schema_prompt_mentions_tools() {
        let prompt = render_tool_schemas_prompt(&[route_to_schema(&["a".to_string()])]);
        assert!(prompt.contains("route_to"));
        assert!(prompt.contains("```tool_call"));
    }
}
