//! Restricted template rendering
//!
//! Phase instructions, turn prompts, deterministic inputs, and declarative
//! tool fields all render through one handlebars instance configured for
//! strict lookups: an unresolved variable is an error, not an empty string.
//! Partials are rejected up front - templates are data, and data must not
//! be able to pull other templates in.

use handlebars::Handlebars;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors raised during template rendering
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template error: {0}")]
    Parse(#[from] Box<handlebars::TemplateError>),

    #[error("Template render error: {0}")]
    Render(#[from] Box<handlebars::RenderError>),

    #[error("Forbidden template operation: {0}")]
    Forbidden(String),
}

/// Syntax that would reach outside the provided variable scope
const FORBIDDEN_MARKERS: &[(&str, &str)] = &[
    ("{{>", "partial include"),
    ("{{#>", "partial block"),
    ("{{#*", "inline partial definition"),
];

/// Strict-mode handlebars wrapper shared by the whole engine
pub struct TemplateEngine {
    hb: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut hb = Handlebars::new();
        hb.set_strict_mode(true);
        hb.register_escape_fn(handlebars::no_escape);
        Self { hb }
    }

    /// Render a template string against a JSON data scope
    pub fn render(&self, template: &str, data: &Value) -> Result<String, TemplateError> {
        check_forbidden(template)?;
        self.hb
            .render_template(template, data)
            .map_err(|e| TemplateError::Render(Box::new(e)))
    }

    /// Render every string leaf of a JSON value tree
    ///
    /// Used for deterministic phase `inputs` and declarative tool bodies,
    /// where templates may appear arbitrarily deep in the config.
    pub fn render_value(&self, value: &Value, data: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => {
                if s.contains("{{") {
                    Ok(Value::String(self.render(s, data)?))
                } else {
                    Ok(value.clone())
                }
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.render_value(item, data)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.render_value(item, data)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn check_forbidden(template: &str) -> Result<(), TemplateError> {
    for (marker, what) in FORBIDDEN_MARKERS {
        if template.contains(marker) {
            debug!(%what, "template rejected");
            return Err(TemplateError::Forbidden((*what).to_string()));
        }
    }
    Ok(())
}
