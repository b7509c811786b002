//! Declarative tools - shell / http / native-ref / composite specs
//!
//! A declarative spec is data in the cascade's tool manifest; registering it
//! builds a [`Tool`] whose handler renders the spec's templates against the
//! call arguments and executes. Composite steps run sequentially with each
//! prior step's result available to later templates.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::parse_timeout;
use crate::template::TemplateEngine;

use super::context::ToolInvocation;
use super::traits::{Tool, ToolOutput};
use super::ToolError;

/// Declarative tool spec as it appears in config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeclarativeTool {
    pub tool_id: String,
    #[serde(rename = "type")]
    pub kind: DeclarativeKind,
    #[serde(default)]
    pub description: Option<String>,
    pub inputs_schema: Value,

    // shell
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    // http
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// JSON Pointer applied to the response body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_pointer: Option<String>,

    // python (native-ref)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_path: Option<String>,

    // composite
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<CompositeStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarativeKind {
    Shell,
    Http,
    Python,
    Composite,
}

/// One step of a composite tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompositeStep {
    pub tool: String,
    #[serde(default)]
    pub inputs: Value,
    /// Template rendering to "true"/"false"; skipped steps yield null
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl DeclarativeTool {
    /// Structural check before registration
    pub fn validate(&self) -> Result<(), ToolError> {
        let field_required = |field: Option<&str>, name: &str| {
            field
                .map(|_| ())
                .ok_or_else(|| ToolError::usage(&self.tool_id, format!("{} spec requires '{}'", kind_name(self.kind), name)))
        };

        match self.kind {
            DeclarativeKind::Shell => field_required(self.command.as_deref(), "command"),
            DeclarativeKind::Http => field_required(self.url.as_deref(), "url"),
            DeclarativeKind::Python => field_required(self.import_path.as_deref(), "import_path"),
            DeclarativeKind::Composite => {
                if self.steps.is_empty() {
                    Err(ToolError::usage(&self.tool_id, "composite spec requires at least one step"))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Build the runnable tool
    pub fn build(self) -> Result<DeclarativeToolImpl, ToolError> {
        self.validate()?;
        Ok(DeclarativeToolImpl {
            engine: TemplateEngine::new(),
            http: reqwest::Client::new(),
            spec: self,
        })
    }
}

fn kind_name(kind: DeclarativeKind) -> &'static str {
    match kind {
        DeclarativeKind::Shell => "shell",
        DeclarativeKind::Http => "http",
        DeclarativeKind::Python => "python",
        DeclarativeKind::Composite => "composite",
    }
}

/// Runnable declarative tool
pub struct DeclarativeToolImpl {
    spec: DeclarativeTool,
    engine: TemplateEngine,
    http: reqwest::Client,
}

#[async_trait]
impl Tool for DeclarativeToolImpl {
    fn name(&self) -> &str {
        &self.spec.tool_id
    }

    fn description(&self) -> &str {
        self.spec.description.as_deref().unwrap_or("Declarative tool")
    }

    fn input_schema(&self) -> Value {
        self.spec.inputs_schema.clone()
    }

    async fn invoke(&self, args: Value, ctx: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        match self.spec.kind {
            DeclarativeKind::Shell => self.invoke_shell(&args).await,
            DeclarativeKind::Http => self.invoke_http(&args).await,
            DeclarativeKind::Python => self.invoke_native(args, ctx).await,
            DeclarativeKind::Composite => self.invoke_composite(&args, ctx).await,
        }
    }
}

impl DeclarativeToolImpl {
    fn render_scope(args: &Value) -> Value {
        json!({ "args": args })
    }

    fn render(&self, template: &str, scope: &Value) -> Result<String, ToolError> {
        self.engine
            .render(template, scope)
            .map_err(|e| ToolError::usage(&self.spec.tool_id, e.to_string()))
    }

    async fn invoke_shell(&self, args: &Value) -> Result<ToolOutput, ToolError> {
        let scope = Self::render_scope(args);
        let command = self.render(self.spec.command.as_deref().unwrap_or_default(), &scope)?;
        let timeout = match &self.spec.timeout {
            Some(spec) => parse_timeout(spec).map_err(|e| ToolError::usage(&self.spec.tool_id, e.to_string()))?,
            None => Duration::from_secs(60),
        };

        debug!(tool = %self.spec.tool_id, %command, "declarative shell: executing");
        let start = Instant::now();
        let output = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("sh").arg("-c").arg(&command).output(),
        )
        .await
        .map_err(|_| ToolError::Timeout {
            tool: self.spec.tool_id.clone(),
            timeout,
        })?
        .map_err(|e| ToolError::io(&self.spec.tool_id, e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::failed(
                &self.spec.tool_id,
                format!("exit code {}: {}", output.status.code().unwrap_or(-1), stderr.trim()),
            ));
        }

        debug!(tool = %self.spec.tool_id, duration_ms = start.elapsed().as_millis() as u64, "declarative shell: done");
        let content = serde_json::from_str(&stdout).unwrap_or(Value::String(stdout.trim_end().to_string()));
        Ok(ToolOutput::from_value(content))
    }

    async fn invoke_http(&self, args: &Value) -> Result<ToolOutput, ToolError> {
        let scope = Self::render_scope(args);
        let url = self.render(self.spec.url.as_deref().unwrap_or_default(), &scope)?;
        let method: reqwest::Method = self
            .spec
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_uppercase()
            .parse()
            .map_err(|_| ToolError::usage(&self.spec.tool_id, "invalid HTTP method"))?;

        let mut request = self.http.request(method, &url);
        if let Some(headers) = &self.spec.headers {
            for (name, value) in headers {
                let rendered = self.render(value.as_str().unwrap_or_default(), &scope)?;
                request = request.header(name.as_str(), rendered);
            }
        }
        if let Some(body) = &self.spec.body {
            let rendered = self
                .engine
                .render_value(body, &scope)
                .map_err(|e| ToolError::usage(&self.spec.tool_id, e.to_string()))?;
            request = request.json(&rendered);
        }

        debug!(tool = %self.spec.tool_id, %url, "declarative http: sending");
        let response = request
            .send()
            .await
            .map_err(|e| ToolError::io(&self.spec.tool_id, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::failed(&self.spec.tool_id, format!("HTTP {}", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::io(&self.spec.tool_id, e.to_string()))?;

        let content = match &self.spec.response_pointer {
            Some(pointer) => body
                .pointer(pointer)
                .cloned()
                .ok_or_else(|| ToolError::failed(&self.spec.tool_id, format!("response pointer '{}' matched nothing", pointer)))?,
            None => body,
        };
        Ok(ToolOutput::from_value(content))
    }

    /// `python` specs are named indirections to registered native functions
    async fn invoke_native(&self, args: Value, ctx: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        let target = self.spec.import_path.as_deref().unwrap_or_default();
        let tool = ctx
            .registry
            .get(target)
            .ok_or_else(|| ToolError::Unknown { name: target.to_string() })?;
        tool.invoke(args, ctx).await
    }

    async fn invoke_composite(&self, args: &Value, ctx: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        let mut step_results: Vec<Value> = Vec::with_capacity(self.spec.steps.len());
        let mut last: Option<ToolOutput> = None;

        for (index, step) in self.spec.steps.iter().enumerate() {
            ctx.cancel
                .check()
                .map_err(|_| ToolError::failed(&self.spec.tool_id, "cancelled"))?;

            let scope = json!({
                "args": args,
                "steps": step_results.iter().map(|r| json!({"result": r})).collect::<Vec<_>>(),
            });

            if let Some(condition) = &step.condition {
                let rendered = self.render(condition, &scope)?;
                let truthy = matches!(rendered.trim().to_lowercase().as_str(), "true" | "1" | "yes");
                if !truthy {
                    debug!(tool = %self.spec.tool_id, step = index, "composite: step skipped");
                    step_results.push(Value::Null);
                    continue;
                }
            }

            let inputs = if step.inputs.is_null() {
                json!({})
            } else {
                self.engine
                    .render_value(&step.inputs, &scope)
                    .map_err(|e| ToolError::usage(&self.spec.tool_id, e.to_string()))?
            };

            let output = ctx.registry.invoke(&step.tool, inputs, ctx).await?;
            step_results.push(output.content.clone());
            last = Some(output);
        }

        Ok(last.unwrap_or_default())
    }
}
