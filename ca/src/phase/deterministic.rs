//! Deterministic phases - code/SQL/shell invocations
//!
//! The `run` reference resolves to a registered tool, a registered native
//! function (`python:` prefix), a template-rendered SQL file handed to the
//! registered `sql` runner, or a template-rendered shell script. Inputs
//! render recursively; context parameters (`_session_id` and friends) are
//! injected when not already set; retries follow the phase's backoff
//! config, each attempt honoring the full timeout.

use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::config::{Phase, RetryConfig, RunTarget, parse_timeout};
use crate::echo::Echo;
use crate::error::CascadeError;
use crate::model::TokenUsage;
use crate::runtime::RunContext;
use crate::template::TemplateEngine;
use crate::tools::{ToolError, ToolInvocation, ToolOutput};
use echolog::{EventRecord, EventSink, NodeType, TraceNode};

/// Result of one deterministic body execution
#[derive(Debug, Clone)]
pub struct DeterministicResult {
    pub output: Value,
    pub route: Option<String>,
    pub usage: TokenUsage,
    pub cost: f64,
}

pub async fn run_deterministic(
    ctx: &RunContext,
    phase: &Phase,
    echo: &mut Echo,
    input: &Value,
    phase_node: &TraceNode,
) -> Result<DeterministicResult, CascadeError> {
    let run = phase.run.as_deref().unwrap_or_default();
    let target = RunTarget::parse(run);
    let engine = TemplateEngine::new();

    // Render inputs, then inject context parameters not already set
    let scope = echo.template_scope(input);
    let rendered = match &phase.inputs {
        Some(inputs) => engine.render_value(inputs, &scope)?,
        None => json!({}),
    };
    let mut args = match rendered {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(CascadeError::Config(format!(
                "Phase '{}' inputs must render to an object, got {}",
                phase.name, other
            )));
        }
    };
    inject_context_params(&mut args, phase, echo, phase_node);

    let timeout = phase.timeout.as_deref().map(parse_timeout).transpose()?;
    let retry = phase.retry.clone().unwrap_or(RetryConfig {
        max_attempts: 1,
        ..Default::default()
    });

    let mut last_error: Option<CascadeError> = None;
    for attempt in 0..retry.max_attempts {
        ctx.cancel.check()?;
        if attempt > 0 {
            let delay = retry.delay_for_attempt(attempt - 1);
            debug!(phase = %phase.name, attempt, ?delay, "deterministic retry backoff");
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(CascadeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match execute_target(ctx, phase, echo, &target, &args, timeout, phase_node, attempt).await {
            Ok(output) => {
                let route = resolve_routing(phase, &output)?;
                info!(phase = %phase.name, attempt, "deterministic phase succeeded");
                return Ok(DeterministicResult {
                    output: output.content,
                    route,
                    usage: TokenUsage::default(),
                    cost: 0.0,
                });
            }
            Err(CascadeError::Tool(e)) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                warn!(phase = %phase.name, attempt, error = %e, "deterministic attempt failed, will retry");
                last_error = Some(CascadeError::Tool(e));
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| CascadeError::validation(&phase.name, "retry budget exhausted")))
}

fn inject_context_params(args: &mut Map<String, Value>, phase: &Phase, echo: &Echo, phase_node: &TraceNode) {
    let known: [(&str, Value); 5] = [
        ("_session_id", Value::String(echo.session_id.clone())),
        ("_phase_name", Value::String(phase.name.clone())),
        ("_trace_id", Value::String(phase_node.trace_id.clone())),
        ("_outputs", Value::Object(echo.outputs.clone())),
        ("_state", Value::Object(echo.state.clone())),
    ];
    for (name, value) in known {
        if !args.contains_key(name) {
            args.insert(name.to_string(), value);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_target(
    ctx: &RunContext,
    phase: &Phase,
    echo: &Echo,
    target: &RunTarget,
    args: &Map<String, Value>,
    timeout: Option<Duration>,
    phase_node: &TraceNode,
    attempt: u32,
) -> Result<ToolOutput, CascadeError> {
    let call_node = phase_node.child(NodeType::ToolCall);
    ctx.sink
        .append(
            EventRecord::new(&echo.session_id, &call_node)
                .with_phase(&phase.name)
                .with_attempt(attempt + 1)
                .with_content(json!({"run": phase.run, "arguments": args}))
                .with_semantic_actor("deterministic"),
        )
        .await?;

    let invocation = ToolInvocation::new(&echo.session_id, &phase.name, call_node.trace_id.clone(), ctx.tools.clone())
        .with_snapshots(echo.state.clone(), echo.outputs.clone())
        .with_cancel(ctx.cancel.clone())
        .with_depth(echo.depth);

    let execution = async {
        match target {
            RunTarget::Tool(name) | RunTarget::Native(name) => {
                ctx.tools
                    .invoke(name, Value::Object(args.clone()), &invocation)
                    .await
                    .map_err(CascadeError::Tool)
            }
            RunTarget::Sql(path) => {
                let query = render_file(path, args)?;
                // The analytic engine is an external collaborator reached
                // through the registered `sql` tool
                ctx.tools
                    .invoke("sql", json!({"query": query}), &invocation)
                    .await
                    .map_err(CascadeError::Tool)
            }
            RunTarget::Shell(path) => run_shell_script(path, args, timeout).await,
        }
    };

    let result = match timeout {
        // Shell handles its own timeout so the subprocess gets killed
        Some(limit) if !matches!(target, RunTarget::Shell(_)) => {
            match tokio::time::timeout(limit, execution).await {
                Ok(result) => result,
                Err(_) => Err(CascadeError::Tool(ToolError::Timeout {
                    tool: phase.run.clone().unwrap_or_default(),
                    timeout: limit,
                })),
            }
        }
        _ => execution.await,
    };

    let result_node = call_node.child(NodeType::ToolResult);
    match &result {
        Ok(output) => {
            ctx.sink
                .append(
                    EventRecord::new(&echo.session_id, &result_node)
                        .with_phase(&phase.name)
                        .with_attempt(attempt + 1)
                        .with_role_content("tool", output.content.clone())
                        .with_semantic_actor("deterministic"),
                )
                .await?;
        }
        Err(e) => {
            ctx.sink
                .append(
                    EventRecord::new(&echo.session_id, &result_node)
                        .with_phase(&phase.name)
                        .with_attempt(attempt + 1)
                        .with_content(json!({"error": e.to_string()}))
                        .with_metadata("is_error", true)
                        .with_semantic_actor("deterministic"),
                )
                .await?;
        }
    }

    result
}

fn render_file(path: &str, args: &Map<String, Value>) -> Result<String, CascadeError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CascadeError::Config(format!("Cannot read run target '{}': {}", path, e)))?;
    let engine = TemplateEngine::new();
    Ok(engine.render(&raw, &json!({"args": args}))?)
}

async fn run_shell_script(
    path: &str,
    args: &Map<String, Value>,
    timeout: Option<Duration>,
) -> Result<ToolOutput, CascadeError> {
    let script = render_file(path, args)?;
    let limit = timeout.unwrap_or(Duration::from_secs(300));

    let output = tokio::time::timeout(
        limit,
        tokio::process::Command::new("sh").arg("-c").arg(&script).output(),
    )
    .await
    .map_err(|_| {
        CascadeError::Tool(ToolError::Timeout {
            tool: path.to_string(),
            timeout: limit,
        })
    })?
    .map_err(|e| CascadeError::Tool(ToolError::io(path, e.to_string())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CascadeError::Tool(ToolError::failed(
            path,
            format!("exit code {}: {}", output.status.code().unwrap_or(-1), stderr.trim()),
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let content = serde_json::from_str(&stdout).unwrap_or(Value::String(stdout.trim_end().to_string()));
    Ok(ToolOutput::from_value(content))
}

/// Routing: `_route` sentinel first, then the `status` routing table
fn resolve_routing(phase: &Phase, output: &ToolOutput) -> Result<Option<String>, CascadeError> {
    if let Some(route) = &output.route {
        if !phase.handoffs.contains(route) {
            return Err(CascadeError::Routing(format!(
                "_route '{}' is not a handoff of phase '{}'",
                route, phase.name
            )));
        }
        return Ok(Some(route.clone()));
    }

    if let Some(status) = &output.status
        && let Some(successor) = phase.routing.get(status)
    {
        return Ok(Some(successor.clone()));
    }
    Ok(None)
}
