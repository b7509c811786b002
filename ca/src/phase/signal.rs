//! Signal phases - blocking awaits with routed resumption

use std::time::Duration;

use serde_json::{Value, json};
use tracing::info;

use crate::config::{Cascade, Phase};
use crate::echo::Echo;
use crate::error::CascadeError;
use crate::runtime::RunContext;
use crate::signals::SignalOutcome;
use echolog::{EventRecord, EventSink, NodeType, TraceNode};

/// Result of a signal phase
#[derive(Debug, Clone)]
pub struct SignalResult {
    pub output: Value,
    pub route: Option<String>,
}

pub async fn run_signal_phase(
    ctx: &RunContext,
    cascade: &Cascade,
    phase: &Phase,
    echo: &Echo,
    phase_node: &TraceNode,
) -> Result<SignalResult, CascadeError> {
    let signal_name = phase
        .await_signal
        .as_deref()
        .ok_or_else(|| CascadeError::Config(format!("Phase '{}' is not a signal phase", phase.name)))?;

    // Checkpoint record carries the UI spec and timeout for external
    // surfaces to render
    let checkpoint_node = phase_node.child(NodeType::Checkpoint);
    ctx.sink
        .append(
            EventRecord::new(&echo.session_id, &checkpoint_node)
                .with_phase(&phase.name)
                .with_content(json!({
                    "signal": signal_name,
                    "ui": phase.human_input,
                    "timeout_seconds": phase.timeout_seconds,
                    "on_signal": phase.on_signal,
                }))
                .with_semantic_actor("signal_phase"),
        )
        .await?;

    let timeout = phase.timeout_seconds.map(Duration::from_secs_f64);
    let outcome = ctx
        .signals
        .wait(
            ctx.sink.as_ref(),
            &echo.session_id,
            signal_name,
            &cascade.signals,
            timeout,
            &checkpoint_node,
            &ctx.cancel,
        )
        .await?;

    match outcome {
        SignalOutcome::Fired(payload) => {
            let route = phase.on_signal.get(&response_key(&payload)).cloned();
            info!(phase = %phase.name, signal = signal_name, ?route, "signal resolved");
            Ok(SignalResult { output: payload, route })
        }
        SignalOutcome::TimedOut => match phase.on_timeout.as_deref() {
            Some("skip") => Ok(SignalResult {
                output: Value::Null,
                route: None,
            }),
            Some("abort") | None => Err(CascadeError::Signal(format!(
                "signal '{}' timed out in phase '{}'",
                signal_name, phase.name
            ))),
            Some(escalate) => {
                info!(phase = %phase.name, target = escalate, "signal timeout escalating");
                Ok(SignalResult {
                    output: Value::Null,
                    route: Some(escalate.to_string()),
                })
            }
        },
        SignalOutcome::Cancelled => Err(CascadeError::Cancelled),
    }
}

/// Key used against the `on_signal` routing table
fn response_key(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("response")
            .or_else(|| map.get("value"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_key_shapes() {
        assert_eq!(response_key(&json!("approve")), "approve");
        assert_eq!(response_key(&json!({"response": "reject"})), "reject");
        assert_eq!(response_key(&json!({"value": "retry"})), "retry");
        assert_eq!(response_key(&json!(5)), "5");
        assert_eq!(response_key(&json!({"other": 1})), "{\"other\":1}");
    }
}
