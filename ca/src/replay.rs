//! Replay - re-execute a cascade from its frozen event log
//!
//! The sink's events are a sufficient input: model calls are answered from
//! the logged agent responses in order, tool calls from the logged results
//! per tool name, and signals are pre-fired with their logged payloads.
//! No LLM cost is incurred and the resulting lineage and final output are
//! identical to the original run. Replay-produced events carry a
//! `replay_of` metadata marker instead of mutating anything.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::Cascade;
use crate::error::CascadeError;
use crate::model::{ModelClient, ModelError, ModelRequest, ModelResponse, ScriptedClient, TokenUsage, ToolCallRequest};
use crate::runner::{CascadeRunner, RunOptions, RunResult};
use crate::runtime::RunContext;
use crate::tools::{ROUTE_TO, SET_STATE, Tool, ToolError, ToolInvocation, ToolOutput, ToolRegistry};
use echolog::{ContextCard, EventRecord, EventSink, NodeType, SinkError};

/// Sink wrapper stamping every appended record with a replay marker
pub struct MarkingSink {
    inner: Arc<dyn EventSink>,
    replay_of: String,
}

impl MarkingSink {
    pub fn new(inner: Arc<dyn EventSink>, replay_of: impl Into<String>) -> Self {
        Self {
            inner,
            replay_of: replay_of.into(),
        }
    }
}

#[async_trait]
impl EventSink for MarkingSink {
    async fn append(&self, record: EventRecord) -> Result<(), SinkError> {
        self.inner.append(record.with_metadata("replay_of", self.replay_of.clone())).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.inner.flush().await
    }

    async fn session_events(&self, session_id: &str) -> Result<Vec<EventRecord>, SinkError> {
        self.inner.session_events(session_id).await
    }

    async fn events_by_type(&self, session_id: &str, node_type: NodeType) -> Result<Vec<EventRecord>, SinkError> {
        self.inner.events_by_type(session_id, node_type).await
    }

    async fn event_for_trace(&self, trace_id: &str) -> Result<Option<EventRecord>, SinkError> {
        self.inner.event_for_trace(trace_id).await
    }

    async fn find_by_hash(&self, session_id: &str, content_hash: &str) -> Result<Option<EventRecord>, SinkError> {
        self.inner.find_by_hash(session_id, content_hash).await
    }

    async fn put_card(&self, card: ContextCard) -> Result<(), SinkError> {
        self.inner.put_card(card).await
    }

    async fn session_cards(&self, session_id: &str) -> Result<Vec<ContextCard>, SinkError> {
        self.inner.session_cards(session_id).await
    }
}

/// Tool answering from the logged results of one tool name, in order
struct ReplayTool {
    name: String,
    results: Mutex<VecDeque<Value>>,
}

#[async_trait]
impl Tool for ReplayTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Replays logged results"
    }

    fn input_schema(&self) -> Value {
        // Arguments were validated in the original run
        json!({"type": "object"})
    }

    async fn invoke(&self, _args: Value, _ctx: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        let next = self.results.lock().unwrap().pop_front();
        match next {
            Some(content) => Ok(ToolOutput::from_value(content)),
            None => Err(ToolError::failed(&self.name, "replay log exhausted for this tool")),
        }
    }
}

/// Build the scripted model client from the session's agent events
fn scripted_model(events: &[EventRecord]) -> ScriptedClient {
    let responses: Vec<ModelResponse> = events
        .iter()
        .filter(|e| e.node_type == NodeType::Agent)
        .map(|e| {
            let content = e.content.as_ref();
            let text = content
                .and_then(|c| c.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            let tool_calls: Vec<ToolCallRequest> = content
                .and_then(|c| c.get("tool_calls"))
                .and_then(|t| t.as_array())
                .map(|calls| {
                    calls
                        .iter()
                        .filter_map(|c| {
                            Some(ToolCallRequest {
                                id: c.get("id")?.as_str()?.to_string(),
                                name: c.get("name")?.as_str()?.to_string(),
                                arguments: c.get("arguments").cloned().unwrap_or(json!({})),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            ModelResponse {
                content: if text.is_empty() && !tool_calls.is_empty() { None } else { Some(text) },
                tool_calls,
                usage: TokenUsage {
                    input_tokens: e.tokens_in.unwrap_or(0),
                    output_tokens: e.tokens_out.unwrap_or(0),
                },
                provider_request_id: e.provider_request_id.clone(),
            }
        })
        .collect();
    ScriptedClient::new(responses)
}

/// Map a logged `run` reference to the name the registry is asked for:
/// `python:` targets resolve by their import path, `sql:` targets through
/// the `sql` runner tool. Shell scripts bypass the registry and re-execute.
fn normalize_run_name(run: &str) -> String {
    if let Some(path) = run.strip_prefix("python:") {
        path.to_string()
    } else if run.starts_with("sql:") {
        "sql".to_string()
    } else {
        run.to_string()
    }
}

/// Build the replay tool registry from logged tool_call/tool_result pairs
fn replay_registry(events: &[EventRecord]) -> Arc<ToolRegistry> {
    let mut queues: HashMap<String, VecDeque<Value>> = HashMap::new();
    let mut pending_name: Option<String> = None;

    for event in events {
        match event.node_type {
            NodeType::ToolCall => {
                pending_name = event
                    .content
                    .as_ref()
                    .and_then(|c| c.get("tool").or_else(|| c.get("run")))
                    .and_then(|t| t.as_str())
                    .map(normalize_run_name);
            }
            NodeType::ToolResult => {
                let name = event
                    .metadata
                    .get("tool")
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
                    .or_else(|| pending_name.take());
                if let Some(name) = name {
                    if name == ROUTE_TO || name == SET_STATE {
                        continue;
                    }
                    let content = event.content.clone().unwrap_or(Value::Null);
                    queues.entry(name).or_default().push_back(content);
                }
            }
            _ => {}
        }
    }

    let registry = Arc::new(ToolRegistry::new());
    for (name, results) in queues {
        debug!(tool = %name, results = results.len(), "replay tool registered");
        registry.register(Arc::new(ReplayTool {
            name,
            results: Mutex::new(results),
        }));
    }
    registry
}

/// Replay a session against a fresh sink
///
/// `ctx` supplies the validators, signal sensors and scheduler; its model
/// client and tool registry are replaced by log-backed ones, and its sink
/// is wrapped to mark every record with the original session id.
pub async fn replay_session(
    cascade: &Cascade,
    source: &dyn EventSink,
    original_session: &str,
    ctx: RunContext,
) -> Result<RunResult, CascadeError> {
    let events = source.session_events(original_session).await?;
    if events.is_empty() {
        return Err(CascadeError::Config(format!(
            "No events recorded for session '{}'",
            original_session
        )));
    }
    info!(%original_session, events = events.len(), "replaying session");

    let input = events
        .iter()
        .find(|e| e.node_type == NodeType::CascadeStart)
        .and_then(|e| e.content.as_ref())
        .and_then(|c| c.get("input"))
        .cloned()
        .unwrap_or(Value::Null);

    let sink: Arc<dyn EventSink> = Arc::new(MarkingSink::new(ctx.sink.clone(), original_session));
    let replay_ctx = ctx
        .clone()
        .with_tools(replay_registry(&events));
    let replay_ctx = RunContext {
        sink: sink.clone(),
        model: Arc::new(scripted_model(&events)),
        ..replay_ctx
    };

    // Pre-fire every signal resolution the original session recorded
    for event in &events {
        if event.node_type == NodeType::SignalFired
            && let Some(content) = &event.content
            && let Some(signal) = content.get("signal").and_then(|s| s.as_str())
        {
            let payload = content.get("payload").cloned().unwrap_or(Value::Null);
            replay_ctx
                .signals
                .fire(sink.as_ref(), original_session, signal, payload)
                .await?;
        }
    }

    let runner = CascadeRunner::new(replay_ctx);
    let mut metadata = serde_json::Map::new();
    metadata.insert("replay".to_string(), json!(true));

    runner
        .run(
            cascade,
            input,
            RunOptions {
                session_id: Some(original_session.to_string()),
                metadata,
                ..Default::default()
            },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use echolog::{MemorySink, TraceNode};

    #[tokio::test]
    async fn test_marking_sink_stamps_metadata() {
        let inner = Arc::new(MemorySink::new());
        let sink = MarkingSink::new(inner.clone(), "orig-1");
        let node = TraceNode::root(NodeType::CascadeStart);

        sink.append(EventRecord::new("s", &node)).await.unwrap();

        let events = inner.session_events("s").await.unwrap();
        assert_eq!(events[0].metadata["replay_of"], "orig-1");
    }

    #[tokio::test]
    async fn test_scripted_model_reconstruction() {
        let node = TraceNode::root(NodeType::Agent);
        let events = vec![
            EventRecord::new("s", &node)
                .with_content(json!({"text": "hello", "tool_calls": []}))
                .with_usage(10, 5, 0.0),
            EventRecord::new("s", &node).with_content(json!({
                "text": "",
                "tool_calls": [{"id": "c1", "name": "grep", "arguments": {"pattern": "x"}}]
            })),
        ];

        let client = scripted_model(&events);
        let request = ModelRequest {
            model: "m".into(),
            system: String::new(),
            messages: vec![],
            tools: vec![],
            max_tokens: 10,
            native_tools: true,
        };

        let first = client.complete(request.clone()).await.unwrap();
        assert_eq!(first.content.as_deref(), Some("hello"));
        assert_eq!(first.usage.input_tokens, 10);

        let second = client.complete(request).await.unwrap();
        assert!(second.content.is_none());
        assert_eq!(second.tool_calls[0].name, "grep");
    }

    #[tokio::test]
    async fn test_replay_registry_queues_per_tool() {
        let call = TraceNode::root(NodeType::ToolCall);
        let result = call.child(NodeType::ToolResult);
        let events = vec![
            EventRecord::new("s", &call).with_content(json!({"tool": "grep", "arguments": {}})),
            EventRecord::new("s", &result)
                .with_role_content("tool", "match one")
                .with_metadata("tool", "grep"),
        ];

        let registry = replay_registry(&events);
        assert!(registry.has("grep"));

        let ctx = ToolInvocation::new("s", "p", "t", registry.clone());
        let out = registry.invoke("grep", json!({}), &ctx).await.unwrap();
        assert_eq!(out.content, json!("match one"));

        // Second call exhausts the log
        assert!(registry.invoke("grep", json!({}), &ctx).await.is_err());
    }
}
