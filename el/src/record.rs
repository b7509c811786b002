//! Event records - the single row schema of the sink
//!
//! Every meaningful act in a cascade execution becomes one `EventRecord`.
//! Only timestamp, session, trace id and node type are required; the rest is
//! populated builder-style by whichever subsystem emits the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hash::content_hash_value;
use crate::trace::{NodeType, TraceId, TraceNode};

/// One row in the event sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    // Required
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub trace_id: TraceId,
    pub node_type: NodeType,

    // Classification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TraceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cascade_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_name: Option<String>,

    // Execution context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sounding_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_winner: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reforge_step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_number: Option<u32>,

    // LLM accounting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    // Content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    // Free-form structured metadata (semantic_actor tag lives here)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl EventRecord {
    /// Create a record for a trace node, stamped now
    pub fn new(session_id: impl Into<String>, node: &TraceNode) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            trace_id: node.trace_id.clone(),
            node_type: node.node_type,
            parent_id: node.parent_id.clone(),
            parent_session_id: None,
            role: None,
            depth: Some(node.depth),
            cascade_id: None,
            phase_name: None,
            sounding_index: None,
            is_winner: None,
            reforge_step: None,
            attempt_number: None,
            turn_number: None,
            model: None,
            provider_request_id: None,
            tokens_in: None,
            tokens_out: None,
            cost: None,
            duration_ms: None,
            content: None,
            content_hash: None,
            metadata: Map::new(),
        }
    }

    pub fn with_cascade(mut self, cascade_id: impl Into<String>) -> Self {
        self.cascade_id = Some(cascade_id.into());
        self
    }

    pub fn with_phase(mut self, phase_name: impl Into<String>) -> Self {
        self.phase_name = Some(phase_name.into());
        self
    }

    pub fn with_parent_session(mut self, parent_session_id: impl Into<String>) -> Self {
        self.parent_session_id = Some(parent_session_id.into());
        self
    }

    /// Set role and content together; computes the content hash
    pub fn with_role_content(mut self, role: impl Into<String>, content: impl Into<Value>) -> Self {
        let role = role.into();
        let content = content.into();
        self.content_hash = Some(content_hash_value(&role, &content));
        self.role = Some(role);
        self.content = Some(content);
        self
    }

    /// Set structured content without a role (verdicts, selections, configs)
    pub fn with_content(mut self, content: impl Into<Value>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_sounding_index(mut self, index: usize) -> Self {
        self.sounding_index = Some(index);
        self
    }

    pub fn with_winner(mut self, is_winner: bool) -> Self {
        self.is_winner = Some(is_winner);
        self
    }

    pub fn with_reforge_step(mut self, step: u32) -> Self {
        self.reforge_step = Some(step);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt_number = Some(attempt);
        self
    }

    pub fn with_turn(mut self, turn: u32) -> Self {
        self.turn_number = Some(turn);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_provider_request_id(mut self, id: impl Into<String>) -> Self {
        self.provider_request_id = Some(id.into());
        self
    }

    pub fn with_usage(mut self, tokens_in: u64, tokens_out: u64, cost: f64) -> Self {
        self.tokens_in = Some(tokens_in);
        self.tokens_out = Some(tokens_out);
        self.cost = Some(cost);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Tag the emitting subsystem for downstream filtering
    pub fn with_semantic_actor(self, actor: &str) -> Self {
        self.with_metadata("semantic_actor", actor)
    }

    /// Whether the record's metadata marks it as an anchor message
    pub fn is_anchor(&self) -> bool {
        self.metadata
            .get("anchor")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}
