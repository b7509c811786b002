//! Trace identity - hierarchical node ids threading the event log
//!
//! Every meaningful act in a cascade execution writes one event record
//! carrying a `TraceId` and a parent pointer. Parent/child chains make the
//! whole run reconstructable: a turn hangs off its phase, a tool result off
//! its turn, a sounding attempt off the soundings round.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a trace node
pub type TraceId = String;

/// Generate a fresh trace id (UUIDv7, time-ordered)
pub fn new_trace_id() -> TraceId {
    Uuid::now_v7().to_string()
}

/// Generate a fresh session id (UUIDv7, time-ordered)
pub fn new_session_id() -> String {
    Uuid::now_v7().to_string()
}

/// The kind of act an event record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    // Cascade lifecycle
    CascadeStart,
    CascadeComplete,
    CascadeError,
    CascadeCancelled,

    // Phase lifecycle
    PhaseStart,
    PhaseComplete,

    // Turn loop
    Turn,
    Agent,
    ToolCall,
    ToolResult,

    // Soundings / reforge
    SoundingAttempt,
    SoundingWinner,
    ReforgeStep,

    // Validation
    Ward,
    LoopUntilCheck,
    OutputSchemaCheck,

    // Context
    ContextSelection,

    // Signals
    Checkpoint,
    SignalDefinition,
    SignalWait,
    SignalFired,
    SignalTimeout,

    // Accounting
    CostUpdate,
    CostUpdateError,

    // Cancellation
    Cancelled,

    // Replay
    ReplayMarker,
}

impl NodeType {
    /// Stable snake_case name, as stored in the sink
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::CascadeStart => "cascade_start",
            NodeType::CascadeComplete => "cascade_complete",
            NodeType::CascadeError => "cascade_error",
            NodeType::CascadeCancelled => "cascade_cancelled",
            NodeType::PhaseStart => "phase_start",
            NodeType::PhaseComplete => "phase_complete",
            NodeType::Turn => "turn",
            NodeType::Agent => "agent",
            NodeType::ToolCall => "tool_call",
            NodeType::ToolResult => "tool_result",
            NodeType::SoundingAttempt => "sounding_attempt",
            NodeType::SoundingWinner => "sounding_winner",
            NodeType::ReforgeStep => "reforge_step",
            NodeType::Ward => "ward",
            NodeType::LoopUntilCheck => "loop_until_check",
            NodeType::OutputSchemaCheck => "output_schema_check",
            NodeType::ContextSelection => "context_selection",
            NodeType::Checkpoint => "checkpoint",
            NodeType::SignalDefinition => "signal_definition",
            NodeType::SignalWait => "signal_wait",
            NodeType::SignalFired => "signal_fired",
            NodeType::SignalTimeout => "signal_timeout",
            NodeType::CostUpdate => "cost_update",
            NodeType::CostUpdateError => "cost_update_error",
            NodeType::Cancelled => "cancelled",
            NodeType::ReplayMarker => "replay_marker",
        }
    }

    /// Parse from the stored snake_case name
    pub fn parse(s: &str) -> Option<NodeType> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point of identity in the event log
///
/// Carried through the execution path so every emitted record knows where it
/// hangs in the tree. Children are derived with [`TraceNode::child`], which
/// assigns a fresh id and bumps the depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceNode {
    pub trace_id: TraceId,
    pub parent_id: Option<TraceId>,
    pub depth: u32,
    pub node_type: NodeType,
}

impl TraceNode {
    /// Create a root node (no parent, depth 0)
    pub fn root(node_type: NodeType) -> Self {
        Self {
            trace_id: new_trace_id(),
            parent_id: None,
            depth: 0,
            node_type,
        }
    }

    /// Create a root node attached under an external parent
    ///
    /// Used when a sub-cascade hangs off a tool call in its parent session.
    pub fn root_under(parent: &TraceNode, node_type: NodeType) -> Self {
        Self {
            trace_id: new_trace_id(),
            parent_id: Some(parent.trace_id.clone()),
            depth: parent.depth + 1,
            node_type,
        }
    }

    /// Derive a child node with a fresh id
    pub fn child(&self, node_type: NodeType) -> Self {
        Self {
            trace_id: new_trace_id(),
            parent_id: Some(self.trace_id.clone()),
            depth: self.depth + 1,
            node_type,
        }
    }
}
