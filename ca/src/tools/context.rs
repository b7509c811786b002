//! ToolInvocation - execution context handed to each tool call
//!
//! Tools see a snapshot of session state, never the live Echo. State
//! mutation happens only through the `set_state` channel handled by the
//! turn loop itself.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::scheduler::CancelToken;
use echolog::TraceId;

use super::registry::ToolRegistry;

/// Per-call context for tool handlers
#[derive(Clone)]
pub struct ToolInvocation {
    pub session_id: String,
    pub phase_name: String,
    pub trace_id: TraceId,

    /// Nesting depth of the owning cascade, for sub-cascade ceilings
    pub depth: u32,

    /// Snapshot of Echo state at dispatch time
    pub state: Map<String, Value>,

    /// Snapshot of per-phase outputs at dispatch time
    pub outputs: Map<String, Value>,

    /// Cooperative cancellation, checked by long-running tools
    pub cancel: CancelToken,

    /// Registry reference so composite steps can resolve other tools
    pub registry: Arc<ToolRegistry>,
}

impl ToolInvocation {
    pub fn new(
        session_id: impl Into<String>,
        phase_name: impl Into<String>,
        trace_id: impl Into<TraceId>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            phase_name: phase_name.into(),
            trace_id: trace_id.into(),
            depth: 0,
            state: Map::new(),
            outputs: Map::new(),
            cancel: CancelToken::new(),
            registry,
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_snapshots(mut self, state: Map<String, Value>, outputs: Map<String, Value>) -> Self {
        self.state = state;
        self.outputs = outputs;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for ToolInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvocation")
            .field("session_id", &self.session_id)
            .field("phase_name", &self.phase_name)
            .field("trace_id", &self.trace_id)
            .finish()
    }
}
