//! Async cost updates
//!
//! Providers report final billing post-hoc. Updates are appended as new
//! `cost_update` events carrying the original trace id - prior records are
//! never mutated - and an update that fails to write never affects cascade
//! correctness; it degrades to a `cost_update_error` record (or a log line
//! if even that write fails).

use serde_json::json;
use tracing::warn;

use echolog::{EventRecord, EventSink, NodeType, TraceNode};

/// Append a post-hoc cost update for an earlier model call
pub async fn record_cost_update(
    sink: &dyn EventSink,
    session_id: &str,
    trace_id: &str,
    tokens_in: u64,
    tokens_out: u64,
    cost: f64,
) {
    let node = TraceNode {
        trace_id: trace_id.to_string(),
        parent_id: None,
        depth: 0,
        node_type: NodeType::CostUpdate,
    };
    let record = EventRecord::new(session_id, &node)
        .with_usage(tokens_in, tokens_out, cost)
        .with_semantic_actor("cost_updater");

    if let Err(e) = sink.append(record).await {
        warn!(trace_id, error = %e, "cost update failed");
        let error_node = TraceNode::root(NodeType::CostUpdateError);
        let error_record = EventRecord::new(session_id, &error_node)
            .with_content(json!({"trace_id": trace_id, "error": e.to_string()}))
            .with_semantic_actor("cost_updater");
        if let Err(e) = sink.append(error_record).await {
            warn!(trace_id, error = %e, "cost update error record also failed");
        }
    }
}
