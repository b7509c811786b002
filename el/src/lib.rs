//! Echolog - append-only trace/event log for cascade executions
//!
//! Every meaningful act in a cascade run writes exactly one event record
//! keyed by a trace id, with a parent pointer establishing hierarchy. The
//! log is the system's source of truth: winner selection, cost updates and
//! replay markers are all expressed as additional records, never as
//! mutation of prior rows.
//!
//! # Modules
//!
//! - [`trace`] - trace ids, node types, parent/child derivation
//! - [`record`] - the `EventRecord` row schema
//! - [`hash`] - stable content hashing for message joins
//! - [`sink`] - `EventSink` trait with memory, buffered, and SQLite backends
//! - [`cards`] - context-card summaries for the context selector

pub mod cards;
pub mod hash;
pub mod record;
pub mod sink;
pub mod trace;

pub use cards::{ContextCard, estimate_tokens, extract_keywords, summarize};
pub use hash::{content_hash, content_hash_value, normalize};
pub use record::EventRecord;
pub use sink::{BufferedSink, EventSink, MemorySink, SinkError, SqliteSink};
pub use trace::{NodeType, TraceId, TraceNode, new_session_id, new_trace_id};
