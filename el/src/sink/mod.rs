//! Event sinks - append-only storage for event records and context cards
//!
//! The engine writes through the [`EventSink`] trait and never mutates a
//! record after append. Winner tags, cost updates and replay markers are all
//! expressed as additional records referencing the original trace id.

use async_trait::async_trait;
use thiserror::Error;

use crate::cards::ContextCard;
use crate::record::EventRecord;
use crate::trace::NodeType;

mod buffered;
mod memory;
mod sqlite;

pub use buffered::BufferedSink;
pub use memory::MemorySink;
pub use sqlite::SqliteSink;

/// Errors raised by sink implementations
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed stored record: {0}")]
    Malformed(String),
}

/// Append-only structured log
///
/// Writes are atomic and totally ordered per session by (timestamp, insertion
/// sequence). Implementations that buffer must release records in append
/// order so a parent node is durable before any of its children.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Append one record
    async fn append(&self, record: EventRecord) -> Result<(), SinkError>;

    /// Force any buffered records to durable storage
    async fn flush(&self) -> Result<(), SinkError>;

    /// All records for a session, in insertion order
    async fn session_events(&self, session_id: &str) -> Result<Vec<EventRecord>, SinkError>;

    /// Records of one node type for a session, in insertion order
    async fn events_by_type(&self, session_id: &str, node_type: NodeType) -> Result<Vec<EventRecord>, SinkError>;

    /// The defining record of a trace node
    async fn event_for_trace(&self, trace_id: &str) -> Result<Option<EventRecord>, SinkError>;

    /// First record in a session with the given content hash
    async fn find_by_hash(&self, session_id: &str, content_hash: &str) -> Result<Option<EventRecord>, SinkError>;

    /// Store a context card
    async fn put_card(&self, card: ContextCard) -> Result<(), SinkError>;

    /// All context cards for a session
    async fn session_cards(&self, session_id: &str) -> Result<Vec<ContextCard>, SinkError>;
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    async fn append(&self, record: EventRecord) -> Result<(), SinkError> {
        (**self).append(record).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        (**self).flush().await
    }

    async fn session_events(&self, session_id: &str) -> Result<Vec<EventRecord>, SinkError> {
        (**self).session_events(session_id).await
    }

    async fn events_by_type(&self, session_id: &str, node_type: NodeType) -> Result<Vec<EventRecord>, SinkError> {
        (**self).events_by_type(session_id, node_type).await
    }

    async fn event_for_trace(&self, trace_id: &str) -> Result<Option<EventRecord>, SinkError> {
        (**self).event_for_trace(trace_id).await
    }

    async fn find_by_hash(&self, session_id: &str, content_hash: &str) -> Result<Option<EventRecord>, SinkError> {
        (**self).find_by_hash(session_id, content_hash).await
    }

    async fn put_card(&self, card: ContextCard) -> Result<(), SinkError> {
        (**self).put_card(card).await
    }

    async fn session_cards(&self, session_id: &str) -> Result<Vec<ContextCard>, SinkError> {
        (**self).session_cards(session_id).await
    }
}
