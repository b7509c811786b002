//! In-memory sink for tests and short-lived runs

use std::sync::Mutex;

use async_trait::async_trait;

use crate::cards::ContextCard;
use crate::record::EventRecord;
use crate::trace::NodeType;

use super::{EventSink, SinkError};

/// Vec-backed sink; insertion order is the total order
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<EventRecord>>,
    cards: Mutex<Vec<ContextCard>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record across all sessions
    pub fn all_events(&self) -> Vec<EventRecord> {
        self.events.lock().unwrap().clone()
    }

    /// Total record count
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn append(&self, record: EventRecord) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(record);
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn session_events(&self, session_id: &str) -> Result<Vec<EventRecord>, SinkError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn events_by_type(&self, session_id: &str, node_type: NodeType) -> Result<Vec<EventRecord>, SinkError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.session_id == session_id && e.node_type == node_type)
            .cloned()
            .collect())
    }

    async fn event_for_trace(&self, trace_id: &str) -> Result<Option<EventRecord>, SinkError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.trace_id == trace_id)
            .cloned())
    }

    async fn find_by_hash(&self, session_id: &str, content_hash: &str) -> Result<Option<EventRecord>, SinkError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.session_id == session_id && e.content_hash.as_deref() == Some(content_hash))
            .cloned())
    }

    async fn put_card(&self, card: ContextCard) -> Result<(), SinkError> {
        self.cards.lock().unwrap().push(card);
        Ok(())
    }

    async fn session_cards(&self, session_id: &str) -> Result<Vec<ContextCard>, SinkError> {
        Ok(self
            .cards
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect())
    }
}
