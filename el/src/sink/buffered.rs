//! Write-buffering sink wrapper
//!
//! Batches appends and flushes when the buffer reaches `flush_every` records
//! or `flush_interval` has elapsed, whichever comes first. Records are
//! released to the inner sink strictly in append order, which preserves the
//! parent-before-child durability invariant. Queries flush first so reads
//! always observe prior writes.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::cards::ContextCard;
use crate::record::EventRecord;
use crate::trace::NodeType;

use super::{EventSink, SinkError};

pub struct BufferedSink<S: EventSink> {
    inner: S,
    buffer: Mutex<Vec<EventRecord>>,
    last_flush: Mutex<Instant>,
    flush_every: usize,
    flush_interval: Duration,
}

impl<S: EventSink> BufferedSink<S> {
    pub fn new(inner: S, flush_every: usize, flush_interval: Duration) -> Self {
        Self {
            inner,
            buffer: Mutex::new(Vec::new()),
            last_flush: Mutex::new(Instant::now()),
            flush_every: flush_every.max(1),
            flush_interval,
        }
    }

    /// Unwrap, flushing first
    pub async fn into_inner(self) -> Result<S, SinkError> {
        self.flush().await?;
        Ok(self.inner)
    }

    fn take_buffer(&self) -> Vec<EventRecord> {
        std::mem::take(&mut *self.buffer.lock().unwrap())
    }

    async fn flush_buffer(&self) -> Result<(), SinkError> {
        let pending = self.take_buffer();
        if pending.is_empty() {
            return Ok(());
        }
        debug!(count = pending.len(), "BufferedSink: flushing");
        for record in pending {
            self.inner.append(record).await?;
        }
        *self.last_flush.lock().unwrap() = Instant::now();
        Ok(())
    }

    fn should_flush(&self) -> bool {
        let len = self.buffer.lock().unwrap().len();
        len >= self.flush_every || self.last_flush.lock().unwrap().elapsed() >= self.flush_interval
    }
}

#[async_trait]
impl<S: EventSink> EventSink for BufferedSink<S> {
    async fn append(&self, record: EventRecord) -> Result<(), SinkError> {
        self.buffer.lock().unwrap().push(record);
        if self.should_flush() {
            self.flush_buffer().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.flush_buffer().await?;
        self.inner.flush().await
    }

    async fn session_events(&self, session_id: &str) -> Result<Vec<EventRecord>, SinkError> {
        self.flush_buffer().await?;
        self.inner.session_events(session_id).await
    }

    async fn events_by_type(&self, session_id: &str, node_type: NodeType) -> Result<Vec<EventRecord>, SinkError> {
        self.flush_buffer().await?;
        self.inner.events_by_type(session_id, node_type).await
    }

    async fn event_for_trace(&self, trace_id: &str) -> Result<Option<EventRecord>, SinkError> {
        self.flush_buffer().await?;
        self.inner.event_for_trace(trace_id).await
    }

    async fn find_by_hash(&self, session_id: &str, content_hash: &str) -> Result<Option<EventRecord>, SinkError> {
        self.flush_buffer().await?;
        self.inner.find_by_hash(session_id, content_hash).await
    }

    async fn put_card(&self, card: ContextCard) -> Result<(), SinkError> {
        // Cards are not ordered against events; pass straight through
        self.inner.put_card(card).await
    }

    async fn session_cards(&self, session_id: &str) -> Result<Vec<ContextCard>, SinkError> {
        self.inner.session_cards(session_id).await
    }
}
