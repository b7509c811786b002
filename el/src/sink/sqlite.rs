//! SQLite-backed sink
//!
//! One `events` table with JSON-typed content and metadata columns, plus a
//! `context_cards` table. The autoincrement rowid is the insertion sequence,
//! so `ORDER BY id` reproduces append order exactly.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use tracing::debug;

use crate::cards::ContextCard;
use crate::record::EventRecord;
use crate::trace::NodeType;

use super::{EventSink, SinkError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    session_id TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    node_type TEXT NOT NULL,
    parent_id TEXT,
    parent_session_id TEXT,
    role TEXT,
    depth INTEGER,
    cascade_id TEXT,
    phase_name TEXT,
    sounding_index INTEGER,
    is_winner INTEGER,
    reforge_step INTEGER,
    attempt_number INTEGER,
    turn_number INTEGER,
    model TEXT,
    provider_request_id TEXT,
    tokens_in INTEGER,
    tokens_out INTEGER,
    cost REAL,
    duration_ms INTEGER,
    content TEXT,
    content_hash TEXT,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
CREATE INDEX IF NOT EXISTS idx_events_trace ON events(trace_id);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(session_id, node_type);
CREATE INDEX IF NOT EXISTS idx_events_hash ON events(session_id, content_hash);

CREATE TABLE IF NOT EXISTS context_cards (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    summary TEXT NOT NULL,
    keywords TEXT NOT NULL,
    embedding TEXT,
    estimated_tokens INTEGER NOT NULL,
    is_anchor INTEGER NOT NULL DEFAULT 0,
    is_callout INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_cards_session ON context_cards(session_id);
";

const EVENT_COLUMNS: &str = "timestamp, session_id, trace_id, node_type, parent_id, parent_session_id, role, depth, \
     cascade_id, phase_name, sounding_index, is_winner, reforge_step, attempt_number, turn_number, model, \
     provider_request_id, tokens_in, tokens_out, cost, duration_ms, content, content_hash, metadata";

/// rusqlite connection behind a mutex; appends and queries are short
/// synchronous sections between suspension points
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    /// Open (creating if needed) a sink database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = ?path.as_ref(), "SqliteSink: opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory database, useful for tests
    pub fn in_memory() -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Query events with an arbitrary SQL predicate over the event columns
    ///
    /// The clause is appended after `WHERE`; content and metadata are JSON
    /// text columns, so `json_extract(content, '$.target')` style predicates
    /// work.
    pub fn events_where(
        &self,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<EventRecord>, SinkError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM events WHERE {} ORDER BY id", EVENT_COLUMNS, where_clause);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, row_to_record)?;
        collect_records(rows)
    }
}

fn opt_json(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let timestamp: String = row.get(0)?;
    let node_type: String = row.get(3)?;
    let content: Option<String> = row.get(21)?;
    let metadata: Option<String> = row.get(23)?;

    Ok(EventRecord {
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
        session_id: row.get(1)?,
        trace_id: row.get(2)?,
        node_type: NodeType::parse(&node_type).unwrap_or(NodeType::CascadeError),
        parent_id: row.get(4)?,
        parent_session_id: row.get(5)?,
        role: row.get(6)?,
        depth: row.get(7)?,
        cascade_id: row.get(8)?,
        phase_name: row.get(9)?,
        sounding_index: row.get::<_, Option<i64>>(10)?.map(|v| v as usize),
        is_winner: row.get::<_, Option<bool>>(11)?,
        reforge_step: row.get(12)?,
        attempt_number: row.get(13)?,
        turn_number: row.get(14)?,
        model: row.get(15)?,
        provider_request_id: row.get(16)?,
        tokens_in: row.get::<_, Option<i64>>(17)?.map(|v| v as u64),
        tokens_out: row.get::<_, Option<i64>>(18)?.map(|v| v as u64),
        cost: row.get(19)?,
        duration_ms: row.get::<_, Option<i64>>(20)?.map(|v| v as u64),
        content: content.and_then(|s| serde_json::from_str(&s).ok()),
        content_hash: row.get(22)?,
        metadata: metadata
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
    })
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<EventRecord>>,
) -> Result<Vec<EventRecord>, SinkError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[async_trait]
impl EventSink for SqliteSink {
    async fn append(&self, record: EventRecord) -> Result<(), SinkError> {
        let metadata = if record.metadata.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(record.metadata.clone()).to_string())
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                 ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
                EVENT_COLUMNS
            ),
            params![
                record.timestamp.to_rfc3339(),
                record.session_id,
                record.trace_id,
                record.node_type.as_str(),
                record.parent_id,
                record.parent_session_id,
                record.role,
                record.depth,
                record.cascade_id,
                record.phase_name,
                record.sounding_index.map(|v| v as i64),
                record.is_winner,
                record.reforge_step,
                record.attempt_number,
                record.turn_number,
                record.model,
                record.provider_request_id,
                record.tokens_in.map(|v| v as i64),
                record.tokens_out.map(|v| v as i64),
                record.cost,
                record.duration_ms.map(|v| v as i64),
                opt_json(&record.content),
                record.content_hash,
                metadata,
            ],
        )?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn session_events(&self, session_id: &str) -> Result<Vec<EventRecord>, SinkError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM events WHERE session_id = ?1 ORDER BY id", EVENT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![session_id], row_to_record)?;
        collect_records(rows)
    }

    async fn events_by_type(&self, session_id: &str, node_type: NodeType) -> Result<Vec<EventRecord>, SinkError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM events WHERE session_id = ?1 AND node_type = ?2 ORDER BY id",
            EVENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![session_id, node_type.as_str()], row_to_record)?;
        collect_records(rows)
    }

    async fn event_for_trace(&self, trace_id: &str) -> Result<Option<EventRecord>, SinkError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM events WHERE trace_id = ?1 ORDER BY id LIMIT 1", EVENT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![trace_id], row_to_record)?;
        Ok(collect_records(rows)?.into_iter().next())
    }

    async fn find_by_hash(&self, session_id: &str, content_hash: &str) -> Result<Option<EventRecord>, SinkError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM events WHERE session_id = ?1 AND content_hash = ?2 ORDER BY id LIMIT 1",
            EVENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![session_id, content_hash], row_to_record)?;
        Ok(collect_records(rows)?.into_iter().next())
    }

    async fn put_card(&self, card: ContextCard) -> Result<(), SinkError> {
        let keywords = serde_json::to_string(&card.keywords)?;
        let embedding = card.embedding.as_ref().map(serde_json::to_string).transpose()?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO context_cards (session_id, content_hash, summary, keywords, embedding, estimated_tokens, \
             is_anchor, is_callout) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                card.session_id,
                card.content_hash,
                card.summary,
                keywords,
                embedding,
                card.estimated_tokens as i64,
                card.is_anchor,
                card.is_callout,
            ],
        )?;
        Ok(())
    }

    async fn session_cards(&self, session_id: &str) -> Result<Vec<ContextCard>, SinkError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, content_hash, summary, keywords, embedding, estimated_tokens, is_anchor, is_callout \
             FROM context_cards WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let keywords: String = row.get(3)?;
            let embedding: Option<String> = row.get(4)?;
            Ok(ContextCard {
                session_id: row.get(0)?,
                content_hash: row.get(1)?,
                summary: row.get(2)?,
                keywords: serde_json::from_str(&keywords).unwrap_or_default(),
                embedding: embedding.and_then(|s| serde_json::from_str(&s).ok()),
                estimated_tokens: row.get::<_, i64>(5)? as usize,
                is_anchor: row.get(6)?,
                is_callout: row.get(7)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
