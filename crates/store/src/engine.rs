// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Embedded SQLite trace store.
//!
//! One pooled connection is held only for the duration of a transaction.
//! All inserts are idempotent (`INSERT OR IGNORE` keyed by unique ids), so
//! a retried batch never double-applies.

use crate::schema;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use retrace_core::codec::{self, CodecError};
use retrace_core::{
    AgentId, AgentMessage, ErrorEvent, EventError, EventKind, PerformanceRecord, Phase,
    RelationshipEdge, RelationshipKind, ResourceSample, SessionId, SessionRecord, SessionStatus,
    TaskExecution, TraceEvent,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] EventError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("batch dropped after {retries} retries ({count} events)")]
    BatchDropped { count: usize, retries: u32 },
    #[error("write queue full")]
    QueueFull,
    #[error("write queue closed")]
    QueueClosed,
}

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Concurrent pooled connections.
    pub pool_size: u32,
    /// Minimum payload bytes before block compression kicks in.
    pub compression_threshold: usize,
    /// Capped-backoff retries for transient busy errors.
    pub busy_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/retrace.db"),
            pool_size: 4,
            compression_threshold: codec::DEFAULT_COMPRESSION_THRESHOLD,
            busy_retries: 5,
        }
    }
}

/// Fixed handles for the hot-path prepared statements.
///
/// An enumerated handle instead of a string-keyed map, so a typo'd
/// statement cannot reach the database.
#[derive(Debug, Clone, Copy)]
enum PreparedInsert {
    Trace,
    Relationship,
}

impl PreparedInsert {
    fn sql(self) -> &'static str {
        match self {
            PreparedInsert::Trace => {
                "INSERT OR IGNORE INTO traces \
                 (id, session_id, agent_id, kind, phase, timestamp, correlation_id, parent_id, \
                  data, metadata, performance) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            }
            PreparedInsert::Relationship => {
                "INSERT OR IGNORE INTO trace_relationships (parent_id, child_id, kind) \
                 VALUES (?1, ?2, ?3)"
            }
        }
    }
}

/// Filters for historical trace queries.
///
/// Results are always ordered ascending by `(timestamp, id)`.
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub session_id: Option<SessionId>,
    pub agent_id: Option<AgentId>,
    /// Inclusive time range.
    pub time_range: Option<(i64, i64)>,
    pub kinds: Vec<EventKind>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TraceQuery {
    pub fn session(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }
}

/// Per-table row counts and on-disk size.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StorageStats {
    pub traces: u64,
    pub trace_relationships: u64,
    pub sessions: u64,
    pub snapshots: u64,
    pub performance_snapshots: u64,
    pub error_events: u64,
    pub agent_messages: u64,
    pub task_executions: u64,
    pub resource_usage: u64,
    /// `page_count * page_size`.
    pub disk_bytes: u64,
}

/// Handle to the embedded store. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct TraceStore {
    pool: Pool<SqliteConnectionManager>,
    config: StoreConfig,
}

impl TraceStore {
    /// Open (or create) the database and run pending migrations.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&config.path)
            .with_init(|conn| conn.execute_batch(schema::CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .build(manager)?;

        let conn = pool.get()?;
        schema::migrate(&conn)?;
        drop(conn);

        Ok(Self { pool, config })
    }

    pub(crate) fn conn(
        &self,
    ) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }

    pub(crate) fn compression_threshold(&self) -> usize {
        self.config.compression_threshold
    }

    /// Retry a closure on transient busy errors with capped backoff.
    pub(crate) fn with_busy_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut delay = Duration::from_millis(10);
        let mut attempt = 0u32;
        loop {
            match op() {
                Err(StoreError::Database(ref e)) if is_busy(e) && attempt < self.config.busy_retries => {
                    attempt += 1;
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(250));
                }
                other => return other,
            }
        }
    }

    // --- write path -------------------------------------------------------

    /// Insert a batch of events (and their relationship edges) in one
    /// transaction. Events are assumed validated.
    pub fn insert_events(&self, events: &[TraceEvent]) -> Result<usize, StoreError> {
        if events.is_empty() {
            return Ok(0);
        }

        let threshold = self.config.compression_threshold;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut insert_trace = tx.prepare_cached(PreparedInsert::Trace.sql())?;
            let mut insert_rel = tx.prepare_cached(PreparedInsert::Relationship.sql())?;

            for event in events {
                let data = codec::encode(&event.data, threshold)?;
                let metadata = codec::encode(&event.metadata, threshold)?;
                let performance = codec::encode(&event.performance, threshold)?;

                insert_trace.execute(params![
                    event.id.as_str(),
                    event.session_id.as_str(),
                    event.agent_id.as_ref().map(|a| a.as_str()),
                    event.kind.as_str(),
                    event.phase.to_string(),
                    event.timestamp,
                    event.correlation_id.as_str(),
                    event.parent_id.as_ref().map(|p| p.as_str()),
                    data,
                    metadata,
                    performance,
                ])?;

                if let Some(parent) = &event.parent_id {
                    insert_rel.execute(params![
                        parent.as_str(),
                        event.id.as_str(),
                        event.relationship_kind().as_str(),
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    // --- read path --------------------------------------------------------

    /// Query stored traces, ascending by `(timestamp, id)`.
    pub fn traces(&self, query: &TraceQuery) -> Result<Vec<TraceEvent>, StoreError> {
        let mut sql = String::from(
            "SELECT id, session_id, agent_id, kind, phase, timestamp, correlation_id, \
             parent_id, data, metadata, performance FROM traces WHERE 1=1",
        );
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(session) = &query.session_id {
            sql.push_str(" AND session_id = ?");
            args.push(SqlValue::from(session.as_str().to_string()));
        }
        if let Some(agent) = &query.agent_id {
            sql.push_str(" AND agent_id = ?");
            args.push(SqlValue::from(agent.as_str().to_string()));
        }
        if let Some((start, end)) = query.time_range {
            sql.push_str(" AND timestamp >= ? AND timestamp <= ?");
            args.push(SqlValue::Integer(start));
            args.push(SqlValue::Integer(end));
        }
        if !query.kinds.is_empty() {
            sql.push_str(" AND kind IN (");
            for (i, kind) in query.kinds.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                sql.push('?');
                args.push(SqlValue::from(kind.as_str().to_string()));
            }
            sql.push(')');
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlValue::Integer(limit as i64));
            if let Some(offset) = query.offset {
                sql.push_str(" OFFSET ?");
                args.push(SqlValue::Integer(offset as i64));
            }
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params_from_iter(args))?;

        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            match event_from_row(row) {
                Ok(event) => events.push(event),
                Err(e) => {
                    // Quarantine: an undecodable row is logged and skipped,
                    // never fails the whole read.
                    let id: String = row.get(0).unwrap_or_default();
                    warn!(id = %id, error = %e, "quarantined undecodable trace row");
                }
            }
        }
        Ok(events)
    }

    /// Keyset-paginated scan for replay: events after the cursor and at or
    /// before `until`, ascending `(timestamp, id)`.
    ///
    /// With `after_id = None` the lower bound is strictly by timestamp
    /// (everything after a snapshot instant); with `after_id = Some(id)`
    /// it continues a page after `(after_ts, id)`.
    pub fn traces_after(
        &self,
        session: &SessionId,
        after_ts: i64,
        after_id: Option<&str>,
        until: i64,
        limit: usize,
    ) -> Result<Vec<TraceEvent>, StoreError> {
        let conn = self.conn()?;
        let mut events = Vec::new();

        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, agent_id, kind, phase, timestamp, correlation_id, \
             parent_id, data, metadata, performance FROM traces \
             WHERE session_id = ?1 AND timestamp <= ?2 \
               AND (timestamp > ?3 OR (?4 IS NOT NULL AND timestamp = ?3 AND id > ?4)) \
             ORDER BY timestamp ASC, id ASC LIMIT ?5",
        )?;
        let mut rows = stmt.query(params![
            session.as_str(),
            until,
            after_ts,
            after_id,
            limit as i64
        ])?;
        while let Some(row) = rows.next()? {
            match event_from_row(row) {
                Ok(event) => events.push(event),
                Err(e) => {
                    let id: String = row.get(0).unwrap_or_default();
                    warn!(id = %id, error = %e, "quarantined undecodable trace row");
                }
            }
        }
        Ok(events)
    }

    /// Causal edges whose child belongs to the session.
    pub fn relationships(&self, session: &SessionId) -> Result<Vec<RelationshipEdge>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT r.parent_id, r.child_id, r.kind FROM trace_relationships r \
             JOIN traces c ON c.id = r.child_id \
             WHERE c.session_id = ?1 ORDER BY c.timestamp ASC, c.id ASC",
        )?;
        let rows = stmt.query_map([session.as_str()], |row| {
            let parent: String = row.get(0)?;
            let child: String = row.get(1)?;
            let kind: String = row.get(2)?;
            Ok((parent, child, kind))
        })?;

        let mut edges = Vec::new();
        for row in rows {
            let (parent, child, kind) = row?;
            let Some(kind) = RelationshipKind::from_name(&kind) else {
                warn!(parent = %parent, child = %child, kind = %kind, "skipping relationship with unknown kind");
                continue;
            };
            edges.push(RelationshipEdge {
                parent_id: parent.into(),
                child_id: child.into(),
                kind,
            });
        }
        Ok(edges)
    }

    // --- sessions ---------------------------------------------------------

    pub fn create_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let metadata = codec::encode(&session.metadata, self.config.compression_threshold)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO sessions (id, name, start_time, end_time, status, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id.as_str(),
                session.name,
                session.start_time,
                session.end_time,
                session.status.as_str(),
                metadata,
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, start_time, end_time, status, metadata \
                 FROM sessions WHERE id = ?1",
                [id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<Vec<u8>>>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, start_time, end_time, status, metadata)) = row else {
            return Ok(None);
        };
        let metadata = match metadata {
            Some(blob) => codec::decode(&blob)?,
            None => Value::Null,
        };
        Ok(Some(SessionRecord {
            id: id.into(),
            name,
            start_time,
            end_time,
            status: SessionStatus::from_name(&status).unwrap_or(SessionStatus::Active),
            metadata,
        }))
    }

    /// Close a session: set the end time and final status.
    pub fn close_session(
        &self,
        id: &SessionId,
        status: SessionStatus,
        end_time: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET status = ?2, end_time = ?3 WHERE id = ?1",
            params![id.as_str(), status.as_str(), end_time],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownSession(id.clone()));
        }
        Ok(())
    }

    pub fn sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT id, name, start_time, end_time, status, metadata FROM sessions",
        );
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(status) = status {
            sql.push_str(" WHERE status = ?");
            args.push(SqlValue::from(status.as_str().to_string()));
        }
        sql.push_str(" ORDER BY start_time ASC, id ASC");

        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<Vec<u8>>>(5)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (id, name, start_time, end_time, status, metadata) = row?;
            let metadata = match metadata {
                Some(blob) => codec::decode(&blob)?,
                None => Value::Null,
            };
            sessions.push(SessionRecord {
                id: id.into(),
                name,
                start_time,
                end_time,
                status: SessionStatus::from_name(&status).unwrap_or(SessionStatus::Active),
                metadata,
            });
        }
        Ok(sessions)
    }

    // --- auxiliary records ------------------------------------------------

    pub fn record_error(&self, error: &ErrorEvent) -> Result<(), StoreError> {
        let context = codec::encode(&error.context, self.config.compression_threshold)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO error_events \
             (id, session_id, agent_id, timestamp, message, stack, context) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                error.id,
                error.session_id.as_str(),
                error.agent_id.as_ref().map(|a| a.as_str()),
                error.timestamp,
                error.message,
                error.stack,
                context,
            ],
        )?;
        Ok(())
    }

    pub fn errors(
        &self,
        session: &SessionId,
        range: Option<(i64, i64)>,
    ) -> Result<Vec<ErrorEvent>, StoreError> {
        let conn = self.conn()?;
        let (start, end) = range.unwrap_or((i64::MIN, i64::MAX));
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, agent_id, timestamp, message, stack, context \
             FROM error_events WHERE session_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3 \
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![session.as_str(), start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<Vec<u8>>>(6)?,
            ))
        })?;

        let mut errors = Vec::new();
        for row in rows {
            let (id, session_id, agent_id, timestamp, message, stack, context) = row?;
            errors.push(ErrorEvent {
                id,
                session_id: session_id.into(),
                agent_id: agent_id.map(Into::into),
                timestamp,
                message,
                stack,
                context: match context {
                    Some(blob) => codec::decode(&blob)?,
                    None => Value::Null,
                },
            });
        }
        Ok(errors)
    }

    pub fn record_message(&self, message: &AgentMessage) -> Result<(), StoreError> {
        let content = codec::encode(&message.content, self.config.compression_threshold)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO agent_messages \
             (id, session_id, from_agent, to_agent, timestamp, content) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                message.session_id.as_str(),
                message.from_agent.as_str(),
                message.to_agent.as_ref().map(|a| a.as_str()),
                message.timestamp,
                content,
            ],
        )?;
        Ok(())
    }

    pub fn messages(
        &self,
        session: &SessionId,
        range: Option<(i64, i64)>,
    ) -> Result<Vec<AgentMessage>, StoreError> {
        let conn = self.conn()?;
        let (start, end) = range.unwrap_or((i64::MIN, i64::MAX));
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, from_agent, to_agent, timestamp, content \
             FROM agent_messages WHERE session_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3 \
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![session.as_str(), start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<Vec<u8>>>(5)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, session_id, from_agent, to_agent, timestamp, content) = row?;
            messages.push(AgentMessage {
                id,
                session_id: session_id.into(),
                from_agent: from_agent.into(),
                to_agent: to_agent.map(Into::into),
                timestamp,
                content: match content {
                    Some(blob) => codec::decode(&blob)?,
                    None => Value::Null,
                },
            });
        }
        Ok(messages)
    }

    pub fn record_task_execution(&self, task: &TaskExecution) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO task_executions \
             (id, session_id, task_id, agent_id, kind, status, started_at, completed_at, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.id,
                task.session_id.as_str(),
                task.task_id.as_str(),
                task.agent_id.as_ref().map(|a| a.as_str()),
                task.kind,
                task.status,
                task.started_at,
                task.completed_at,
                task.duration_ms,
            ],
        )?;
        Ok(())
    }

    pub fn task_executions(&self, session: &SessionId) -> Result<Vec<TaskExecution>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, task_id, agent_id, kind, status, started_at, completed_at, \
             duration_ms FROM task_executions WHERE session_id = ?1 \
             ORDER BY started_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([session.as_str()], |row| {
            Ok(TaskExecution {
                id: row.get(0)?,
                session_id: SessionId::new(row.get::<_, String>(1)?),
                task_id: row.get::<_, String>(2)?.into(),
                agent_id: row.get::<_, Option<String>>(3)?.map(Into::into),
                kind: row.get(4)?,
                status: row.get(5)?,
                started_at: row.get(6)?,
                completed_at: row.get(7)?,
                duration_ms: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn record_resource_sample(&self, sample: &ResourceSample) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO resource_usage \
             (id, session_id, agent_id, timestamp, cpu, memory) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sample.id,
                sample.session_id.as_str(),
                sample.agent_id.as_str(),
                sample.timestamp,
                sample.cpu,
                sample.memory,
            ],
        )?;
        Ok(())
    }

    pub fn resource_usage(
        &self,
        session: &SessionId,
        agent: Option<&AgentId>,
        range: Option<(i64, i64)>,
    ) -> Result<Vec<ResourceSample>, StoreError> {
        let conn = self.conn()?;
        let (start, end) = range.unwrap_or((i64::MIN, i64::MAX));
        let mut sql = String::from(
            "SELECT id, session_id, agent_id, timestamp, cpu, memory FROM resource_usage \
             WHERE session_id = ? AND timestamp >= ? AND timestamp <= ?",
        );
        let mut args: Vec<SqlValue> = vec![
            SqlValue::from(session.as_str().to_string()),
            SqlValue::Integer(start),
            SqlValue::Integer(end),
        ];
        if let Some(agent) = agent {
            sql.push_str(" AND agent_id = ?");
            args.push(SqlValue::from(agent.as_str().to_string()));
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");

        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(ResourceSample {
                id: row.get(0)?,
                session_id: SessionId::new(row.get::<_, String>(1)?),
                agent_id: AgentId::new(row.get::<_, String>(2)?),
                timestamp: row.get(3)?,
                cpu: row.get(4)?,
                memory: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn record_performance(&self, record: &PerformanceRecord) -> Result<(), StoreError> {
        let metrics = codec::encode(&record.metrics, self.config.compression_threshold)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO performance_snapshots (id, session_id, timestamp, metrics) \
             VALUES (?1, ?2, ?3, ?4)",
            params![record.id, record.session_id.as_str(), record.timestamp, metrics],
        )?;
        Ok(())
    }

    pub fn performance_records(
        &self,
        session: &SessionId,
        range: Option<(i64, i64)>,
    ) -> Result<Vec<PerformanceRecord>, StoreError> {
        let conn = self.conn()?;
        let (start, end) = range.unwrap_or((i64::MIN, i64::MAX));
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, timestamp, metrics FROM performance_snapshots \
             WHERE session_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3 \
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![session.as_str(), start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, session_id, timestamp, metrics) = row?;
            records.push(PerformanceRecord {
                id,
                session_id: session_id.into(),
                timestamp,
                metrics: match metrics {
                    Some(blob) => codec::decode(&blob)?,
                    None => Value::Null,
                },
            });
        }
        Ok(records)
    }

    // --- maintenance ------------------------------------------------------

    /// Delete rows older than the cutoff across all time-keyed tables.
    /// Returns the number of trace rows removed.
    pub fn archive_before(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        self.with_busy_retry(|| {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM traces WHERE timestamp < ?1", [cutoff_ms])?;
            tx.execute(
                "DELETE FROM trace_relationships WHERE child_id NOT IN (SELECT id FROM traces)",
                [],
            )?;
            for table in [
                "performance_snapshots",
                "error_events",
                "agent_messages",
                "resource_usage",
            ] {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE timestamp < ?1"),
                    [cutoff_ms],
                )?;
            }
            tx.execute(
                "DELETE FROM task_executions WHERE started_at < ?1",
                [cutoff_ms],
            )?;
            tx.commit()?;
            Ok(removed)
        })
    }

    /// Delete rows older than `hours` relative to `now_ms`.
    pub fn archive_older_than(&self, hours: u32, now_ms: i64) -> Result<usize, StoreError> {
        self.archive_before(now_ms - i64::from(hours) * 3_600_000)
    }

    /// Reclaim space and refresh planner statistics. Callers must flush the
    /// batch writer first so pending rows are included.
    pub fn compact(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch("VACUUM; ANALYZE;")?;
        Ok(())
    }

    /// Synchronous per-table counts and database file size.
    pub fn stats(&self) -> Result<StorageStats, StoreError> {
        let conn = self.conn()?;
        let count = |table: &str| -> Result<u64, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
        };

        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(StorageStats {
            traces: count("traces")?,
            trace_relationships: count("trace_relationships")?,
            sessions: count("sessions")?,
            snapshots: count("snapshots")?,
            performance_snapshots: count("performance_snapshots")?,
            error_events: count("error_events")?,
            agent_messages: count("agent_messages")?,
            task_executions: count("task_executions")?,
            resource_usage: count("resource_usage")?,
            disk_bytes: (page_count * page_size) as u64,
        })
    }

    /// Highest applied schema version.
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        Ok(schema::version(&conn)?)
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn event_from_row(row: &rusqlite::Row<'_>) -> Result<TraceEvent, StoreError> {
    let id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let agent_id: Option<String> = row.get(2)?;
    let kind: String = row.get(3)?;
    let phase: String = row.get(4)?;
    let timestamp: i64 = row.get(5)?;
    let correlation_id: String = row.get(6)?;
    let parent_id: Option<String> = row.get(7)?;
    let data: Option<Vec<u8>> = row.get(8)?;
    let metadata: Option<Vec<u8>> = row.get(9)?;
    let performance: Option<Vec<u8>> = row.get(10)?;

    let decode_blob = |blob: Option<Vec<u8>>| -> Result<Value, StoreError> {
        match blob {
            Some(bytes) => Ok(codec::decode(&bytes)?),
            None => Ok(Value::Null),
        }
    };

    Ok(TraceEvent {
        id: id.into(),
        session_id: session_id.into(),
        agent_id: agent_id.map(Into::into),
        kind: EventKind::from_name(&kind),
        phase: phase_from_name(&phase),
        timestamp,
        correlation_id: correlation_id.into(),
        parent_id: parent_id.map(Into::into),
        data: decode_blob(data)?,
        metadata: decode_blob(metadata)?,
        performance: decode_blob(performance)?,
    })
}

fn phase_from_name(name: &str) -> Phase {
    match name {
        "start" => Phase::Start,
        "end" => Phase::End,
        "error" => Phase::Error,
        _ => Phase::Progress,
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
