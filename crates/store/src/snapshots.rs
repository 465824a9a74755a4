// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! System-state snapshot store.
//!
//! Snapshots are replay starting points: full states, or deltas against a
//! base snapshot when created incrementally. Delta chains are bounded by
//! `max_delta_chain`; past that depth a full snapshot is forced. Tagged
//! snapshots are pinned — eviction only ever removes untagged entries.

use crate::engine::{StoreError, TraceStore};
use retrace_core::codec;
use retrace_core::diff::{diff_states, StateDiff};
use retrace_core::{IdGen, SessionId, SnapshotId, SystemState, UuidIdGen};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] retrace_core::CodecError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot not found: {0}")]
    NotFound(SnapshotId),
    #[error("broken delta chain at {0}")]
    BrokenChain(SnapshotId),
}

/// Snapshot metadata without the state payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: SnapshotId,
    pub session_id: SessionId,
    pub timestamp: i64,
    pub agent_count: usize,
    pub task_count: usize,
    /// Serialized state size in bytes.
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<usize>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub incremental: bool,
}

/// A materialized snapshot: metadata plus the full state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub state: SystemState,
}

/// Options for snapshot creation.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub tags: Vec<String>,
    pub description: Option<String>,
    /// Persist only the delta from the session's latest snapshot.
    pub incremental: bool,
}

/// Filters for snapshot search.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub session_id: Option<SessionId>,
    pub tag: Option<String>,
    pub time_range: Option<(i64, i64)>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Self-contained export bundle. States are materialized on export so the
/// bundle never references snapshots outside itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub version: u32,
    pub snapshots: Vec<SnapshotExport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotExport {
    #[serde(flatten)]
    pub meta: SnapshotMeta,
    pub state: SystemState,
}

/// Per-entry import result.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    Imported(SnapshotId),
    Skipped(SnapshotId),
    Invalid { id: SnapshotId, reason: String },
}

const BUNDLE_VERSION: u32 = 1;

/// Stored row shape used internally.
struct SnapshotRow {
    meta: SnapshotMeta,
    base_id: Option<SnapshotId>,
    blob: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStoreConfig {
    /// Cap on untagged snapshots per session (LRU by timestamp).
    pub max_snapshots: usize,
    /// Delta chain depth at which a full snapshot is forced.
    pub max_delta_chain: usize,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 50,
            max_delta_chain: 10,
        }
    }
}

/// Snapshot store backed by the same database as the trace store.
#[derive(Clone)]
pub struct SnapshotStore {
    store: TraceStore,
    config: SnapshotStoreConfig,
    idgen: UuidIdGen,
}

impl SnapshotStore {
    pub fn new(store: TraceStore, config: SnapshotStoreConfig) -> Self {
        Self {
            store,
            config,
            idgen: UuidIdGen,
        }
    }

    /// Persist a snapshot of `state` and return its id.
    ///
    /// With `incremental` set and a usable prior snapshot, only the delta is
    /// stored; reconstruction follows the base chain lazily.
    pub fn create(
        &self,
        session: &SessionId,
        state: &SystemState,
        opts: SnapshotOptions,
    ) -> Result<SnapshotId, SnapshotError> {
        let id = SnapshotId::new(self.idgen.next());

        let base = if opts.incremental {
            self.latest_row(session)?
                .filter(|row| self.chain_depth(row).unwrap_or(usize::MAX) < self.config.max_delta_chain)
        } else {
            None
        };

        let (payload, incremental, base_id) = match &base {
            Some(base_row) => {
                let base_state = self.materialize(base_row)?;
                let delta = diff_states(&base_state, state);
                (serde_json::to_value(&delta)?, true, Some(base_row.meta.id.clone()))
            }
            None => (serde_json::to_value(state)?, false, None),
        };

        let size = serde_json::to_vec(&payload)?.len();
        let blob = codec::encode(&payload, self.store.compression_threshold())?;
        let compressed_size = (blob.first() == Some(&0x01)).then_some(blob.len());

        let tags_json = serde_json::to_string(&opts.tags)?;
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO snapshots \
             (id, session_id, timestamp, agent_count, task_count, size, compressed_size, \
              tags, description, incremental, base_id, state, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?3)",
            params![
                id.as_str(),
                session.as_str(),
                state.timestamp,
                state.agents.len() as i64,
                state.tasks.len() as i64,
                size as i64,
                compressed_size.map(|n| n as i64),
                tags_json,
                opts.description,
                incremental as i64,
                base_id.as_ref().map(|b| b.as_str()),
                blob,
            ],
        )?;
        drop(conn);

        debug!(
            snapshot = %id,
            session = %session,
            incremental,
            size,
            "snapshot created"
        );

        self.evict(session)?;
        Ok(id)
    }

    /// Greatest-timestamp snapshot at or before `t`, materialized.
    pub fn nearest(
        &self,
        session: &SessionId,
        t: i64,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        let conn = self.store.conn()?;
        let row = conn
            .query_row(
                &format!("{SELECT_ROW} WHERE session_id = ?1 AND timestamp <= ?2 \
                          ORDER BY timestamp DESC, id DESC LIMIT 1"),
                params![session.as_str(), t],
                row_from_sql,
            )
            .optional()?;
        drop(conn);

        let Some(row) = row else {
            return Ok(None);
        };
        let state = self.materialize(&row)?;
        Ok(Some(Snapshot {
            meta: row.meta,
            state,
        }))
    }

    /// Load and materialize a snapshot by id.
    pub fn get(&self, id: &SnapshotId) -> Result<Snapshot, SnapshotError> {
        let row = self
            .row_by_id(id)?
            .ok_or_else(|| SnapshotError::NotFound(id.clone()))?;
        let state = self.materialize(&row)?;
        Ok(Snapshot {
            meta: row.meta,
            state,
        })
    }

    /// Search snapshot metadata with tag/time filters.
    pub fn search(&self, filter: &SnapshotFilter) -> Result<Vec<SnapshotMeta>, SnapshotError> {
        let conn = self.store.conn()?;
        let order = match filter.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };

        let mut sql = format!("{SELECT_ROW} WHERE 1=1");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(session) = &filter.session_id {
            sql.push_str(" AND session_id = ?");
            args.push(rusqlite::types::Value::from(session.as_str().to_string()));
        }
        if let Some((start, end)) = filter.time_range {
            sql.push_str(" AND timestamp >= ? AND timestamp <= ?");
            args.push(rusqlite::types::Value::Integer(start));
            args.push(rusqlite::types::Value::Integer(end));
        }
        sql.push_str(&format!(" ORDER BY timestamp {order}, id {order}"));

        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), row_from_sql)?;

        let mut metas = Vec::new();
        for row in rows {
            let row = row?;
            if let Some(tag) = &filter.tag {
                if !row.meta.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            metas.push(row.meta);
            if let Some(limit) = filter.limit {
                if metas.len() >= limit {
                    break;
                }
            }
        }
        Ok(metas)
    }

    /// Export matching snapshots as a self-contained bundle.
    pub fn export(
        &self,
        session: &SessionId,
        filter: &SnapshotFilter,
    ) -> Result<SnapshotBundle, SnapshotError> {
        let mut scoped = filter.clone();
        scoped.session_id = Some(session.clone());

        let mut snapshots = Vec::new();
        for meta in self.search(&scoped)? {
            let snapshot = self.get(&meta.id)?;
            snapshots.push(SnapshotExport {
                // Exported states are materialized; the bundle entry is a
                // full snapshot regardless of how the row was stored.
                meta: SnapshotMeta {
                    incremental: false,
                    ..snapshot.meta
                },
                state: snapshot.state,
            });
        }
        Ok(SnapshotBundle {
            version: BUNDLE_VERSION,
            snapshots,
        })
    }

    /// Import a bundle, validating each entry. Returns per-entry outcomes.
    pub fn import(&self, bundle: &SnapshotBundle) -> Result<Vec<ImportOutcome>, SnapshotError> {
        let mut outcomes = Vec::new();
        for entry in &bundle.snapshots {
            match self.validate_entry(entry) {
                Err(reason) => outcomes.push(ImportOutcome::Invalid {
                    id: entry.meta.id.clone(),
                    reason,
                }),
                Ok(()) => {
                    if self.row_by_id(&entry.meta.id)?.is_some() {
                        outcomes.push(ImportOutcome::Skipped(entry.meta.id.clone()));
                        continue;
                    }
                    self.insert_full(entry)?;
                    outcomes.push(ImportOutcome::Imported(entry.meta.id.clone()));
                }
            }
        }
        Ok(outcomes)
    }

    fn validate_entry(&self, entry: &SnapshotExport) -> Result<(), String> {
        if entry.meta.id.is_empty() {
            return Err("empty snapshot id".to_string());
        }
        if entry.meta.session_id.is_empty() {
            return Err("empty session id".to_string());
        }
        if entry.meta.timestamp < 0 {
            return Err(format!("invalid timestamp {}", entry.meta.timestamp));
        }
        // Coherence: tasks and memory must not reference unknown agents.
        for task in entry.state.tasks.values() {
            if let Some(agent) = &task.agent_id {
                if !entry.state.agents.contains_key(agent) {
                    return Err(format!("task references unknown agent {agent}"));
                }
            }
        }
        for entry_value in entry.state.memory.values() {
            if let Some(agent) = &entry_value.agent_id {
                if !entry.state.agents.contains_key(agent) {
                    return Err(format!("memory entry references unknown agent {agent}"));
                }
            }
        }
        Ok(())
    }

    fn insert_full(&self, entry: &SnapshotExport) -> Result<(), SnapshotError> {
        let payload = serde_json::to_value(&entry.state)?;
        let size = serde_json::to_vec(&payload)?.len();
        let blob = codec::encode(&payload, self.store.compression_threshold())?;
        let compressed_size = (blob.first() == Some(&0x01)).then_some(blob.len());
        let tags_json = serde_json::to_string(&entry.meta.tags)?;

        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO snapshots \
             (id, session_id, timestamp, agent_count, task_count, size, compressed_size, \
              tags, description, incremental, base_id, state, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL, ?10, ?3)",
            params![
                entry.meta.id.as_str(),
                entry.meta.session_id.as_str(),
                entry.meta.timestamp,
                entry.state.agents.len() as i64,
                entry.state.tasks.len() as i64,
                size as i64,
                compressed_size.map(|n| n as i64),
                tags_json,
                entry.meta.description,
                blob,
            ],
        )?;
        Ok(())
    }

    /// Evict oldest untagged snapshots beyond the per-session cap.
    ///
    /// Snapshots serving as delta bases are kept so chains stay intact.
    fn evict(&self, session: &SessionId) -> Result<(), SnapshotError> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tags FROM snapshots WHERE session_id = ?1 \
             AND id NOT IN (SELECT base_id FROM snapshots WHERE base_id IS NOT NULL) \
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map([session.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut untagged = Vec::new();
        for row in rows {
            let (id, tags) = row?;
            let tags: Vec<String> = serde_json::from_str(&tags).unwrap_or_default();
            if tags.is_empty() {
                untagged.push(id);
            }
        }
        drop(stmt);

        let all: i64 = conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE session_id = ?1",
            [session.as_str()],
            |row| row.get(0),
        )?;

        let excess = (all as usize).saturating_sub(self.config.max_snapshots);
        if excess == 0 {
            return Ok(());
        }

        for id in untagged.into_iter().take(excess) {
            conn.execute("DELETE FROM snapshots WHERE id = ?1", [&id])?;
            debug!(snapshot = %id, session = %session, "evicted untagged snapshot");
        }
        Ok(())
    }

    // --- internal row handling -------------------------------------------

    fn row_by_id(&self, id: &SnapshotId) -> Result<Option<SnapshotRow>, SnapshotError> {
        let conn = self.store.conn()?;
        Ok(conn
            .query_row(
                &format!("{SELECT_ROW} WHERE id = ?1"),
                [id.as_str()],
                row_from_sql,
            )
            .optional()?)
    }

    fn latest_row(&self, session: &SessionId) -> Result<Option<SnapshotRow>, SnapshotError> {
        let conn = self.store.conn()?;
        Ok(conn
            .query_row(
                &format!("{SELECT_ROW} WHERE session_id = ?1 \
                          ORDER BY timestamp DESC, id DESC LIMIT 1"),
                [session.as_str()],
                row_from_sql,
            )
            .optional()?)
    }

    /// Number of delta hops from this row down to its full ancestor.
    fn chain_depth(&self, row: &SnapshotRow) -> Result<usize, SnapshotError> {
        let mut depth = 0usize;
        let mut current = row.base_id.clone();
        while let Some(base_id) = current {
            depth += 1;
            if depth > self.config.max_delta_chain {
                break;
            }
            let base = self
                .row_by_id(&base_id)?
                .ok_or(SnapshotError::BrokenChain(base_id))?;
            current = base.base_id;
        }
        Ok(depth)
    }

    /// Materialize a row into a full state, walking the delta chain.
    fn materialize(&self, row: &SnapshotRow) -> Result<SystemState, SnapshotError> {
        if !row.meta.incremental {
            let value = codec::decode(&row.blob)?;
            return Ok(serde_json::from_value(value)?);
        }

        // Collect the delta chain down to the full ancestor.
        let mut deltas: Vec<StateDiff> = Vec::new();
        let value = codec::decode(&row.blob)?;
        deltas.push(serde_json::from_value(value)?);

        let mut base_id = row
            .base_id
            .clone()
            .ok_or_else(|| SnapshotError::BrokenChain(row.meta.id.clone()))?;

        let mut state = loop {
            let base = self
                .row_by_id(&base_id)?
                .ok_or(SnapshotError::BrokenChain(base_id.clone()))?;
            let value = codec::decode(&base.blob)?;
            if !base.meta.incremental {
                break serde_json::from_value::<SystemState>(value)?;
            }
            deltas.push(serde_json::from_value(value)?);
            base_id = base
                .base_id
                .clone()
                .ok_or(SnapshotError::BrokenChain(base.meta.id.clone()))?;
            if deltas.len() > self.config.max_delta_chain + 1 {
                warn!(snapshot = %row.meta.id, "delta chain exceeds configured depth");
                return Err(SnapshotError::BrokenChain(row.meta.id.clone()));
            }
        };

        for delta in deltas.iter().rev() {
            delta.apply(&mut state);
        }
        Ok(state)
    }
}

const SELECT_ROW: &str = "SELECT id, session_id, timestamp, agent_count, task_count, size, \
     compressed_size, tags, description, incremental, base_id, state FROM snapshots";

fn row_from_sql(row: &rusqlite::Row<'_>) -> Result<SnapshotRow, rusqlite::Error> {
    let tags: String = row.get(7)?;
    Ok(SnapshotRow {
        meta: SnapshotMeta {
            id: SnapshotId::new(row.get::<_, String>(0)?),
            session_id: SessionId::new(row.get::<_, String>(1)?),
            timestamp: row.get(2)?,
            agent_count: row.get::<_, i64>(3)? as usize,
            task_count: row.get::<_, i64>(4)? as usize,
            size: row.get::<_, i64>(5)? as usize,
            compressed_size: row.get::<_, Option<i64>>(6)?.map(|n| n as usize),
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            description: row.get(8)?,
            incremental: row.get::<_, i64>(9)? != 0,
        },
        base_id: row.get::<_, Option<String>>(10)?.map(SnapshotId::new),
        blob: row.get(11)?,
    })
}

#[cfg(test)]
#[path = "snapshots_tests.rs"]
mod tests;
