// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Schema definition and additive migrations.
//!
//! The `schema_version` table carries a monotonically increasing integer.
//! Migrations only add tables, columns, and indexes.

use rusqlite::Connection;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 2;

/// Per-connection settings, applied by the pool on every new connection.
pub(crate) const CONNECTION_PRAGMAS: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA busy_timeout=5000;
    PRAGMA cache_size=-64000;
"#;

const SCHEMA_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY,
        applied_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        start_time INTEGER NOT NULL,
        end_time INTEGER,
        status TEXT NOT NULL DEFAULT 'active',
        metadata BLOB
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

    CREATE TABLE IF NOT EXISTS traces (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        agent_id TEXT,
        kind TEXT NOT NULL,
        phase TEXT NOT NULL DEFAULT 'progress',
        timestamp INTEGER NOT NULL,
        correlation_id TEXT NOT NULL,
        parent_id TEXT,
        data BLOB,
        metadata BLOB,
        performance BLOB
    );
    CREATE INDEX IF NOT EXISTS idx_traces_session_ts ON traces(session_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_traces_agent_ts ON traces(agent_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_traces_correlation ON traces(correlation_id);
    CREATE INDEX IF NOT EXISTS idx_traces_parent ON traces(parent_id, id);
    CREATE INDEX IF NOT EXISTS idx_traces_kind ON traces(kind);
    CREATE INDEX IF NOT EXISTS idx_traces_ts ON traces(timestamp);

    CREATE TABLE IF NOT EXISTS trace_relationships (
        parent_id TEXT NOT NULL,
        child_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        PRIMARY KEY (parent_id, child_id)
    );

    CREATE TABLE IF NOT EXISTS performance_snapshots (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        metrics BLOB
    );
    CREATE INDEX IF NOT EXISTS idx_perf_session_ts
        ON performance_snapshots(session_id, timestamp);

    CREATE TABLE IF NOT EXISTS error_events (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        agent_id TEXT,
        timestamp INTEGER NOT NULL,
        message TEXT NOT NULL,
        stack TEXT,
        context BLOB
    );
    CREATE INDEX IF NOT EXISTS idx_errors_session_ts
        ON error_events(session_id, timestamp);

    CREATE TABLE IF NOT EXISTS agent_messages (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        from_agent TEXT NOT NULL,
        to_agent TEXT,
        timestamp INTEGER NOT NULL,
        content BLOB
    );
    CREATE INDEX IF NOT EXISTS idx_messages_session_ts
        ON agent_messages(session_id, timestamp);

    CREATE TABLE IF NOT EXISTS task_executions (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        agent_id TEXT,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        completed_at INTEGER,
        duration_ms REAL
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_session ON task_executions(session_id, started_at);

    CREATE TABLE IF NOT EXISTS resource_usage (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        cpu REAL NOT NULL,
        memory REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_resources_session_ts
        ON resource_usage(session_id, timestamp);

    CREATE TABLE IF NOT EXISTS snapshots (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        agent_count INTEGER NOT NULL DEFAULT 0,
        task_count INTEGER NOT NULL DEFAULT 0,
        size INTEGER NOT NULL DEFAULT 0,
        compressed_size INTEGER,
        tags TEXT NOT NULL DEFAULT '[]',
        description TEXT,
        state BLOB NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_snapshots_session_ts
        ON snapshots(session_id, timestamp);
"#;

// v2: incremental snapshots persist a delta against a base snapshot.
const SCHEMA_V2: &str = r#"
    ALTER TABLE snapshots ADD COLUMN incremental INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE snapshots ADD COLUMN base_id TEXT;
"#;

/// Run pending migrations, recording each applied version.
pub(crate) fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for (version, sql) in [(1, SCHEMA_V1), (2, SCHEMA_V2)] {
        if current < version {
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, strftime('%s','now') * 1000)",
                [version],
            )?;
            tracing::info!(version, "applied schema migration");
        }
    }

    Ok(())
}

/// Highest applied schema version.
pub(crate) fn version(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
