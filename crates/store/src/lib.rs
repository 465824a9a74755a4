// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Storage layer for Retrace
//!
//! Embedded SQLite store (WAL journal, pooled connections) for trace events,
//! causal relationships, sessions and auxiliary records, plus the batched
//! background writer and the system-state snapshot store.

mod engine;
mod schema;
mod snapshots;
mod writer;

pub use engine::{StorageStats, StoreConfig, StoreError, TraceQuery, TraceStore};
pub use schema::SCHEMA_VERSION;
pub use snapshots::{
    ImportOutcome, Snapshot, SnapshotBundle, SnapshotError, SnapshotExport, SnapshotFilter,
    SnapshotMeta, SnapshotOptions, SnapshotStore, SnapshotStoreConfig, SortOrder,
};
pub use writer::{BatchWriter, WriterConfig, WriterMetrics, WriterMetricsSnapshot};
