// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for the behavioral specs.

use retrace_core::{Clock, EventKind, ManualClock, Phase, SessionRecord};
use retrace_replay::Reconstructor;
use retrace_server::{EventDraft, IngestOrchestrator};
use retrace_store::{
    BatchWriter, SnapshotStore, SnapshotStoreConfig, StoreConfig, TraceStore, WriterConfig,
};
use retrace_stream::StreamHub;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// An assembled in-process engine for spec scenarios.
pub struct Engine {
    pub store: TraceStore,
    pub snapshots: SnapshotStore,
    pub writer: BatchWriter,
    pub reconstructor: Reconstructor,
    pub hub: StreamHub,
    pub ingest: IngestOrchestrator<retrace_core::SequentialIdGen>,
    pub clock: Arc<ManualClock>,
    _dir: TempDir,
}

impl Engine {
    /// Build a full engine on a scratch database.
    pub fn start() -> Self {
        Self::start_with_flush_interval(Duration::from_millis(100))
    }

    pub fn start_with_flush_interval(flush_interval: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let store = TraceStore::open(StoreConfig {
            path: dir.path().join("retrace.db"),
            ..StoreConfig::default()
        })
        .unwrap();
        let writer = BatchWriter::spawn(
            store.clone(),
            WriterConfig {
                flush_interval,
                ..WriterConfig::default()
            },
        )
        .unwrap();
        let snapshots = SnapshotStore::new(store.clone(), SnapshotStoreConfig::default());
        let reconstructor = Reconstructor::new(store.clone(), snapshots.clone());
        let hub = StreamHub::new();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let ingest = IngestOrchestrator::with_idgen(
            writer.clone(),
            hub.clone(),
            clock.clone() as Arc<dyn Clock>,
            retrace_core::SequentialIdGen::new("gen"),
        );

        Self {
            store,
            snapshots,
            writer,
            reconstructor,
            hub,
            ingest,
            clock,
            _dir: dir,
        }
    }

    /// Create a session starting at `start_time`.
    pub fn create_session(&self, id: &str, start_time: i64) {
        self.store
            .create_session(&SessionRecord::new(id, format!("session {id}"), start_time))
            .unwrap();
    }

    /// Ingest one event through the orchestrator.
    pub fn ingest_event(&self, draft: EventDraft) {
        self.ingest.ingest(draft).unwrap();
    }

    /// Force pending writes into the store.
    pub fn flush(&self) {
        self.writer.flush().unwrap();
    }
}

/// A fully-specified draft for scenario events.
pub fn draft(id: &str, session: &str, kind: EventKind, timestamp: i64) -> EventDraft {
    EventDraft {
        id: Some(id.to_string()),
        session_id: session.to_string(),
        agent_id: Some("agent-1".to_string()),
        kind,
        phase: Phase::Progress,
        timestamp: Some(timestamp),
        correlation_id: format!("corr-{id}"),
        parent_id: None,
        data: Value::Null,
        metadata: Value::Null,
        performance: Value::Null,
    }
}
