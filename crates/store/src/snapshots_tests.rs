// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::engine::{StoreConfig, TraceStore};
use retrace_core::{
    AgentId, AgentState, AgentStatus, CorrelationId, EventId, EventKind, Phase, TaskId, TraceEvent,
};
use tempfile::TempDir;

fn open_snapshots(dir: &TempDir, config: SnapshotStoreConfig) -> SnapshotStore {
    let store = TraceStore::open(StoreConfig {
        path: dir.path().join("retrace.db"),
        ..StoreConfig::default()
    })
    .unwrap();
    SnapshotStore::new(store, config)
}

fn state_at(timestamp: i64, tasks: usize) -> SystemState {
    let mut state = SystemState::empty_at(0);
    for i in 0..tasks {
        let e = TraceEvent {
            id: EventId::new(format!("ev-{timestamp}-{i}")),
            session_id: "s-1".into(),
            agent_id: Some(AgentId::new(format!("a-{i}"))),
            kind: EventKind::TaskStart,
            phase: Phase::Progress,
            timestamp,
            correlation_id: CorrelationId::new(format!("t-{i}")),
            parent_id: None,
            data: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            performance: serde_json::Value::Null,
        };
        state.apply_event(&e);
    }
    state.timestamp = timestamp;
    state
}

#[test]
fn create_and_nearest_roundtrip() {
    let dir = TempDir::new().unwrap();
    let snapshots = open_snapshots(&dir, SnapshotStoreConfig::default());
    let session = SessionId::new("s-1");

    let state = state_at(1000, 2);
    let id = snapshots
        .create(&session, &state, SnapshotOptions::default())
        .unwrap();

    // Nearest at a later instant returns the snapshot; earlier returns none.
    let got = snapshots.nearest(&session, 1500).unwrap().unwrap();
    assert_eq!(got.meta.id, id);
    assert_eq!(got.meta.agent_count, 2);
    assert_eq!(got.meta.task_count, 2);
    assert_eq!(got.state, state);

    assert!(snapshots.nearest(&session, 999).unwrap().is_none());
}

#[test]
fn nearest_picks_greatest_timestamp_at_or_before() {
    let dir = TempDir::new().unwrap();
    let snapshots = open_snapshots(&dir, SnapshotStoreConfig::default());
    let session = SessionId::new("s-1");

    snapshots
        .create(&session, &state_at(100, 1), SnapshotOptions::default())
        .unwrap();
    let mid = snapshots
        .create(&session, &state_at(200, 2), SnapshotOptions::default())
        .unwrap();
    snapshots
        .create(&session, &state_at(300, 3), SnapshotOptions::default())
        .unwrap();

    let got = snapshots.nearest(&session, 250).unwrap().unwrap();
    assert_eq!(got.meta.id, mid);
    assert_eq!(got.meta.timestamp, 200);
}

#[test]
fn incremental_snapshot_stores_delta_and_materializes() {
    let dir = TempDir::new().unwrap();
    let snapshots = open_snapshots(&dir, SnapshotStoreConfig::default());
    let session = SessionId::new("s-1");

    let full = state_at(1000, 3);
    snapshots
        .create(&session, &full, SnapshotOptions::default())
        .unwrap();

    let mut target = full.clone();
    target.timestamp = 2000;
    target.agents.insert(
        AgentId::new("a-new"),
        AgentState {
            status: AgentStatus::Busy,
            current_task: Some(TaskId::new("t-new")),
            ..AgentState::default()
        },
    );

    let id = snapshots
        .create(
            &session,
            &target,
            SnapshotOptions {
                incremental: true,
                ..SnapshotOptions::default()
            },
        )
        .unwrap();

    let got = snapshots.get(&id).unwrap();
    assert!(got.meta.incremental);
    assert_eq!(got.state, target);
    // The stored delta is much smaller than the full state would be.
    assert!(got.meta.size < serde_json::to_vec(&target).unwrap().len());
}

#[test]
fn delta_chain_depth_forces_full_snapshot() {
    let dir = TempDir::new().unwrap();
    let snapshots = open_snapshots(
        &dir,
        SnapshotStoreConfig {
            max_delta_chain: 2,
            ..SnapshotStoreConfig::default()
        },
    );
    let session = SessionId::new("s-1");

    let mut state = state_at(1000, 1);
    snapshots
        .create(&session, &state, SnapshotOptions::default())
        .unwrap();

    // Chain two deltas, then the third incremental request must go full.
    let mut last_id = None;
    for step in 1..=3 {
        state.timestamp = 1000 + step * 100;
        state.memory.insert(
            format!("key-{step}"),
            retrace_core::MemoryEntry {
                value: serde_json::json!(step),
                timestamp: state.timestamp,
                agent_id: None,
                entry_kind: "note".to_string(),
            },
        );
        last_id = Some(
            snapshots
                .create(
                    &session,
                    &state,
                    SnapshotOptions {
                        incremental: true,
                        ..SnapshotOptions::default()
                    },
                )
                .unwrap(),
        );
    }

    let last = snapshots.get(&last_id.unwrap()).unwrap();
    assert!(!last.meta.incremental, "chain cap must force a full snapshot");
    assert_eq!(last.state, state);
}

#[test]
fn untagged_lru_eviction_spares_tagged() {
    let dir = TempDir::new().unwrap();
    let snapshots = open_snapshots(
        &dir,
        SnapshotStoreConfig {
            max_snapshots: 2,
            ..SnapshotStoreConfig::default()
        },
    );
    let session = SessionId::new("s-1");

    let tagged = snapshots
        .create(
            &session,
            &state_at(100, 1),
            SnapshotOptions {
                tags: vec!["milestone".to_string()],
                ..SnapshotOptions::default()
            },
        )
        .unwrap();
    snapshots
        .create(&session, &state_at(200, 1), SnapshotOptions::default())
        .unwrap();
    let newest = snapshots
        .create(&session, &state_at(300, 1), SnapshotOptions::default())
        .unwrap();

    let metas = snapshots.search(&SnapshotFilter::default()).unwrap();
    let ids: Vec<&SnapshotId> = metas.iter().map(|m| &m.id).collect();
    assert_eq!(metas.len(), 2);
    assert!(ids.contains(&&tagged), "tagged snapshot must never be evicted");
    assert!(ids.contains(&&newest));
}

#[test]
fn search_filters_by_tag_and_orders() {
    let dir = TempDir::new().unwrap();
    let snapshots = open_snapshots(&dir, SnapshotStoreConfig::default());
    let session = SessionId::new("s-1");

    snapshots
        .create(
            &session,
            &state_at(100, 1),
            SnapshotOptions {
                tags: vec!["a".to_string()],
                ..SnapshotOptions::default()
            },
        )
        .unwrap();
    snapshots
        .create(
            &session,
            &state_at(200, 1),
            SnapshotOptions {
                tags: vec!["b".to_string(), "milestone".to_string()],
                ..SnapshotOptions::default()
            },
        )
        .unwrap();

    let milestone = snapshots
        .search(&SnapshotFilter {
            tag: Some("milestone".to_string()),
            ..SnapshotFilter::default()
        })
        .unwrap();
    assert_eq!(milestone.len(), 1);
    assert_eq!(milestone[0].timestamp, 200);

    let descending = snapshots
        .search(&SnapshotFilter {
            order: SortOrder::Descending,
            ..SnapshotFilter::default()
        })
        .unwrap();
    assert_eq!(descending[0].timestamp, 200);
    assert_eq!(descending[1].timestamp, 100);
}

#[test]
fn export_import_roundtrip() {
    let dir = TempDir::new().unwrap();
    let snapshots = open_snapshots(&dir, SnapshotStoreConfig::default());
    let session = SessionId::new("s-1");

    snapshots
        .create(
            &session,
            &state_at(100, 1),
            SnapshotOptions {
                tags: vec!["a".to_string()],
                ..SnapshotOptions::default()
            },
        )
        .unwrap();
    snapshots
        .create(
            &session,
            &state_at(200, 2),
            SnapshotOptions {
                tags: vec!["b".to_string(), "milestone".to_string()],
                description: Some("before rollout".to_string()),
                ..SnapshotOptions::default()
            },
        )
        .unwrap();

    let bundle = snapshots
        .export(
            &session,
            &SnapshotFilter {
                tag: Some("milestone".to_string()),
                ..SnapshotFilter::default()
            },
        )
        .unwrap();
    assert_eq!(bundle.snapshots.len(), 1);

    // Import into a fresh store.
    let dir2 = TempDir::new().unwrap();
    let fresh = open_snapshots(&dir2, SnapshotStoreConfig::default());
    let outcomes = fresh.import(&bundle).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], ImportOutcome::Imported(_)));

    let metas = fresh.search(&SnapshotFilter::default()).unwrap();
    assert_eq!(metas.len(), 1);
    let source = &bundle.snapshots[0];
    assert_eq!(metas[0].id, source.meta.id);
    assert_eq!(metas[0].timestamp, source.meta.timestamp);
    assert_eq!(metas[0].tags, source.meta.tags);
    assert_eq!(metas[0].description, source.meta.description);

    let imported = fresh.get(&metas[0].id).unwrap();
    assert_eq!(imported.state, source.state);

    // Bundle itself roundtrips through JSON bit-equivalently.
    let json = serde_json::to_string(&bundle).unwrap();
    let back: SnapshotBundle = serde_json::from_str(&json).unwrap();
    assert_eq!(back, bundle);
}

#[test]
fn import_reports_invalid_and_skipped_entries() {
    let dir = TempDir::new().unwrap();
    let snapshots = open_snapshots(&dir, SnapshotStoreConfig::default());
    let session = SessionId::new("s-1");

    snapshots
        .create(&session, &state_at(100, 1), SnapshotOptions::default())
        .unwrap();
    let bundle = snapshots
        .export(&session, &SnapshotFilter::default())
        .unwrap();

    // Importing into the same store skips the duplicate.
    let outcomes = snapshots.import(&bundle).unwrap();
    assert!(matches!(outcomes[0], ImportOutcome::Skipped(_)));

    // A dangling agent reference is rejected with a reason.
    let mut broken = bundle.clone();
    broken.snapshots[0].meta.id = SnapshotId::new("broken");
    if let Some(task) = broken.snapshots[0].state.tasks.values_mut().next() {
        task.agent_id = Some(AgentId::new("ghost"));
    }
    let outcomes = snapshots.import(&broken).unwrap();
    assert!(matches!(outcomes[0], ImportOutcome::Invalid { .. }));
}
