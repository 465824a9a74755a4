// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot lifecycle and import/export specs.

use crate::prelude::{draft, Engine};
use retrace_core::{EventKind, SessionId};
use retrace_store::{ImportOutcome, SnapshotFilter, SnapshotOptions};

#[test]
fn export_milestone_and_import_into_fresh_store() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    for t in 1..=4 {
        let mut event = draft(&format!("e{t}"), "S", EventKind::TaskStart, t * 100);
        event.correlation_id = format!("T{t}");
        engine.ingest_event(event);
    }
    engine.flush();

    let session = SessionId::new("S");
    let state_a = engine.reconstructor.state_at(&session, 150).unwrap();
    engine
        .snapshots
        .create(
            &session,
            &state_a,
            SnapshotOptions {
                tags: vec!["a".to_string()],
                ..SnapshotOptions::default()
            },
        )
        .unwrap();

    let state_b = engine.reconstructor.state_at(&session, 350).unwrap();
    engine
        .snapshots
        .create(
            &session,
            &state_b,
            SnapshotOptions {
                tags: vec!["b".to_string(), "milestone".to_string()],
                description: Some("before rollout".to_string()),
                ..SnapshotOptions::default()
            },
        )
        .unwrap();

    // Filtering on the milestone tag yields exactly one entry.
    let bundle = engine
        .snapshots
        .export(
            &session,
            &SnapshotFilter {
                tag: Some("milestone".to_string()),
                ..SnapshotFilter::default()
            },
        )
        .unwrap();
    assert_eq!(bundle.snapshots.len(), 1);

    // Import into a fresh engine.
    let fresh = Engine::start();
    let outcomes = fresh.snapshots.import(&bundle).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], ImportOutcome::Imported(_)));

    let metas = fresh
        .snapshots
        .search(&SnapshotFilter::default())
        .unwrap();
    assert_eq!(metas.len(), 1);
    let source = &bundle.snapshots[0];
    assert_eq!(metas[0].id, source.meta.id);
    assert_eq!(metas[0].timestamp, source.meta.timestamp);
    assert_eq!(metas[0].tags, source.meta.tags);
    assert_eq!(metas[0].description, source.meta.description);

    let imported = fresh.snapshots.get(&metas[0].id).unwrap();
    assert_eq!(imported.state, source.state);
}

#[test]
fn nearest_snapshot_accelerates_reconstruction_transparently() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    for t in 1..=6 {
        let mut event = draft(&format!("e{t}"), "S", EventKind::TaskStart, t * 100);
        event.correlation_id = format!("T{t}");
        engine.ingest_event(event);
    }
    engine.flush();

    let session = SessionId::new("S");
    let before = engine.reconstructor.state_at(&session, 600).unwrap();

    // Snapshot mid-timeline, then reconstruct the same instant again.
    let mid = engine.reconstructor.state_at(&session, 300).unwrap();
    engine
        .snapshots
        .create(&session, &mid, SnapshotOptions::default())
        .unwrap();

    let after = engine.reconstructor.state_at(&session, 600).unwrap();
    assert_eq!(before, after);
}

#[test]
fn incremental_snapshots_chain_and_materialize() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    for t in 1..=3 {
        let mut event = draft(&format!("e{t}"), "S", EventKind::TaskStart, t * 100);
        event.correlation_id = format!("T{t}");
        engine.ingest_event(event);
    }
    engine.flush();

    let session = SessionId::new("S");
    let s100 = engine.reconstructor.state_at(&session, 100).unwrap();
    engine
        .snapshots
        .create(&session, &s100, SnapshotOptions::default())
        .unwrap();

    let s200 = engine.reconstructor.state_at(&session, 200).unwrap();
    let inc_id = engine
        .snapshots
        .create(
            &session,
            &s200,
            SnapshotOptions {
                incremental: true,
                ..SnapshotOptions::default()
            },
        )
        .unwrap();

    let materialized = engine.snapshots.get(&inc_id).unwrap();
    assert!(materialized.meta.incremental);
    assert_eq!(materialized.state, s200);

    // nearest() also materializes the delta chain.
    let nearest = engine.snapshots.nearest(&session, 250).unwrap().unwrap();
    assert_eq!(nearest.meta.id, inc_id);
    assert_eq!(nearest.state, s200);
}
