// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Batched ingest and causality specs.

use crate::prelude::{draft, Engine};
use retrace_core::{EventKind, Phase, RelationshipKind, SessionId};
use retrace_store::TraceQuery;
use std::time::Duration;

#[test]
fn batched_ingest_then_query_returns_all_in_order() {
    let engine = Engine::start_with_flush_interval(Duration::from_millis(50));
    engine.create_session("S", 0);

    // 5 events at t=1..5, ascending ids, same session.
    for t in 1..=5 {
        engine.ingest_event(draft(
            &format!("ev-{t}"),
            "S",
            EventKind::TaskStart,
            t,
        ));
    }

    // After the flush interval the batch is committed.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let traces = loop {
        let traces = engine.store.traces(&TraceQuery::session("S")).unwrap();
        if traces.len() == 5 {
            break traces;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "batch was not flushed within the interval"
        );
        std::thread::sleep(Duration::from_millis(10));
    };

    let ids: Vec<&str> = traces.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["ev-1", "ev-2", "ev-3", "ev-4", "ev-5"]);
    let timestamps: Vec<i64> = traces.iter().map(|e| e.timestamp).collect();
    assert_eq!(timestamps, vec![1, 2, 3, 4, 5]);
}

#[test]
fn parent_child_causality_materializes_sequence_edge() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    engine.ingest_event(draft("a", "S", EventKind::TaskStart, 10));
    let mut child = draft("b", "S", EventKind::TaskComplete, 20);
    child.parent_id = Some("a".to_string());
    engine.ingest_event(child);
    engine.flush();

    let edges = engine
        .store
        .relationships(&SessionId::new("S"))
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].parent_id, "a");
    assert_eq!(edges[0].child_id, "b");
    assert_eq!(edges[0].kind, RelationshipKind::Sequence);

    // Causality invariant: the child never precedes its parent.
    let traces = engine.store.traces(&TraceQuery::session("S")).unwrap();
    let parent = traces.iter().find(|e| e.id == "a").unwrap();
    let child = traces.iter().find(|e| e.id == "b").unwrap();
    assert!(child.timestamp >= parent.timestamp);
}

#[test]
fn spawn_edge_for_start_phase_children() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    engine.ingest_event(draft("root", "S", EventKind::TaskStart, 10));
    let mut child = draft("spawned", "S", EventKind::TaskStart, 20);
    child.parent_id = Some("root".to_string());
    child.phase = Phase::Start;
    engine.ingest_event(child);
    engine.flush();

    let edges = engine
        .store
        .relationships(&SessionId::new("S"))
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].kind, RelationshipKind::Spawn);
}

#[test]
fn invalid_events_are_rejected_synchronously() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    let mut bad = draft("x", "", EventKind::TaskStart, 10);
    bad.session_id = String::new();
    assert!(engine.ingest.ingest(bad).is_err());

    engine.flush();
    assert_eq!(engine.store.stats().unwrap().traces, 0);
}

#[test]
fn payload_roundtrips_through_storage_compression() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    let mut event = draft("big", "S", EventKind::DataProcessing, 10);
    event.data = serde_json::json!({ "payload": "y".repeat(20_000) });
    engine.ingest_event(event.clone());
    engine.flush();

    let traces = engine.store.traces(&TraceQuery::session("S")).unwrap();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].data, event.data);
}
