// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use retrace_core::{CorrelationId, EventId, SessionRecord};
use serde_json::json;
use tempfile::TempDir;

pub(crate) fn open_store(dir: &TempDir) -> TraceStore {
    TraceStore::open(StoreConfig {
        path: dir.path().join("retrace.db"),
        ..StoreConfig::default()
    })
    .unwrap()
}

pub(crate) fn event(id: &str, session: &str, timestamp: i64) -> TraceEvent {
    TraceEvent {
        id: EventId::new(id),
        session_id: SessionId::new(session),
        agent_id: Some(AgentId::new("a-1")),
        kind: EventKind::TaskStart,
        phase: Phase::Progress,
        timestamp,
        correlation_id: CorrelationId::new("corr-1"),
        parent_id: None,
        data: Value::Null,
        metadata: Value::Null,
        performance: Value::Null,
    }
}

#[test]
fn insert_and_query_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut e = event("ev-1", "s-1", 100);
    e.data = json!({ "task": "t-1", "note": "hello" });
    store.insert_events(&[e.clone()]).unwrap();

    let got = store.traces(&TraceQuery::session("s-1")).unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0], e);
}

#[test]
fn query_orders_by_timestamp_then_id() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    // Insert out of order, including a timestamp tie.
    let events = vec![
        event("ev-c", "s-1", 300),
        event("ev-b", "s-1", 100),
        event("ev-a", "s-1", 100),
    ];
    store.insert_events(&events).unwrap();

    let got = store.traces(&TraceQuery::session("s-1")).unwrap();
    let ids: Vec<&str> = got.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["ev-a", "ev-b", "ev-c"]);
}

#[test]
fn query_filters_by_agent_kind_and_range() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut e1 = event("ev-1", "s-1", 100);
    e1.kind = EventKind::TaskStart;
    let mut e2 = event("ev-2", "s-1", 200);
    e2.kind = EventKind::Communication;
    e2.agent_id = Some(AgentId::new("a-2"));
    let mut e3 = event("ev-3", "s-1", 300);
    e3.kind = EventKind::TaskComplete;
    store.insert_events(&[e1, e2, e3]).unwrap();

    let by_agent = store
        .traces(&TraceQuery {
            agent_id: Some(AgentId::new("a-2")),
            ..TraceQuery::session("s-1")
        })
        .unwrap();
    assert_eq!(by_agent.len(), 1);
    assert_eq!(by_agent[0].id, "ev-2");

    let by_kind = store
        .traces(&TraceQuery {
            kinds: vec![EventKind::TaskStart, EventKind::TaskComplete],
            ..TraceQuery::session("s-1")
        })
        .unwrap();
    assert_eq!(by_kind.len(), 2);

    let by_range = store
        .traces(&TraceQuery {
            time_range: Some((150, 250)),
            ..TraceQuery::session("s-1")
        })
        .unwrap();
    assert_eq!(by_range.len(), 1);
    assert_eq!(by_range[0].id, "ev-2");
}

#[test]
fn query_limit_and_offset() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let events: Vec<TraceEvent> = (0..10)
        .map(|i| event(&format!("ev-{i:02}"), "s-1", 100 + i))
        .collect();
    store.insert_events(&events).unwrap();

    let page = store
        .traces(&TraceQuery {
            limit: Some(3),
            offset: Some(4),
            ..TraceQuery::session("s-1")
        })
        .unwrap();
    let ids: Vec<&str> = page.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["ev-04", "ev-05", "ev-06"]);
}

#[test]
fn duplicate_ids_are_ignored_idempotently() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let e = event("ev-1", "s-1", 100);
    store.insert_events(&[e.clone()]).unwrap();
    store.insert_events(&[e]).unwrap();

    assert_eq!(store.stats().unwrap().traces, 1);
}

#[test]
fn parent_id_materializes_relationship_edge() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut parent = event("a", "s-1", 10);
    parent.kind = EventKind::TaskStart;
    let mut child = event("b", "s-1", 20);
    child.kind = EventKind::TaskComplete;
    child.phase = Phase::End;
    child.parent_id = Some(EventId::new("a"));
    store.insert_events(&[parent, child]).unwrap();

    let edges = store.relationships(&SessionId::new("s-1")).unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].parent_id, "a");
    assert_eq!(edges[0].child_id, "b");
    assert_eq!(edges[0].kind, RelationshipKind::Sequence);
}

#[test]
fn relationship_edges_are_unique_per_pair() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut child = event("b", "s-1", 20);
    child.parent_id = Some(EventId::new("a"));
    store.insert_events(&[child.clone()]).unwrap();
    store.insert_events(&[child]).unwrap();

    assert_eq!(store.stats().unwrap().trace_relationships, 1);
}

#[test]
fn late_arriving_parent_is_tolerated() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    // Child first; the edge row exists before the parent event lands.
    let mut child = event("b", "s-1", 20);
    child.parent_id = Some(EventId::new("a"));
    store.insert_events(&[child]).unwrap();
    store.insert_events(&[event("a", "s-1", 10)]).unwrap();

    let edges = store.relationships(&SessionId::new("s-1")).unwrap();
    assert_eq!(edges.len(), 1);
}

#[test]
fn large_payload_roundtrips_through_compression() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut e = event("ev-1", "s-1", 100);
    e.data = json!({ "blob": "z".repeat(50_000) });
    store.insert_events(&[e.clone()]).unwrap();

    let got = store.traces(&TraceQuery::session("s-1")).unwrap();
    assert_eq!(got[0].data, e.data);
}

#[test]
fn traces_after_paginates_by_keyset() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let events: Vec<TraceEvent> = (0..5)
        .map(|i| event(&format!("ev-{i}"), "s-1", 100 + i))
        .collect();
    store.insert_events(&events).unwrap();

    let session = SessionId::new("s-1");
    let first = store.traces_after(&session, i64::MIN, None, 104, 2).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].id, "ev-0");

    let rest = store
        .traces_after(&session, first[1].timestamp, Some(first[1].id.as_str()), 104, 10)
        .unwrap();
    let ids: Vec<&str> = rest.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["ev-2", "ev-3", "ev-4"]);
}

#[test]
fn traces_after_excludes_cursor_timestamp_when_no_id() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store
        .insert_events(&[
            event("ev-0", "s-1", 100),
            event("ev-1", "s-1", 100),
            event("ev-2", "s-1", 200),
        ])
        .unwrap();

    // Strict timestamp bound: events at the snapshot instant are excluded.
    let got = store
        .traces_after(&SessionId::new("s-1"), 100, None, 300, 10)
        .unwrap();
    let ids: Vec<&str> = got.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["ev-2"]);
}

#[test]
fn session_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let session = SessionRecord::new("s-1", "first run", 1000);
    store.create_session(&session).unwrap();

    let got = store.get_session(&SessionId::new("s-1")).unwrap().unwrap();
    assert_eq!(got.name, "first run");
    assert_eq!(got.status, SessionStatus::Active);
    assert_eq!(got.end_time, None);

    store
        .close_session(&SessionId::new("s-1"), SessionStatus::Completed, 2000)
        .unwrap();
    let got = store.get_session(&SessionId::new("s-1")).unwrap().unwrap();
    assert_eq!(got.status, SessionStatus::Completed);
    assert_eq!(got.end_time, Some(2000));

    let active = store.sessions(Some(SessionStatus::Active)).unwrap();
    assert!(active.is_empty());
    let completed = store.sessions(Some(SessionStatus::Completed)).unwrap();
    assert_eq!(completed.len(), 1);
}

#[test]
fn close_unknown_session_fails() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let err = store
        .close_session(&SessionId::new("nope"), SessionStatus::Completed, 1)
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownSession(_)));
}

#[test]
fn archive_removes_old_rows_and_orphan_edges() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut old_child = event("old-child", "s-1", 100);
    old_child.parent_id = Some(EventId::new("old-parent"));
    store
        .insert_events(&[event("old-parent", "s-1", 50), old_child, event("new", "s-1", 5000)])
        .unwrap();

    let removed = store.archive_before(1000).unwrap();
    assert_eq!(removed, 2);

    let stats = store.stats().unwrap();
    assert_eq!(stats.traces, 1);
    assert_eq!(stats.trace_relationships, 0);
}

#[test]
fn archive_older_than_uses_hour_cutoff() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let now = 10 * 3_600_000;
    store
        .insert_events(&[event("old", "s-1", 1000), event("new", "s-1", now - 1000)])
        .unwrap();

    let removed = store.archive_older_than(2, now).unwrap();
    assert_eq!(removed, 1);
}

#[test]
fn stats_reports_counts_and_disk_size() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store
        .insert_events(&[event("ev-1", "s-1", 100), event("ev-2", "s-1", 200)])
        .unwrap();
    store
        .create_session(&SessionRecord::new("s-1", "run", 100))
        .unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.traces, 2);
    assert_eq!(stats.sessions, 1);
    assert!(stats.disk_bytes > 0);
}

#[test]
fn compact_runs_after_flush() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.insert_events(&[event("ev-1", "s-1", 100)]).unwrap();
    store.compact().unwrap();
    assert_eq!(store.stats().unwrap().traces, 1);
}

#[test]
fn schema_version_is_current() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    assert_eq!(store.schema_version().unwrap(), crate::SCHEMA_VERSION);
}

#[test]
fn aux_records_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let session = SessionId::new("s-1");

    store
        .record_error(&retrace_core::ErrorEvent {
            id: "err-1".to_string(),
            session_id: session.clone(),
            agent_id: Some(AgentId::new("a-1")),
            timestamp: 100,
            message: "boom".to_string(),
            stack: None,
            context: json!({ "step": 3 }),
        })
        .unwrap();
    let errors = store.errors(&session, None).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "boom");
    assert_eq!(errors[0].context, json!({ "step": 3 }));

    store
        .record_message(&retrace_core::AgentMessage {
            id: "msg-1".to_string(),
            session_id: session.clone(),
            from_agent: AgentId::new("a-1"),
            to_agent: Some(AgentId::new("a-2")),
            timestamp: 150,
            content: json!("ping"),
        })
        .unwrap();
    let messages = store.messages(&session, Some((100, 200))).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, json!("ping"));

    store
        .record_task_execution(&retrace_core::TaskExecution {
            id: "task-1".to_string(),
            session_id: session.clone(),
            task_id: "t-1".into(),
            agent_id: Some(AgentId::new("a-1")),
            kind: "build".to_string(),
            status: "completed".to_string(),
            started_at: 100,
            completed_at: Some(300),
            duration_ms: Some(200.0),
        })
        .unwrap();
    let tasks = store.task_executions(&session).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].duration_ms, Some(200.0));

    store
        .record_resource_sample(&retrace_core::ResourceSample {
            id: "res-1".to_string(),
            session_id: session.clone(),
            agent_id: AgentId::new("a-1"),
            timestamp: 120,
            cpu: 0.5,
            memory: 64.0,
        })
        .unwrap();
    let samples = store
        .resource_usage(&session, Some(&AgentId::new("a-1")), None)
        .unwrap();
    assert_eq!(samples.len(), 1);

    store
        .record_performance(&retrace_core::PerformanceRecord {
            id: "perf-1".to_string(),
            session_id: session.clone(),
            timestamp: 130,
            metrics: json!({ "events_per_sec": 42 }),
        })
        .unwrap();
    let perf = store.performance_records(&session, None).unwrap();
    assert_eq!(perf.len(), 1);
}
