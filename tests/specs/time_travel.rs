// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Time-travel reconstruction specs.

use crate::prelude::{draft, Engine};
use retrace_core::{EventKind, SessionId, TaskId, TaskStatus};
use serde_json::json;

#[test]
fn state_at_shows_running_then_completed() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    let mut start = draft("e1", "S", EventKind::TaskStart, 100);
    start.data = json!({ "task": "T1" });
    start.correlation_id = "T1".to_string();
    engine.ingest_event(start);

    let mut complete = draft("e2", "S", EventKind::TaskComplete, 200);
    complete.data = json!({ "task": "T1" });
    complete.correlation_id = "T1".to_string();
    engine.ingest_event(complete);

    engine.flush();

    let session = SessionId::new("S");
    let at_150 = engine.reconstructor.state_at(&session, 150).unwrap();
    assert_eq!(
        at_150.tasks.get(&TaskId::new("T1")).unwrap().status,
        TaskStatus::Running
    );

    let at_250 = engine.reconstructor.state_at(&session, 250).unwrap();
    assert_eq!(
        at_250.tasks.get(&TaskId::new("T1")).unwrap().status,
        TaskStatus::Completed
    );
}

#[test]
fn repeated_reconstruction_is_identical() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    for t in 1..=20 {
        let kind = if t % 2 == 0 {
            EventKind::TaskComplete
        } else {
            EventKind::TaskStart
        };
        let mut event = draft(&format!("e{t:02}"), "S", kind, t * 10);
        event.correlation_id = format!("T{}", t / 2);
        engine.ingest_event(event);
    }
    engine.flush();

    let session = SessionId::new("S");
    let a = engine.reconstructor.state_at(&session, 150).unwrap();
    let b = engine.reconstructor.state_at(&session, 150).unwrap();
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_vec(&a).unwrap(),
        serde_json::to_vec(&b).unwrap()
    );
}

#[test]
fn diff_is_a_superset_of_applied_changes() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    let mut start = draft("e1", "S", EventKind::TaskStart, 100);
    start.correlation_id = "T1".to_string();
    engine.ingest_event(start);
    let mut second = draft("e2", "S", EventKind::TaskStart, 300);
    second.correlation_id = "T2".to_string();
    engine.ingest_event(second);
    engine.flush();

    let session = SessionId::new("S");
    let s1 = engine.reconstructor.state_at(&session, 200).unwrap();
    let s2 = engine.reconstructor.state_at(&session, 400).unwrap();

    let diff = retrace_replay::diff_states(&s1, &s2);
    // The task started in (200, 400] appears as an addition.
    assert!(diff.tasks.added.contains_key(&TaskId::new("T2")));
    assert!(!diff.tasks.added.contains_key(&TaskId::new("T1")));
}

#[test]
fn find_origin_pinpoints_first_failure() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    engine.ingest_event(draft("ok-1", "S", EventKind::TaskStart, 100));
    let mut fail = draft("boom", "S", EventKind::TaskFail, 200);
    fail.data = json!({ "error": { "message": "disk full" } });
    engine.ingest_event(fail);
    engine.ingest_event(draft("ok-2", "S", EventKind::TaskStart, 300));
    engine.flush();

    let origin = engine
        .reconstructor
        .find_origin(&SessionId::new("S"), |state| !state.errors.is_empty())
        .unwrap()
        .unwrap();
    assert_eq!(origin.event_id, "boom");
    assert_eq!(origin.timestamp, 200);
}

#[test]
fn critical_path_follows_heaviest_causal_chain() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    let mut root = draft("root", "S", EventKind::AgentMethod, 100);
    root.performance = json!({ "duration": 5.0 });
    engine.ingest_event(root);

    let mut fast = draft("fast", "S", EventKind::AgentMethod, 200);
    fast.parent_id = Some("root".to_string());
    fast.performance = json!({ "duration": 1.0 });
    engine.ingest_event(fast);

    let mut slow = draft("slow", "S", EventKind::AgentMethod, 250);
    slow.parent_id = Some("root".to_string());
    slow.performance = json!({ "duration" : 90.0 });
    engine.ingest_event(slow);

    engine.flush();

    let path = engine
        .reconstructor
        .critical_path(&SessionId::new("S"), (0, 1000))
        .unwrap();
    let ids: Vec<&str> = path.path.iter().map(|id| id.as_str()).collect();
    assert_eq!(ids, vec!["root", "slow"]);
    assert_eq!(path.total_duration_ms, 95.0);
}
