// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Breakpoint evaluation specs.

use crate::prelude::{draft, Engine};
use retrace_core::{EventKind, SystemState};
use retrace_replay::{
    Breakpoint, BreakpointCondition, BreakpointEngine, PerformanceMetric, ThresholdOp,
};
use retrace_store::TraceQuery;
use serde_json::json;

fn fail_breakpoint(skip_count: u32, max_hits: u32) -> Breakpoint {
    Breakpoint {
        id: "bp-fail".into(),
        name: "on task failure".to_string(),
        enabled: true,
        condition: BreakpointCondition::Expression {
            source: "event.type == 'task_fail'".to_string(),
        },
        action: "pause".to_string(),
        agent_filter: None,
        event_kind_filter: None,
        time_window: None,
        skip_count,
        max_hits,
        data_paths: vec!["event.data.error.message".to_string()],
    }
}

#[test]
fn skip_and_max_hits_over_replayed_failures() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    // Four consecutive failures.
    for t in 1..=4 {
        let mut fail = draft(&format!("f{t}"), "S", EventKind::TaskFail, t * 100);
        fail.data = json!({ "error": { "message": format!("failure {t}") } });
        engine.ingest_event(fail);
    }
    engine.flush();

    let mut bp_engine = BreakpointEngine::new();
    bp_engine.add(fail_breakpoint(1, 2)).unwrap();

    let mut state = SystemState::empty_at(0);
    let events = engine.store.traces(&TraceQuery::session("S")).unwrap();
    let mut fired = Vec::new();
    for event in &events {
        state.apply_event(event);
        for hit in bp_engine.evaluate(&state, event) {
            fired.push(hit);
        }
    }

    // Skip swallows #1; hits on #2 and #3; #4 sees a disabled breakpoint.
    assert_eq!(fired.len(), 2);
    assert_eq!(fired[0].event_id, "f2");
    assert_eq!(fired[1].event_id, "f3");
    assert_eq!(
        fired[0].collected_data["event.data.error.message"],
        json!("failure 2")
    );
    let installed: Vec<_> = bp_engine.breakpoints().collect();
    assert!(!installed[0].enabled);
}

#[test]
fn performance_breakpoint_fires_on_slow_events() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    let mut fast = draft("fast", "S", EventKind::AgentMethod, 100);
    fast.performance = json!({ "duration": 10.0 });
    engine.ingest_event(fast);
    let mut slow = draft("slow", "S", EventKind::AgentMethod, 200);
    slow.performance = json!({ "duration": 5000.0 });
    engine.ingest_event(slow);
    engine.flush();

    let mut bp_engine = BreakpointEngine::new();
    bp_engine
        .add(Breakpoint {
            id: "bp-slow".into(),
            name: "slow call".to_string(),
            enabled: true,
            condition: BreakpointCondition::Performance {
                metric: PerformanceMetric::Duration,
                operator: ThresholdOp::Gt,
                threshold: 1000.0,
            },
            action: "log".to_string(),
            agent_filter: None,
            event_kind_filter: None,
            time_window: None,
            skip_count: 0,
            max_hits: 0,
            data_paths: vec![],
        })
        .unwrap();

    let mut state = SystemState::empty_at(0);
    let events = engine.store.traces(&TraceQuery::session("S")).unwrap();
    let mut fired = Vec::new();
    for event in &events {
        state.apply_event(event);
        fired.extend(bp_engine.evaluate(&state, event));
    }

    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].event_id, "slow");
}

#[test]
fn state_predicate_breakpoints_see_replayed_state() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    for t in 1..=3 {
        let mut start = draft(&format!("s{t}"), "S", EventKind::TaskStart, t * 100);
        start.correlation_id = format!("T{t}");
        engine.ingest_event(start);
    }
    engine.flush();

    let mut bp_engine = BreakpointEngine::new();
    bp_engine
        .add(Breakpoint {
            id: "bp-state".into(),
            name: "two tasks running".to_string(),
            enabled: true,
            condition: BreakpointCondition::Expression {
                source: "state.timestamp >= 200".to_string(),
            },
            action: "pause".to_string(),
            agent_filter: None,
            event_kind_filter: None,
            time_window: None,
            skip_count: 0,
            max_hits: 1,
            data_paths: vec!["state.timestamp".to_string()],
        })
        .unwrap();

    let mut state = SystemState::empty_at(0);
    let events = engine.store.traces(&TraceQuery::session("S")).unwrap();
    let mut fired = Vec::new();
    for event in &events {
        state.apply_event(event);
        fired.extend(bp_engine.evaluate(&state, event));
    }

    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].event_id, "s2");
    assert_eq!(fired[0].collected_data["state.timestamp"], json!(200));
}
