// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::event::{EventKind, Phase, TraceEvent};
use crate::id::{CorrelationId, EventId, SessionId};
use serde_json::json;

fn event(id: &str, kind: EventKind, timestamp: i64) -> TraceEvent {
    TraceEvent {
        id: EventId::new(id),
        session_id: SessionId::new("s-1"),
        agent_id: Some(AgentId::new("a-1")),
        kind,
        phase: Phase::Progress,
        timestamp,
        correlation_id: CorrelationId::new("t-1"),
        parent_id: None,
        data: serde_json::Value::Null,
        metadata: serde_json::Value::Null,
        performance: serde_json::Value::Null,
    }
}

#[test]
fn task_start_inserts_running_task_and_busies_agent() {
    let mut state = SystemState::empty_at(0);
    state.apply_event(&event("ev-1", EventKind::TaskStart, 100));

    let task = state.tasks.get(&TaskId::new("t-1")).unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.progress, 0.0);
    assert_eq!(task.started_at, 100);

    let agent = state.agents.get(&AgentId::new("a-1")).unwrap();
    assert_eq!(agent.status, AgentStatus::Busy);
    assert_eq!(agent.current_task, Some(TaskId::new("t-1")));
    assert_eq!(state.timestamp, 100);
}

#[test]
fn task_complete_releases_matching_agent() {
    let mut state = SystemState::empty_at(0);
    state.apply_event(&event("ev-1", EventKind::TaskStart, 100));
    state.apply_event(&event("ev-2", EventKind::TaskComplete, 200));

    let task = state.tasks.get(&TaskId::new("t-1")).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_at, Some(200));
    assert_eq!(task.progress, 1.0);

    let agent = state.agents.get(&AgentId::new("a-1")).unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.current_task, None);
    assert_eq!(agent.last_task, Some(TaskId::new("t-1")));
}

#[test]
fn task_complete_keeps_agent_busy_on_other_task() {
    let mut state = SystemState::empty_at(0);
    state.apply_event(&event("ev-1", EventKind::TaskStart, 100));

    // Completion of a different task must not release the agent.
    let mut other = event("ev-2", EventKind::TaskComplete, 150);
    other.correlation_id = CorrelationId::new("t-other");
    state.apply_event(&other);

    let agent = state.agents.get(&AgentId::new("a-1")).unwrap();
    assert_eq!(agent.status, AgentStatus::Busy);
    assert_eq!(agent.current_task, Some(TaskId::new("t-1")));
}

#[test]
fn task_fail_marks_task_and_records_error() {
    let mut state = SystemState::empty_at(0);
    state.apply_event(&event("ev-1", EventKind::TaskStart, 100));

    let mut fail = event("ev-2", EventKind::TaskFail, 200);
    fail.data = json!({ "error": { "message": "agent crashed" } });
    state.apply_event(&fail);

    let task = state.tasks.get(&TaskId::new("t-1")).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].message, "agent crashed");
    assert_eq!(state.errors[0].agent_id, Some(AgentId::new("a-1")));
    assert_eq!(state.errors[0].timestamp, 200);

    let agent = state.agents.get(&AgentId::new("a-1")).unwrap();
    assert_eq!(agent.status, AgentStatus::Error);
}

#[test]
fn agent_method_start_sets_busy_and_current_task() {
    let mut state = SystemState::empty_at(0);
    let mut e = event("ev-1", EventKind::AgentMethod, 50);
    e.phase = Phase::Start;
    e.data = json!({ "task": "t-7" });
    state.apply_event(&e);

    let agent = state.agents.get(&AgentId::new("a-1")).unwrap();
    assert_eq!(agent.status, AgentStatus::Busy);
    assert_eq!(agent.current_task, Some(TaskId::new("t-7")));
}

#[test]
fn communication_appends_by_correlation() {
    let mut state = SystemState::empty_at(0);
    let mut e1 = event("ev-1", EventKind::Communication, 100);
    e1.data = json!({ "to": "a-2", "payload": "hello" });
    let mut e2 = event("ev-2", EventKind::Communication, 110);
    e2.data = json!({ "to": "a-2", "payload": "again" });
    state.apply_event(&e1);
    state.apply_event(&e2);

    let records = state.communications.get(&CorrelationId::new("t-1")).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].event_id, EventId::new("ev-1"));
    assert_eq!(records[1].event_id, EventId::new("ev-2"));
}

#[test]
fn duplicate_events_apply_idempotently() {
    let mut state = SystemState::empty_at(0);
    let mut fail = event("ev-1", EventKind::TaskFail, 100);
    fail.data = json!({ "message": "boom" });
    state.apply_event(&fail);
    state.apply_event(&fail);
    assert_eq!(state.errors.len(), 1);

    let comm = event("ev-2", EventKind::Communication, 120);
    state.apply_event(&comm);
    state.apply_event(&comm);
    let records = state.communications.get(&CorrelationId::new("t-1")).unwrap();
    assert_eq!(records.len(), 1);
}

#[test]
fn data_processing_and_unknown_kinds_leave_state_untouched() {
    let mut state = SystemState::empty_at(0);
    state.apply_event(&event("ev-1", EventKind::DataProcessing, 100));
    state.apply_event(&event(
        "ev-2",
        EventKind::Other("custom_probe".to_string()),
        110,
    ));

    assert!(state.tasks.is_empty());
    assert!(state.errors.is_empty());
    // Timestamp still advances.
    assert_eq!(state.timestamp, 110);
}

#[test]
fn error_phase_event_lands_in_errors_ledger() {
    let mut state = SystemState::empty_at(0);
    let mut e = event("ev-1", EventKind::AgentMethod, 100);
    e.phase = Phase::Error;
    e.data = json!({ "message": "bad call" });
    state.apply_event(&e);

    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].message, "bad call");
}

#[test]
fn memory_payload_merges_into_memory_map() {
    let mut state = SystemState::empty_at(0);
    let mut e = event("ev-1", EventKind::DataProcessing, 100);
    e.data = json!({ "memory": { "plan": "phase-2", "retries": 3 } });
    state.apply_event(&e);

    assert_eq!(state.memory.len(), 2);
    let entry = state.memory.get("plan").unwrap();
    assert_eq!(entry.value, json!("phase-2"));
    assert_eq!(entry.timestamp, 100);
    assert_eq!(entry.agent_id, Some(AgentId::new("a-1")));
}

#[test]
fn performance_payload_updates_resources() {
    let mut state = SystemState::empty_at(0);
    let mut e = event("ev-1", EventKind::DataProcessing, 100);
    e.performance = json!({ "cpu": 0.75, "memory": 128.0 });
    state.apply_event(&e);

    let usage = state.resources.get(&AgentId::new("a-1")).unwrap();
    assert_eq!(usage.cpu, 0.75);
    assert_eq!(usage.memory, 128.0);
    assert_eq!(usage.timestamp, 100);
}

#[test]
fn referenced_agents_are_materialized_with_defaults() {
    let mut state = SystemState::empty_at(0);
    // Agent never announced itself; the task event must still materialize it.
    state.apply_event(&event("ev-1", EventKind::TaskStart, 100));
    assert!(state.agents.contains_key(&AgentId::new("a-1")));
}

#[test]
fn same_events_reconstruct_byte_identical_state() {
    let events: Vec<TraceEvent> = (0..20)
        .map(|i| {
            let kind = match i % 4 {
                0 => EventKind::TaskStart,
                1 => EventKind::Communication,
                2 => EventKind::TaskComplete,
                _ => EventKind::DataProcessing,
            };
            let mut e = event(&format!("ev-{i}"), kind, 100 + i);
            e.correlation_id = CorrelationId::new(format!("t-{}", i / 4));
            e
        })
        .collect();

    let mut a = SystemState::empty_at(0);
    let mut b = SystemState::empty_at(0);
    for e in &events {
        a.apply_event(e);
    }
    for e in &events {
        b.apply_event(e);
    }

    assert_eq!(a, b);
    let bytes_a = serde_json::to_vec(&a).unwrap();
    let bytes_b = serde_json::to_vec(&b).unwrap();
    assert_eq!(bytes_a, bytes_b);
}
