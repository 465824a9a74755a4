// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reconstructed system state and its deterministic event transitions.
//!
//! `SystemState` is the coherent view of all agents, tasks, memory entries
//! and communications as of one instant. Replay applies events in
//! `(timestamp, id)` order; every transition here is pure CPU work with no
//! suspension points, and all collections are ordered maps so two replays
//! of the same inputs serialize byte-identically.

use crate::event::{EventKind, Phase, TraceEvent};
use crate::id::{AgentId, CorrelationId, EventId, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// What an agent is doing at the reconstructed instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Error,
}

/// Per-agent view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Timestamp of the event that last touched this agent.
    #[serde(default)]
    pub updated_at: i64,
}

/// Lifecycle status of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

/// Per-task view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub kind: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

/// One shared-memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub value: Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entry_kind: String,
}

/// One inter-agent message, keyed under its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationRecord {
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Latest resource sample per agent, taken from `event.performance`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub timestamp: i64,
}

/// An error observed during replay, keyed by `(agent, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub timestamp: i64,
    pub message: String,
}

/// A coherent view of the whole system as of `timestamp`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemState {
    pub timestamp: i64,
    #[serde(default)]
    pub agents: BTreeMap<AgentId, AgentState>,
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, TaskState>,
    #[serde(default)]
    pub memory: BTreeMap<String, MemoryEntry>,
    #[serde(default)]
    pub communications: BTreeMap<CorrelationId, Vec<CommunicationRecord>>,
    #[serde(default)]
    pub resources: BTreeMap<AgentId, ResourceUsage>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
}

impl SystemState {
    /// Empty state at the given instant.
    pub fn empty_at(timestamp: i64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    /// Materialize the agent entry, defaulting it when the agent was never
    /// announced. Keeps the invariant that every agent referenced by a task
    /// or memory entry appears in the agents map.
    pub fn agent_entry(&mut self, agent_id: &AgentId) -> &mut AgentState {
        self.agents.entry(agent_id.clone()).or_default()
    }

    /// Apply one event's deterministic state transition.
    ///
    /// Handlers are idempotent with respect to replayed duplicates: inserts
    /// are guarded by existence checks and updates use assignment, never
    /// accumulation (the errors and communications ledgers are keyed by
    /// event id and deduplicated on append).
    pub fn apply_event(&mut self, event: &TraceEvent) {
        self.timestamp = self.timestamp.max(event.timestamp);

        match &event.kind {
            EventKind::AgentMethod => {
                if event.phase == Phase::Start {
                    if let Some(agent_id) = &event.agent_id {
                        let task = event.task_id().map(TaskId::from);
                        let agent = self.agent_entry(agent_id);
                        agent.status = AgentStatus::Busy;
                        if let Some(task) = task {
                            agent.current_task = Some(task);
                        }
                        agent.updated_at = event.timestamp;
                    }
                }
            }

            EventKind::TaskStart => {
                let Some(task_id) = event.task_id().map(TaskId::from) else {
                    return;
                };
                if !self.tasks.contains_key(&task_id) {
                    self.tasks.insert(
                        task_id.clone(),
                        TaskState {
                            agent_id: event.agent_id.clone(),
                            kind: event
                                .data
                                .get("task_type")
                                .and_then(Value::as_str)
                                .unwrap_or("task")
                                .to_string(),
                            status: TaskStatus::Running,
                            progress: 0.0,
                            started_at: event.timestamp,
                            completed_at: None,
                        },
                    );
                }
                if let Some(agent_id) = event.agent_id.clone() {
                    let agent = self.agent_entry(&agent_id);
                    agent.status = AgentStatus::Busy;
                    agent.current_task = Some(task_id);
                    agent.updated_at = event.timestamp;
                }
            }

            EventKind::TaskComplete => {
                let Some(task_id) = event.task_id().map(TaskId::from) else {
                    return;
                };
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Completed;
                    task.progress = 1.0;
                    task.completed_at = Some(event.timestamp);
                }
                if let Some(agent_id) = &event.agent_id {
                    let agent = self.agent_entry(agent_id);
                    if agent.current_task.as_ref() == Some(&task_id) {
                        agent.status = AgentStatus::Idle;
                        agent.current_task = None;
                        agent.last_task = Some(task_id);
                    }
                    agent.updated_at = event.timestamp;
                }
            }

            EventKind::TaskFail | EventKind::Error => {
                if let Some(task_id) = event.task_id().map(TaskId::from) {
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        task.status = TaskStatus::Failed;
                        task.completed_at = Some(event.timestamp);
                    }
                }
                if let Some(agent_id) = &event.agent_id {
                    let agent = self.agent_entry(agent_id);
                    agent.status = AgentStatus::Error;
                    agent.updated_at = event.timestamp;
                }
                self.record_error(event);
            }

            EventKind::Communication => {
                let record = CommunicationRecord {
                    event_id: event.id.clone(),
                    agent_id: event.agent_id.clone(),
                    timestamp: event.timestamp,
                    data: event.data.clone(),
                };
                let entries = self
                    .communications
                    .entry(event.correlation_id.clone())
                    .or_default();
                if !entries.iter().any(|r| r.event_id == event.id) {
                    entries.push(record);
                }
                if let Some(agent_id) = &event.agent_id {
                    self.agent_entry(agent_id).updated_at = event.timestamp;
                }
            }

            // No state transition; retained in the event stream only.
            EventKind::DataProcessing | EventKind::Other(_) => {}
        }

        // Error-phase events land in the errors ledger regardless of kind.
        if event.phase == Phase::Error
            && !matches!(event.kind, EventKind::TaskFail | EventKind::Error)
        {
            self.record_error(event);
        }

        self.merge_memory(event);
        self.sample_resources(event);
    }

    fn record_error(&mut self, event: &TraceEvent) {
        if self.errors.iter().any(|e| e.event_id == event.id) {
            return;
        }
        self.errors.push(ErrorRecord {
            event_id: event.id.clone(),
            agent_id: event.agent_id.clone(),
            timestamp: event.timestamp,
            message: event.error_message().unwrap_or("unknown error").to_string(),
        });
    }

    /// Fold `data.memory` object entries into the shared memory map.
    fn merge_memory(&mut self, event: &TraceEvent) {
        let Some(entries) = event.data.get("memory").and_then(Value::as_object) else {
            return;
        };
        for (key, value) in entries {
            self.memory.insert(
                key.clone(),
                MemoryEntry {
                    value: value.clone(),
                    timestamp: event.timestamp,
                    agent_id: event.agent_id.clone(),
                    entry_kind: event.kind.as_str().to_string(),
                },
            );
        }
        if let Some(agent_id) = &event.agent_id {
            self.agent_entry(agent_id).updated_at = event.timestamp;
        }
    }

    /// Keep the latest cpu/memory sample per agent from `event.performance`.
    fn sample_resources(&mut self, event: &TraceEvent) {
        let Some(agent_id) = &event.agent_id else {
            return;
        };
        let cpu = event.performance.get("cpu").and_then(Value::as_f64);
        let memory = event.performance.get("memory").and_then(Value::as_f64);
        if cpu.is_none() && memory.is_none() {
            return;
        }
        let sample = self.resources.entry(agent_id.clone()).or_default();
        if let Some(cpu) = cpu {
            sample.cpu = cpu;
        }
        if let Some(memory) = memory {
            sample.memory = memory;
        }
        sample.timestamp = event.timestamp;
        self.agent_entry(agent_id).updated_at = event.timestamp;
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
