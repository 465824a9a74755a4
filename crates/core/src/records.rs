// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Auxiliary persisted records keyed to sessions and agents.

use crate::id::{AgentId, SessionId, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A captured error, queryable independently of the trace stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: String,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub timestamp: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

/// A direct message between two agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub session_id: SessionId,
    pub from_agent: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<AgentId>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
}

/// One complete task execution, written when the task reaches a terminal
/// status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub session_id: SessionId,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub kind: String,
    pub status: String,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

/// A point-in-time resource sample for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub id: String,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub timestamp: i64,
    pub cpu: f64,
    pub memory: f64,
}

/// Aggregate performance metrics for a session at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub id: String,
    pub session_id: SessionId,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metrics: Value,
}
