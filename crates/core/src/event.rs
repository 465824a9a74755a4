// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trace event types and relationship inference

use crate::id::{AgentId, CorrelationId, EventId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum serialized size of each variable payload (`data`, `metadata`,
/// `performance`).
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Validation errors for incoming trace events.
///
/// These are caller bugs: the event is rejected synchronously and nothing
/// is persisted or published.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid timestamp: {0}")]
    BadTimestamp(i64),
    #[error("payload '{field}' too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },
}

/// Kind of trace event.
///
/// Known kinds drive state transitions during replay; anything else
/// deserializes to `Other` and is retained in the event stream only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskStart,
    TaskComplete,
    TaskFail,
    Communication,
    AgentMethod,
    Error,
    DataProcessing,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::TaskStart => "task_start",
            EventKind::TaskComplete => "task_complete",
            EventKind::TaskFail => "task_fail",
            EventKind::Communication => "communication",
            EventKind::AgentMethod => "agent_method",
            EventKind::Error => "error",
            EventKind::DataProcessing => "data_processing",
            EventKind::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "task_start" => EventKind::TaskStart,
            "task_complete" => EventKind::TaskComplete,
            "task_fail" => EventKind::TaskFail,
            "communication" => EventKind::Communication,
            "agent_method" => EventKind::AgentMethod,
            "error" => EventKind::Error,
            "data_processing" => EventKind::DataProcessing,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventKind::from_name(&s))
    }
}

/// Phase of the operation the event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    End,
    #[default]
    Progress,
    Error,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Start => write!(f, "start"),
            Phase::End => write!(f, "end"),
            Phase::Progress => write!(f, "progress"),
            Phase::Error => write!(f, "error"),
        }
    }
}

/// Kind of causal edge between a parent and a child event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipKind {
    Communication,
    Spawn,
    Parallel,
    Sequence,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::Communication => "communication",
            RelationshipKind::Spawn => "spawn",
            RelationshipKind::Parallel => "parallel",
            RelationshipKind::Sequence => "sequence",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "communication" => Some(RelationshipKind::Communication),
            "spawn" => Some(RelationshipKind::Spawn),
            "parallel" => Some(RelationshipKind::Parallel),
            "sequence" => Some(RelationshipKind::Sequence),
            _ => None,
        }
    }
}

impl std::fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The atomic trace record emitted by agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: EventId,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub phase: Phase,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub performance: Value,
}

impl TraceEvent {
    /// Validate the event for ingestion.
    ///
    /// Checks the non-empty required fields, a sane timestamp, and the
    /// per-payload size cap.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.id.is_empty() {
            return Err(EventError::MissingField("id"));
        }
        if self.session_id.is_empty() {
            return Err(EventError::MissingField("session_id"));
        }
        if self.kind.as_str().is_empty() {
            return Err(EventError::MissingField("type"));
        }
        if self.correlation_id.is_empty() {
            return Err(EventError::MissingField("correlation_id"));
        }
        if self.timestamp < 0 {
            return Err(EventError::BadTimestamp(self.timestamp));
        }
        for (field, value) in [
            ("data", &self.data),
            ("metadata", &self.metadata),
            ("performance", &self.performance),
        ] {
            if value.is_null() {
                continue;
            }
            let size = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
            if size > MAX_PAYLOAD_BYTES {
                return Err(EventError::PayloadTooLarge {
                    field,
                    size,
                    max: MAX_PAYLOAD_BYTES,
                });
            }
        }
        Ok(())
    }

    /// Infer the relationship kind for the edge `(parent_id, id)`.
    ///
    /// `communication` if the event is a communication, `spawn` if it opens
    /// an operation, `parallel` if `data.parallel` is truthy, else `sequence`.
    pub fn relationship_kind(&self) -> RelationshipKind {
        if self.kind == EventKind::Communication {
            return RelationshipKind::Communication;
        }
        if self.phase == Phase::Start {
            return RelationshipKind::Spawn;
        }
        if self.data.get("parallel").map(is_truthy).unwrap_or(false) {
            return RelationshipKind::Parallel;
        }
        RelationshipKind::Sequence
    }

    /// Duration reported under `performance.duration`, in milliseconds.
    pub fn duration_ms(&self) -> Option<f64> {
        self.performance.get("duration").and_then(Value::as_f64)
    }

    /// Error message carried in `data.error.message` (or `data.message`).
    pub fn error_message(&self) -> Option<&str> {
        self.data
            .get("error")
            .and_then(|e| e.get("message"))
            .or_else(|| self.data.get("message"))
            .and_then(Value::as_str)
    }

    /// Task this event refers to, when one is named in its payload.
    ///
    /// Accepts `data.task_id` and `data.task`; task lifecycle events fall
    /// back to the correlation id, which ties start and completion together.
    pub fn task_id(&self) -> Option<&str> {
        if let Some(id) = self
            .data
            .get("task_id")
            .or_else(|| self.data.get("task"))
            .and_then(Value::as_str)
        {
            return Some(id);
        }
        match self.kind {
            EventKind::TaskStart | EventKind::TaskComplete | EventKind::TaskFail => {
                Some(self.correlation_id.as_str())
            }
            _ => None,
        }
    }

    pub fn log_summary(&self) -> String {
        let kind = self.kind.as_str();
        match &self.agent_id {
            Some(agent) => format!(
                "{kind} id={} session={} agent={agent} phase={}",
                self.id, self.session_id, self.phase
            ),
            None => format!(
                "{kind} id={} session={} phase={}",
                self.id, self.session_id, self.phase
            ),
        }
    }
}

/// JS-style truthiness for payload flags like `data.parallel`.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
        Value::Null => false,
    }
}

/// A materialized causal edge between two events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub parent_id: EventId,
    pub child_id: EventId,
    pub kind: RelationshipKind,
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
