// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session records

use crate::id::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named scope grouping events from one logical run of the fleet.
///
/// Sessions are created before the first event referencing them and closed
/// by setting `end_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl SessionRecord {
    pub fn new(id: impl Into<SessionId>, name: impl Into<String>, start_time: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            start_time,
            end_time: None,
            status: SessionStatus::Active,
            metadata: Value::Null,
        }
    }
}
