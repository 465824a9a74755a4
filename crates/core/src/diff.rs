// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Structured diffs between two reconstructed states.
//!
//! `diff_states(a, b)` captures everything needed to turn `a` into `b`;
//! `StateDiff::apply` is its exact inverse. Incremental snapshots persist
//! these diffs instead of full states.

use crate::id::{AgentId, CorrelationId, TaskId};
use crate::state::{
    AgentState, CommunicationRecord, ErrorRecord, MemoryEntry, ResourceUsage, SystemState,
    TaskState,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Added/removed/changed entries for one keyed collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapDiff<K: Ord, V> {
    #[serde(default = "BTreeMap::new")]
    pub added: BTreeMap<K, V>,
    #[serde(default)]
    pub removed: Vec<K>,
    #[serde(default = "BTreeMap::new")]
    pub changed: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for MapDiff<K, V> {
    fn default() -> Self {
        Self {
            added: BTreeMap::new(),
            removed: Vec::new(),
            changed: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> MapDiff<K, V> {
    fn compute(from: &BTreeMap<K, V>, to: &BTreeMap<K, V>) -> Self {
        let mut diff = Self::default();
        for (key, value) in to {
            match from.get(key) {
                None => {
                    diff.added.insert(key.clone(), value.clone());
                }
                Some(prev) if prev != value => {
                    diff.changed.insert(key.clone(), value.clone());
                }
                Some(_) => {}
            }
        }
        for key in from.keys() {
            if !to.contains_key(key) {
                diff.removed.push(key.clone());
            }
        }
        diff
    }

    fn apply(&self, target: &mut BTreeMap<K, V>) {
        for key in &self.removed {
            target.remove(key);
        }
        for (key, value) in self.added.iter().chain(self.changed.iter()) {
            target.insert(key.clone(), value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }
}

/// Difference between two `SystemState`s.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateDiff {
    /// Timestamp of the target state.
    pub timestamp: i64,
    #[serde(default)]
    pub agents: MapDiff<AgentId, AgentState>,
    #[serde(default)]
    pub tasks: MapDiff<TaskId, TaskState>,
    #[serde(default)]
    pub memory: MapDiff<String, MemoryEntry>,
    #[serde(default)]
    pub communications: MapDiff<CorrelationId, Vec<CommunicationRecord>>,
    #[serde(default)]
    pub resources: MapDiff<AgentId, ResourceUsage>,
    /// Errors ledger entries appended between the two states. When the
    /// target ledger is not an extension of the source (never the case for
    /// forward replay), `errors_replaced` carries the full target ledger.
    #[serde(default)]
    pub errors_added: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors_replaced: Option<Vec<ErrorRecord>>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
            && self.tasks.is_empty()
            && self.memory.is_empty()
            && self.communications.is_empty()
            && self.resources.is_empty()
            && self.errors_added.is_empty()
            && self.errors_replaced.is_none()
    }

    /// Total number of changed entries across all collections.
    pub fn change_count(&self) -> usize {
        self.agents.len()
            + self.tasks.len()
            + self.memory.len()
            + self.communications.len()
            + self.resources.len()
            + self.errors_added.len()
            + self.errors_replaced.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Apply this diff in place, turning the source state into the target.
    pub fn apply(&self, state: &mut SystemState) {
        state.timestamp = self.timestamp;
        self.agents.apply(&mut state.agents);
        self.tasks.apply(&mut state.tasks);
        self.memory.apply(&mut state.memory);
        self.communications.apply(&mut state.communications);
        self.resources.apply(&mut state.resources);
        if let Some(replaced) = &self.errors_replaced {
            state.errors = replaced.clone();
        } else {
            state.errors.extend(self.errors_added.iter().cloned());
        }
    }
}

/// Compute the structured diff turning `from` into `to`.
pub fn diff_states(from: &SystemState, to: &SystemState) -> StateDiff {
    let errors_extend = to.errors.len() >= from.errors.len()
        && to.errors[..from.errors.len()] == from.errors[..];

    StateDiff {
        timestamp: to.timestamp,
        agents: MapDiff::compute(&from.agents, &to.agents),
        tasks: MapDiff::compute(&from.tasks, &to.tasks),
        memory: MapDiff::compute(&from.memory, &to.memory),
        communications: MapDiff::compute(&from.communications, &to.communications),
        resources: MapDiff::compute(&from.resources, &to.resources),
        errors_added: if errors_extend {
            to.errors[from.errors.len()..].to_vec()
        } else {
            Vec::new()
        },
        errors_replaced: if errors_extend {
            None
        } else {
            Some(to.errors.clone())
        },
    }
}

#[cfg(test)]
#[path = "diff_tests.rs"]
mod tests;
