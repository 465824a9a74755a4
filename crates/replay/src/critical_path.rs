// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Critical path through the causal event DAG.
//!
//! The longest chain of causally linked events weighted by
//! `performance.duration`. Cycles cannot arise from well-formed data
//! (children never precede parents), but edges are checked defensively:
//! an edge against replay order is excluded and reported.

use crate::reconstruct::{Reconstructor, ReplayError};
use retrace_core::{EventId, SessionId};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

/// Diagnostic for an edge excluded from the DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleDetected {
    pub parent_id: EventId,
    pub child_id: EventId,
}

/// The heaviest causal chain in the queried range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticalPath {
    /// Event ids along the path, causally ordered.
    pub path: Vec<EventId>,
    /// Sum of `performance.duration` along the path, in milliseconds.
    pub total_duration_ms: f64,
    /// Edges excluded by the defensive cycle check.
    pub cycles: Vec<CycleDetected>,
}

impl Reconstructor {
    /// Longest duration-weighted path through the causal DAG of `session`
    /// within the inclusive time range.
    pub fn critical_path(
        &self,
        session: &SessionId,
        range: (i64, i64),
    ) -> Result<CriticalPath, ReplayError> {
        let events = self
            .store()
            .traces(&retrace_store::TraceQuery {
                session_id: Some(session.clone()),
                time_range: Some(range),
                ..retrace_store::TraceQuery::default()
            })
            .map_err(|source| ReplayError::Reconstruction {
                cursor: None,
                source,
            })?;

        if events.is_empty() {
            return Ok(CriticalPath {
                path: Vec::new(),
                total_duration_ms: 0.0,
                cycles: Vec::new(),
            });
        }

        // Events arrive in replay order; position index doubles as the
        // topological order of the (checked) DAG.
        let index: HashMap<&str, usize> = events
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.as_str(), i))
            .collect();
        let weights: Vec<f64> = events
            .iter()
            .map(|e| e.duration_ms().unwrap_or(0.0))
            .collect();

        let edges = self
            .store()
            .relationships(session)
            .map_err(|source| ReplayError::Reconstruction {
                cursor: None,
                source,
            })?;

        let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); events.len()];
        let mut cycles = Vec::new();
        for edge in edges {
            let (Some(&parent), Some(&child)) = (
                index.get(edge.parent_id.as_str()),
                index.get(edge.child_id.as_str()),
            ) else {
                continue;
            };
            // An edge pointing against replay order would make the walk
            // cyclic; exclude it and report.
            if child <= parent {
                warn!(
                    parent = %edge.parent_id,
                    child = %edge.child_id,
                    "excluding causal edge against replay order"
                );
                cycles.push(CycleDetected {
                    parent_id: edge.parent_id,
                    child_id: edge.child_id,
                });
                continue;
            }
            incoming[child].push(parent);
        }

        // Longest-path DP in replay order.
        let mut best: Vec<f64> = weights.clone();
        let mut pred: Vec<Option<usize>> = vec![None; events.len()];
        for i in 0..events.len() {
            for &parent in &incoming[i] {
                let candidate = best[parent] + weights[i];
                if candidate > best[i] {
                    best[i] = candidate;
                    pred[i] = Some(parent);
                }
            }
        }

        let (mut at, _) = best
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap_or((0, &0.0));
        let total = best[at];

        let mut path = vec![events[at].id.clone()];
        while let Some(parent) = pred[at] {
            path.push(events[parent].id.clone());
            at = parent;
        }
        path.reverse();

        Ok(CriticalPath {
            path,
            total_duration_ms: total,
            cycles,
        })
    }
}

#[cfg(test)]
#[path = "critical_path_tests.rs"]
mod tests;
