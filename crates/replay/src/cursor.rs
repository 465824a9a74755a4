// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stepping cursor and bookmarks for interactive replay.

use crate::reconstruct::{Reconstructor, ReplayError};
use retrace_core::{SessionId, SystemState, TraceEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named replay positions for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bookmarks {
    entries: BTreeMap<String, i64>,
}

impl Bookmarks {
    pub fn set(&mut self, label: impl Into<String>, timestamp: i64) {
        self.entries.insert(label.into(), timestamp);
    }

    pub fn remove(&mut self, label: &str) -> Option<i64> {
        self.entries.remove(label)
    }

    pub fn get(&self, label: &str) -> Option<i64> {
        self.entries.get(label).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().map(|(label, ts)| (label.as_str(), *ts))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An interactive cursor over one session's replay timeline.
///
/// Stepping forward applies events one at a time to the held state;
/// stepping backward re-reconstructs at the target instant (transitions
/// are not invertible).
pub struct ReplayCursor {
    reconstructor: Reconstructor,
    session: SessionId,
    state: SystemState,
    /// Last applied event position, if any.
    position: Option<(i64, retrace_core::EventId)>,
    pub bookmarks: Bookmarks,
}

impl ReplayCursor {
    /// Open a cursor positioned at `t`.
    pub fn open(
        reconstructor: Reconstructor,
        session: SessionId,
        t: i64,
    ) -> Result<Self, ReplayError> {
        let state = reconstructor.state_at(&session, t)?;
        Ok(Self {
            reconstructor,
            session,
            state,
            position: None,
            bookmarks: Bookmarks::default(),
        })
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    pub fn timestamp(&self) -> i64 {
        self.state.timestamp
    }

    /// Apply the next event after the current position, returning it.
    /// Returns `None` at the end of the recorded timeline.
    pub fn step_forward(&mut self) -> Result<Option<TraceEvent>, ReplayError> {
        let (after_ts, after_id) = match &self.position {
            Some((ts, id)) => (*ts, Some(id.as_str().to_string())),
            None => (self.state.timestamp, None),
        };

        let page = self
            .reconstructor
            .store()
            .traces_after(&self.session, after_ts, after_id.as_deref(), i64::MAX, 1)
            .map_err(|source| ReplayError::Reconstruction {
                cursor: None,
                source,
            })?;

        let Some(event) = page.into_iter().next() else {
            return Ok(None);
        };
        self.state.apply_event(&event);
        self.position = Some((event.timestamp, event.id.clone()));
        Ok(Some(event))
    }

    /// Apply up to `n` events forward; returns the events applied.
    pub fn step_forward_n(&mut self, n: usize) -> Result<Vec<TraceEvent>, ReplayError> {
        let mut applied = Vec::with_capacity(n);
        for _ in 0..n {
            match self.step_forward()? {
                Some(event) => applied.push(event),
                None => break,
            }
        }
        Ok(applied)
    }

    /// Jump the cursor to an arbitrary instant.
    pub fn seek(&mut self, t: i64) -> Result<(), ReplayError> {
        self.state = self.reconstructor.state_at(&self.session, t)?;
        self.position = None;
        Ok(())
    }

    /// Jump to a bookmarked instant.
    pub fn seek_bookmark(&mut self, label: &str) -> Result<bool, ReplayError> {
        match self.bookmarks.get(label) {
            Some(t) => {
                self.seek(t)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
#[path = "cursor_tests.rs"]
mod tests;
