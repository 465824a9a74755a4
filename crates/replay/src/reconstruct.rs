// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State reconstruction: nearest snapshot plus forward replay.
//!
//! Events are streamed from storage with a keyset cursor, never buffered
//! wholesale. Equal timestamps apply in ascending id order; that tie-break
//! is the sole mechanism making reconstruction reproducible.

use retrace_core::{EventId, SessionId, SystemState, TraceEvent};
use retrace_store::{SnapshotError, SnapshotStore, StoreError, TraceStore};
use thiserror::Error;
use tracing::debug;

/// Replay position: the `(timestamp, id)` of the last applied event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayCursorPos {
    pub timestamp: i64,
    pub event_id: EventId,
}

/// Errors from reconstruction.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("reconstruction failed at cursor {cursor:?}: {source}")]
    Reconstruction {
        /// Partial progress; callers may retry from here.
        cursor: Option<ReplayCursorPos>,
        source: StoreError,
    },
}

/// Event found by `find_origin`: the first event flipping a predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginPoint {
    pub event_id: EventId,
    pub timestamp: i64,
}

/// Reconstructs system state from snapshots and stored events.
#[derive(Clone)]
pub struct Reconstructor {
    store: TraceStore,
    snapshots: SnapshotStore,
    /// Events fetched per storage round-trip during replay.
    page_size: usize,
}

impl Reconstructor {
    pub fn new(store: TraceStore, snapshots: SnapshotStore) -> Self {
        Self {
            store,
            snapshots,
            page_size: 1000,
        }
    }

    pub fn store(&self) -> &TraceStore {
        &self.store
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Reconstruct the state of `session` as of `t` (inclusive).
    ///
    /// Deterministic: for the same stored data this returns byte-identical
    /// states on every call.
    pub fn state_at(&self, session: &SessionId, t: i64) -> Result<SystemState, ReplayError> {
        let (mut state, base_ts) = self.base_state(session, t)?;
        self.replay_span(session, &mut state, base_ts, t)?;
        state.timestamp = t;
        Ok(state)
    }

    /// Nearest snapshot state at or before `t`, or the empty state.
    ///
    /// Returns the state plus the exclusive replay lower bound.
    fn base_state(
        &self,
        session: &SessionId,
        t: i64,
    ) -> Result<(SystemState, i64), ReplayError> {
        match self.snapshots.nearest(session, t)? {
            Some(snapshot) => {
                debug!(
                    session = %session,
                    snapshot = %snapshot.meta.id,
                    base_ts = snapshot.meta.timestamp,
                    "reconstructing from snapshot"
                );
                let ts = snapshot.meta.timestamp;
                Ok((snapshot.state, ts))
            }
            None => {
                let start = match self.store.get_session(session) {
                    Ok(Some(record)) => record.start_time,
                    Ok(None) => return Err(ReplayError::UnknownSession(session.clone())),
                    Err(source) => {
                        return Err(ReplayError::Reconstruction {
                            cursor: None,
                            source,
                        })
                    }
                };
                // No snapshot: start empty and replay everything up to t.
                Ok((SystemState::empty_at(start), i64::MIN))
            }
        }
    }

    /// Apply all events in `(after_ts, until]` to `state` in order.
    fn replay_span(
        &self,
        session: &SessionId,
        state: &mut SystemState,
        after_ts: i64,
        until: i64,
    ) -> Result<(), ReplayError> {
        let mut cursor: Option<ReplayCursorPos> = None;
        loop {
            let page = self.next_page(session, after_ts, cursor.as_ref(), until)?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            cursor = Some(ReplayCursorPos {
                timestamp: last.timestamp,
                event_id: last.id.clone(),
            });
            let full_page = page.len() == self.page_size;
            for event in &page {
                state.apply_event(event);
            }
            if !full_page {
                return Ok(());
            }
        }
    }

    fn next_page(
        &self,
        session: &SessionId,
        after_ts: i64,
        cursor: Option<&ReplayCursorPos>,
        until: i64,
    ) -> Result<Vec<TraceEvent>, ReplayError> {
        let (ts, id) = match cursor {
            Some(pos) => (pos.timestamp, Some(pos.event_id.as_str())),
            None => (after_ts, None),
        };
        self.store
            .traces_after(session, ts, id, until, self.page_size)
            .map_err(|source| ReplayError::Reconstruction {
                cursor: cursor.cloned(),
                source,
            })
    }

    /// Smallest `t` at which the predicate on the reconstructed state
    /// becomes true: binary search over snapshots, then a linear forward
    /// scan through the delta region. Returns the flipping event.
    pub fn find_origin(
        &self,
        session: &SessionId,
        predicate: impl Fn(&SystemState) -> bool,
    ) -> Result<Option<OriginPoint>, ReplayError> {
        // Snapshot metadata ascending by timestamp.
        let metas = self
            .snapshots
            .search(&retrace_store::SnapshotFilter {
                session_id: Some(session.clone()),
                ..retrace_store::SnapshotFilter::default()
            })
            .map_err(ReplayError::Snapshot)?;

        // Find the first snapshot where the predicate already holds; the
        // flip lies at or before it, so scan from the previous snapshot.
        let mut scan_from = i64::MIN;
        let mut lo = 0usize;
        let mut hi = metas.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let snapshot = self
                .snapshots
                .get(&metas[mid].id)
                .map_err(ReplayError::Snapshot)?;
            if predicate(&snapshot.state) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        if lo > 0 {
            scan_from = metas[lo - 1].timestamp;
        }

        // Linear forward scan from the last predicate-false snapshot.
        let (mut state, base_ts) = match lo {
            0 => {
                let start = self
                    .store
                    .get_session(session)
                    .map_err(|source| ReplayError::Reconstruction {
                        cursor: None,
                        source,
                    })?
                    .ok_or_else(|| ReplayError::UnknownSession(session.clone()))?
                    .start_time;
                (SystemState::empty_at(start), i64::MIN)
            }
            _ => {
                let snapshot = self
                    .snapshots
                    .get(&metas[lo - 1].id)
                    .map_err(ReplayError::Snapshot)?;
                (snapshot.state, scan_from)
            }
        };

        if predicate(&state) {
            // Already true at the scan base; the origin precedes all
            // snapshots, so rescan from the beginning of the session.
            state = SystemState::empty_at(0);
            return self.scan_for_flip(session, state, i64::MIN, predicate);
        }

        self.scan_for_flip(session, state, base_ts, predicate)
    }

    fn scan_for_flip(
        &self,
        session: &SessionId,
        mut state: SystemState,
        after_ts: i64,
        predicate: impl Fn(&SystemState) -> bool,
    ) -> Result<Option<OriginPoint>, ReplayError> {
        let mut cursor: Option<ReplayCursorPos> = None;
        loop {
            let page = self.next_page(session, after_ts, cursor.as_ref(), i64::MAX)?;
            if page.is_empty() {
                return Ok(None);
            }
            for event in &page {
                state.apply_event(event);
                if predicate(&state) {
                    return Ok(Some(OriginPoint {
                        event_id: event.id.clone(),
                        timestamp: event.timestamp,
                    }));
                }
            }
            let last = &page[page.len() - 1];
            cursor = Some(ReplayCursorPos {
                timestamp: last.timestamp,
                event_id: last.id.clone(),
            });
            if page.len() < self.page_size {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
#[path = "reconstruct_tests.rs"]
mod tests;
