// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Publish/subscribe hub between ingest and client sessions.
//!
//! Broadcast iterates a snapshot of the subscriber list, so subscribe and
//! unsubscribe during a broadcast never affect the in-flight event. Each
//! subscriber gets a bounded channel; a full channel counts a drop (the
//! session stopped pulling, its own queue is the real backpressure).

use parking_lot::Mutex;
use retrace_core::{AgentId, SessionId, TraceEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Default)]
struct HubMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HubMetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

struct Subscriber {
    id: u64,
    session_id: SessionId,
    agent_filter: Option<Vec<AgentId>>,
    tx: mpsc::Sender<Arc<TraceEvent>>,
}

/// Handle owned by a client session; unsubscribes on drop.
pub struct SubscriberHandle {
    id: u64,
    hub: StreamHub,
}

impl SubscriberHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replace this subscriber's agent filter.
    pub fn set_agent_filter(&self, agents: Option<Vec<AgentId>>) {
        let mut subs = self.hub.subscribers.lock();
        if let Some(sub) = subs.iter_mut().find(|s| s.id == self.id) {
            sub.agent_filter = agents;
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

/// Fan-out hub. Cheap to clone; all clones share the subscriber set.
#[derive(Clone)]
pub struct StreamHub {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
    metrics: Arc<HubMetrics>,
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHub {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            metrics: Arc::new(HubMetrics::default()),
        }
    }

    /// Subscribe to one session's live events.
    pub fn subscribe(
        &self,
        session_id: SessionId,
        capacity: usize,
    ) -> (SubscriberHandle, mpsc::Receiver<Arc<TraceEvent>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        {
            let mut subs = self.subscribers.lock();
            subs.push(Subscriber {
                id,
                session_id,
                agent_filter: None,
                tx,
            });
        }
        debug!(subscriber = id, "hub subscriber added");
        (
            SubscriberHandle {
                id,
                hub: self.clone(),
            },
            rx,
        )
    }

    fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.lock();
        subs.retain(|s| s.id != id);
        debug!(subscriber = id, "hub subscriber removed");
    }

    /// Publish one event to every matching subscriber.
    ///
    /// Non-blocking: a subscriber whose feed channel is full loses this
    /// event (counted in `dropped`).
    pub fn publish(&self, event: &Arc<TraceEvent>) {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot matching senders, then send outside the lock.
        let targets: Vec<mpsc::Sender<Arc<TraceEvent>>> = {
            let subs = self.subscribers.lock();
            subs.iter()
                .filter(|sub| sub.session_id == event.session_id)
                .filter(|sub| match (&sub.agent_filter, &event.agent_id) {
                    (None, _) => true,
                    (Some(filter), Some(agent)) => filter.contains(agent),
                    (Some(_), None) => false,
                })
                .map(|sub| sub.tx.clone())
                .collect()
        };

        for tx in targets {
            match tx.try_send(Arc::clone(event)) {
                Ok(()) => {
                    self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn metrics(&self) -> HubMetricsSnapshot {
        HubMetricsSnapshot {
            published: self.metrics.published.load(Ordering::Relaxed),
            delivered: self.metrics.delivered.load(Ordering::Relaxed),
            dropped: self.metrics.dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
