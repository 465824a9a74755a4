// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ingest orchestrator.
//!
//! Validates synchronously, fills in missing ids and timestamps, then
//! hands the event to storage and streaming in parallel. Neither sink
//! blocks the other; both are fire-and-forget and observable through the
//! ingest metrics.

use retrace_core::{
    Clock, EventError, EventKind, IdGen, Phase, TraceEvent, UuidIdGen,
};
use retrace_store::{BatchWriter, StoreError};
use retrace_stream::StreamHub;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors surfaced to the producing agent.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid event: {0}")]
    Invalid(#[from] EventError),
}

/// Incoming event as produced by agents; id and timestamp may be absent.
#[derive(Debug, Clone, Deserialize)]
pub struct EventDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub session_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub correlation_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub performance: Value,
}

/// Ingest observability counters.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub received: AtomicU64,
    pub invalid: AtomicU64,
    pub enqueued: AtomicU64,
    pub store_rejections: AtomicU64,
    pub published: AtomicU64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IngestMetricsSnapshot {
    pub received: u64,
    pub invalid: u64,
    pub enqueued: u64,
    pub store_rejections: u64,
    pub published: u64,
}

/// Accepts events from agents and fans them out to storage and streaming.
#[derive(Clone)]
pub struct IngestOrchestrator<G: IdGen = UuidIdGen> {
    writer: BatchWriter,
    hub: StreamHub,
    idgen: G,
    clock: Arc<dyn Clock>,
    metrics: Arc<IngestMetrics>,
}

impl IngestOrchestrator<UuidIdGen> {
    pub fn new(writer: BatchWriter, hub: StreamHub, clock: Arc<dyn Clock>) -> Self {
        Self::with_idgen(writer, hub, clock, UuidIdGen)
    }
}

impl<G: IdGen> IngestOrchestrator<G> {
    pub fn with_idgen(
        writer: BatchWriter,
        hub: StreamHub,
        clock: Arc<dyn Clock>,
        idgen: G,
    ) -> Self {
        Self {
            writer,
            hub,
            idgen,
            clock,
            metrics: Arc::new(IngestMetrics::default()),
        }
    }

    /// Ingest one event. Returns the (possibly assigned) event id.
    ///
    /// On validation failure nothing is stored or published.
    pub fn ingest(&self, draft: EventDraft) -> Result<TraceEvent, IngestError> {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);

        let event = self.complete(draft);
        if let Err(e) = event.validate() {
            self.metrics.invalid.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::Invalid(e));
        }

        debug!(event = %event.log_summary(), "ingested");

        // Storage and streaming are parallel sinks; a failure in one
        // never gates the other.
        match self.writer.enqueue(event.clone()) {
            Ok(()) => {
                self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(StoreError::QueueFull) => {
                self.metrics.store_rejections.fetch_add(1, Ordering::Relaxed);
                warn!(event = %event.id, "write queue full, event not persisted");
            }
            Err(e) => {
                self.metrics.store_rejections.fetch_add(1, Ordering::Relaxed);
                warn!(event = %event.id, error = %e, "failed to enqueue event");
            }
        }

        self.hub.publish(&Arc::new(event.clone()));
        self.metrics.published.fetch_add(1, Ordering::Relaxed);

        Ok(event)
    }

    /// Fill in the generated id and stamped timestamp where absent.
    fn complete(&self, draft: EventDraft) -> TraceEvent {
        TraceEvent {
            id: draft
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| self.idgen.next())
                .into(),
            session_id: draft.session_id.into(),
            agent_id: draft.agent_id.map(Into::into),
            kind: draft.kind,
            phase: draft.phase,
            timestamp: draft.timestamp.unwrap_or_else(|| self.clock.now_ms()),
            correlation_id: draft.correlation_id.into(),
            parent_id: draft.parent_id.map(Into::into),
            data: draft.data,
            metadata: draft.metadata,
            performance: draft.performance,
        }
    }

    pub fn metrics(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            received: self.metrics.received.load(Ordering::Relaxed),
            invalid: self.metrics.invalid.load(Ordering::Relaxed),
            enqueued: self.metrics.enqueued.load(Ordering::Relaxed),
            store_rejections: self.metrics.store_rejections.load(Ordering::Relaxed),
            published: self.metrics.published.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[path = "ingest_tests.rs"]
mod tests;
