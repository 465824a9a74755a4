// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound event batcher.
//!
//! Flushes on `batch_size` or `batch_timeout`, whichever comes first.
//! Pure state machine driven by caller-supplied timestamps so the session
//! loop (and tests) control time.

use retrace_core::TraceEvent;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: i64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_timeout_ms: 1000,
        }
    }
}

/// Accumulates events until a flush condition is met.
pub struct EventBatcher {
    config: BatcherConfig,
    buffer: Vec<Arc<TraceEvent>>,
    last_flush_ms: i64,
}

impl EventBatcher {
    pub fn new(config: BatcherConfig, now_ms: i64) -> Self {
        Self {
            buffer: Vec::with_capacity(config.batch_size),
            config,
            last_flush_ms: now_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Add an event; returns the full batch when `batch_size` is reached.
    pub fn push(&mut self, event: Arc<TraceEvent>, now_ms: i64) -> Option<Vec<Arc<TraceEvent>>> {
        self.buffer.push(event);
        if self.buffer.len() >= self.config.batch_size {
            return Some(self.flush(now_ms));
        }
        None
    }

    /// Time-based flush check; returns the batch when the timeout elapsed.
    /// An event arriving exactly at the boundary flushes with this batch.
    pub fn tick(&mut self, now_ms: i64) -> Option<Vec<Arc<TraceEvent>>> {
        if !self.buffer.is_empty() && now_ms - self.last_flush_ms >= self.config.batch_timeout_ms {
            return Some(self.flush(now_ms));
        }
        None
    }

    /// Unconditional flush (shutdown path).
    pub fn flush(&mut self, now_ms: i64) -> Vec<Arc<TraceEvent>> {
        self.last_flush_ms = now_ms;
        std::mem::take(&mut self.buffer)
    }
}

#[cfg(test)]
#[path = "batcher_tests.rs"]
mod tests;
