// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Batched background writer.
//!
//! Events are validated synchronously, then queued to a dedicated OS thread
//! that groups them into one transaction per flush. A flush happens when the
//! batch reaches `batch_size` or when `flush_interval` elapses, whichever
//! comes first. A failed batch is retried in place with exponential backoff;
//! there is no separate retry timer, so a batch can never double-apply.

use crate::engine::{StoreError, TraceStore};
use retrace_core::TraceEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Writer configuration.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Queue capacity; also the flush-by-size batch limit.
    pub batch_size: usize,
    /// Flush cadence when the batch stays under `batch_size`.
    pub flush_interval: Duration,
    /// Retries before a failed batch is dropped.
    pub max_retries: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

/// Writer observability counters.
#[derive(Debug, Default)]
pub struct WriterMetrics {
    pub events_stored: AtomicU64,
    pub events_dropped: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub queue_rejections: AtomicU64,
}

impl WriterMetrics {
    pub fn snapshot(&self) -> WriterMetricsSnapshot {
        WriterMetricsSnapshot {
            events_stored: self.events_stored.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            queue_rejections: self.queue_rejections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WriterMetricsSnapshot {
    pub events_stored: u64,
    pub events_dropped: u64,
    pub batches_flushed: u64,
    pub batches_dropped: u64,
    pub queue_rejections: u64,
}

enum Command {
    Store(Box<TraceEvent>),
    Flush(SyncSender<()>),
    Shutdown,
}

/// Handle to the writer thread. Cloning shares the queue and metrics.
#[derive(Clone)]
pub struct BatchWriter {
    tx: SyncSender<Command>,
    metrics: Arc<WriterMetrics>,
    // NOTE(lifetime): keeps the writer thread alive; joined on last drop
    #[allow(dead_code)]
    handle: Arc<WriterHandle>,
}

/// Joins the writer thread when the last handle drops.
struct WriterHandle {
    tx: SyncSender<Command>,
    join: Option<JoinHandle<()>>,
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        // Blocking send: the thread is draining, so space frees up; if the
        // thread is already gone this fails immediately and join returns.
        let _ = self.tx.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl BatchWriter {
    /// Spawn the writer thread against the given store.
    pub fn spawn(store: TraceStore, config: WriterConfig) -> Result<Self, StoreError> {
        let (tx, rx) = mpsc::sync_channel::<Command>(config.batch_size.max(1));
        let metrics = Arc::new(WriterMetrics::default());

        let thread_metrics = Arc::clone(&metrics);
        let thread_config = config.clone();
        let join = thread::Builder::new()
            .name("retrace-writer".into())
            .spawn(move || writer_thread(rx, store, thread_config, thread_metrics))?;

        Ok(Self {
            tx: tx.clone(),
            metrics,
            handle: Arc::new(WriterHandle {
                tx,
                join: Some(join),
            }),
        })
    }

    /// Validate and enqueue one event.
    ///
    /// Rejects synchronously on validation failure; returns `QueueFull` when
    /// the bounded queue is saturated (counted, caller decides policy).
    pub fn enqueue(&self, event: TraceEvent) -> Result<(), StoreError> {
        event.validate()?;
        match self.tx.try_send(Command::Store(Box::new(event))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.metrics.queue_rejections.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(StoreError::QueueClosed),
        }
    }

    /// Flush pending events and wait until they are committed.
    pub fn flush(&self) -> Result<(), StoreError> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(Command::Flush(ack_tx))
            .map_err(|_| StoreError::QueueClosed)?;
        ack_rx.recv().map_err(|_| StoreError::QueueClosed)
    }

    pub fn metrics(&self) -> WriterMetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn writer_thread(
    rx: mpsc::Receiver<Command>,
    store: TraceStore,
    config: WriterConfig,
    metrics: Arc<WriterMetrics>,
) {
    let mut batch: Vec<TraceEvent> = Vec::with_capacity(config.batch_size);
    let mut last_flush = Instant::now();

    loop {
        match rx.recv_timeout(config.flush_interval) {
            Ok(Command::Store(event)) => {
                batch.push(*event);
                if batch.len() >= config.batch_size {
                    flush_batch(&store, &mut batch, &config, &metrics);
                    last_flush = Instant::now();
                }
            }
            Ok(Command::Flush(ack)) => {
                flush_batch(&store, &mut batch, &config, &metrics);
                last_flush = Instant::now();
                let _ = ack.send(());
            }
            Ok(Command::Shutdown) => {
                flush_batch(&store, &mut batch, &config, &metrics);
                debug!("writer thread shutting down");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                // An event arriving exactly at the interval boundary has
                // already been pushed: it flushes with this batch.
                if !batch.is_empty() && last_flush.elapsed() >= config.flush_interval {
                    flush_batch(&store, &mut batch, &config, &metrics);
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                flush_batch(&store, &mut batch, &config, &metrics);
                break;
            }
        }
    }
}

/// Commit the batch, retrying with exponential backoff. After `max_retries`
/// the batch is dropped and counted.
fn flush_batch(
    store: &TraceStore,
    batch: &mut Vec<TraceEvent>,
    config: &WriterConfig,
    metrics: &WriterMetrics,
) {
    if batch.is_empty() {
        return;
    }

    let mut delay = Duration::from_millis(50);
    for attempt in 0..=config.max_retries {
        match store.insert_events(batch) {
            Ok(count) => {
                metrics.events_stored.fetch_add(count as u64, Ordering::Relaxed);
                metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
                batch.clear();
                return;
            }
            Err(e) if attempt < config.max_retries => {
                debug!(attempt, error = %e, "batch insert failed, retrying");
                thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_secs(2));
            }
            Err(e) => {
                let dropped = StoreError::BatchDropped {
                    count: batch.len(),
                    retries: config.max_retries,
                };
                error!(error = %e, "{dropped}");
                metrics
                    .events_dropped
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                metrics.batches_dropped.fetch_add(1, Ordering::Relaxed);
                batch.clear();
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "writer_tests.rs"]
mod tests;
