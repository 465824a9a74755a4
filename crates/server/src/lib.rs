// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Retrace server
//!
//! Assembles the trace store, snapshot store, reconstructor, breakpoint
//! engine and streaming hub into one process: a TCP listener for viewer
//! sessions, the ingest orchestrator for producing agents, and the
//! periodic retention and auto-snapshot tasks.

pub mod config;
pub mod ingest;
mod listener;

pub use config::{Config, ConfigError};
pub use ingest::{EventDraft, IngestError, IngestMetricsSnapshot, IngestOrchestrator};
pub use listener::ServerReplayAccess;

use parking_lot::Mutex;
use retrace_core::{Clock, SessionId, SystemClock};
use retrace_replay::{BreakpointEngine, Hit, Reconstructor, ReplayError};
use retrace_store::{
    BatchWriter, SnapshotOptions, SnapshotStore, StoreError, TraceStore,
};
use retrace_stream::{ApiKeyValidator, Authenticator, StreamHub};
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// A running Retrace server.
pub struct Server {
    config: Config,
    store: TraceStore,
    snapshots: SnapshotStore,
    writer: BatchWriter,
    reconstructor: Reconstructor,
    breakpoints: Arc<Mutex<BreakpointEngine>>,
    hub: StreamHub,
    ingest: IngestOrchestrator,
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Open storage, bind the streaming port, and spawn the background
    /// tasks.
    pub async fn start(config: Config) -> Result<Self, ServerError> {
        let store = TraceStore::open(config.store_config())?;
        let writer = BatchWriter::spawn(store.clone(), config.writer_config())?;
        let snapshots = SnapshotStore::new(store.clone(), config.snapshot_config());
        let reconstructor = Reconstructor::new(store.clone(), snapshots.clone());
        let breakpoints = Arc::new(Mutex::new(BreakpointEngine::new()));
        let hub = StreamHub::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let ingest = IngestOrchestrator::new(writer.clone(), hub.clone(), Arc::clone(&clock));

        let auth = if config.auth.enabled {
            Authenticator::new(
                true,
                Arc::new(ApiKeyValidator::new(config.auth.api_keys.iter().cloned())),
            )
        } else {
            Authenticator::disabled()
        };

        let listener = TcpListener::bind(("0.0.0.0", config.streaming.port)).await?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(Notify::new());
        let access = Arc::new(ServerReplayAccess::new(
            store.clone(),
            reconstructor.clone(),
            Arc::clone(&breakpoints),
        ));
        let ctx = Arc::new(listener::ListenCtx {
            config: config.clone(),
            hub: hub.clone(),
            auth,
            access,
            shutdown: Arc::clone(&shutdown),
            connections: Arc::new(AtomicUsize::new(0)),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(listener::run(listener, ctx)));
        tasks.push(spawn_retention(
            store.clone(),
            config.retention_days,
            Arc::clone(&clock),
        ));
        if config.snapshot_interval_ms > 0 {
            tasks.push(spawn_auto_snapshot(
                store.clone(),
                reconstructor.clone(),
                snapshots.clone(),
                config.snapshot_interval_ms,
                Arc::clone(&clock),
            ));
        }

        info!(addr = %local_addr, "retrace server listening");

        Ok(Self {
            config,
            store,
            snapshots,
            writer,
            reconstructor,
            breakpoints,
            hub,
            ingest,
            local_addr,
            shutdown,
            tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ingest(&self) -> &IngestOrchestrator {
        &self.ingest
    }

    pub fn store(&self) -> &TraceStore {
        &self.store
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn reconstructor(&self) -> &Reconstructor {
        &self.reconstructor
    }

    pub fn hub(&self) -> &StreamHub {
        &self.hub
    }

    pub fn breakpoints(&self) -> &Arc<Mutex<BreakpointEngine>> {
        &self.breakpoints
    }

    /// Flush all pending writes, then compact the store.
    pub fn compact(&self) -> Result<(), StoreError> {
        self.writer.flush()?;
        self.store.compact()
    }

    /// Flush pending writes to storage.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.writer.flush()
    }

    /// Replay a session range through the breakpoint engine, collecting
    /// hits in `(timestamp, id)` order.
    pub fn replay_with_breakpoints(
        &self,
        session: &SessionId,
        range: (i64, i64),
    ) -> Result<Vec<Hit>, ReplayError> {
        let mut state = self.reconstructor.state_at(session, range.0)?;
        let mut hits = Vec::new();
        let mut cursor: Option<(i64, String)> = None;

        loop {
            let page = self
                .store
                .traces_after(
                    session,
                    cursor.as_ref().map(|c| c.0).unwrap_or(range.0),
                    cursor.as_ref().map(|c| c.1.as_str()),
                    range.1,
                    1000,
                )
                .map_err(|source| ReplayError::Reconstruction {
                    cursor: None,
                    source,
                })?;
            if page.is_empty() {
                return Ok(hits);
            }
            let mut engine = self.breakpoints.lock();
            for event in &page {
                state.apply_event(event);
                hits.extend(engine.evaluate(&state, event));
            }
            drop(engine);
            let last = &page[page.len() - 1];
            cursor = Some((last.timestamp, last.id.as_str().to_string()));
            if page.len() < 1000 {
                return Ok(hits);
            }
        }
    }

    /// Graceful shutdown: flush the write queue, stop client sessions,
    /// then close storage.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.shutdown.notify_waiters();

        // Bounded wait for sessions to drain their queues.
        tokio::time::sleep(Duration::from_millis(200)).await;

        if let Err(e) = self.writer.flush() {
            warn!(error = %e, "final flush failed");
        }

        for task in self.tasks {
            task.abort();
        }
        info!("server stopped");
    }
}

/// Retention sweep cadence.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

fn spawn_retention(
    store: TraceStore,
    retention_days: u32,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        interval.tick().await; // skip the immediate tick
        loop {
            interval.tick().await;
            if retention_days == 0 {
                continue;
            }
            let cutoff = clock.now_ms() - i64::from(retention_days) * 86_400_000;
            let sweep_store = store.clone();
            let result =
                tokio::task::spawn_blocking(move || sweep_store.archive_before(cutoff)).await;
            match result {
                Ok(Ok(removed)) if removed > 0 => {
                    info!(removed, "retention sweep removed old rows");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "retention sweep failed"),
                Err(e) => warn!(error = %e, "retention sweep panicked"),
            }
        }
    })
}

fn spawn_auto_snapshot(
    store: TraceStore,
    reconstructor: Reconstructor,
    snapshots: SnapshotStore,
    interval_ms: u64,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
        interval.tick().await;
        loop {
            interval.tick().await;
            let now = clock.now_ms();
            let store = store.clone();
            let reconstructor = reconstructor.clone();
            let snapshots = snapshots.clone();
            let result = tokio::task::spawn_blocking(move || {
                let sessions = store.sessions(Some(retrace_core::SessionStatus::Active))?;
                for session in sessions {
                    let state = match reconstructor.state_at(&session.id, now) {
                        Ok(state) => state,
                        Err(e) => {
                            warn!(session = %session.id, error = %e, "auto-snapshot replay failed");
                            continue;
                        }
                    };
                    if let Err(e) = snapshots.create(
                        &session.id,
                        &state,
                        SnapshotOptions {
                            incremental: true,
                            ..SnapshotOptions::default()
                        },
                    ) {
                        warn!(session = %session.id, error = %e, "auto-snapshot failed");
                    }
                }
                Ok::<_, StoreError>(())
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "auto-snapshot sweep failed"),
                Err(e) => warn!(error = %e, "auto-snapshot task panicked"),
            }
        }
    })
}
