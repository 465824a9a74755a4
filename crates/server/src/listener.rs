// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TCP listener spawning one client session task per connection.

use crate::config::Config;
use parking_lot::Mutex;
use retrace_core::{BreakpointId, IdGen, SessionId, SystemState, UuidIdGen};
use retrace_replay::{Breakpoint, BreakpointCondition, BreakpointEngine, Reconstructor};
use retrace_store::{TraceQuery, TraceStore};
use retrace_stream::{Authenticator, ClientSession, HistoryReply, ReplayAccess, StreamHub};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Shared server context handed to every connection.
pub(crate) struct ListenCtx {
    pub config: Config,
    pub hub: StreamHub,
    pub auth: Authenticator,
    pub access: Arc<ServerReplayAccess>,
    pub shutdown: Arc<Notify>,
    pub connections: Arc<AtomicUsize>,
}

/// Accept loop. Runs until the process shuts down.
pub(crate) async fn run(listener: TcpListener, ctx: Arc<ListenCtx>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let active = ctx.connections.load(Ordering::SeqCst);
                if active >= ctx.config.streaming.max_connections {
                    warn!(%peer, active, "connection limit reached, refusing");
                    drop(stream);
                    continue;
                }
                ctx.connections.fetch_add(1, Ordering::SeqCst);

                let session = ClientSession::new(
                    ctx.config.session_config(),
                    ctx.auth.clone(),
                    ctx.hub.clone(),
                    Arc::clone(&ctx.access),
                );
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    debug!(%peer, "client connected");
                    if let Err(e) = session.run(stream, Arc::clone(&ctx.shutdown)).await {
                        debug!(%peer, error = %e, "session ended with error");
                    }
                    ctx.connections.fetch_sub(1, Ordering::SeqCst);
                    debug!(%peer, "client disconnected");
                });
            }
            Err(e) => {
                error!(error = %e, "accept error");
            }
        }
    }
}

/// Replay-side operations exposed to client sessions.
pub struct ServerReplayAccess {
    store: TraceStore,
    reconstructor: Reconstructor,
    breakpoints: Arc<Mutex<BreakpointEngine>>,
    idgen: UuidIdGen,
}

impl ServerReplayAccess {
    pub fn new(
        store: TraceStore,
        reconstructor: Reconstructor,
        breakpoints: Arc<Mutex<BreakpointEngine>>,
    ) -> Self {
        Self {
            store,
            reconstructor,
            breakpoints,
            idgen: UuidIdGen,
        }
    }
}

#[async_trait::async_trait]
impl ReplayAccess for ServerReplayAccess {
    async fn history(
        &self,
        session: &SessionId,
        range: (i64, i64),
    ) -> Result<HistoryReply, String> {
        let store = self.store.clone();
        let reconstructor = self.reconstructor.clone();
        let breakpoints = Arc::clone(&self.breakpoints);
        let session = session.clone();
        let query = TraceQuery {
            time_range: Some(range),
            ..TraceQuery::session(session.clone())
        };

        tokio::task::spawn_blocking(move || {
            let events = store.traces(&query).map_err(|e| e.to_string())?;

            // Replay through the breakpoint engine so conditional
            // breakpoints fire against the reconstructed state.
            let mut hits = Vec::new();
            if !events.is_empty() {
                let mut state = reconstructor
                    .state_at(&session, range.0)
                    .map_err(|e| e.to_string())?;
                let mut engine = breakpoints.lock();
                for event in &events {
                    state.apply_event(event);
                    for hit in engine.evaluate(&state, event) {
                        if let Ok(value) = serde_json::to_value(&hit) {
                            hits.push(value);
                        }
                    }
                }
            }

            Ok(HistoryReply { events, hits })
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn state_at(&self, session: &SessionId, t: i64) -> Result<SystemState, String> {
        let reconstructor = self.reconstructor.clone();
        let session = session.clone();
        tokio::task::spawn_blocking(move || reconstructor.state_at(&session, t))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }

    async fn set_breakpoint(
        &self,
        _session: &SessionId,
        trace_id: &str,
        condition: &str,
    ) -> Result<String, String> {
        if condition.is_empty() {
            return Err("empty condition".to_string());
        }
        let id = BreakpointId::new(self.idgen.next());
        let spec = Breakpoint {
            id: id.clone(),
            name: format!("client breakpoint on {trace_id}"),
            enabled: true,
            condition: BreakpointCondition::Expression {
                source: condition.to_string(),
            },
            action: "pause".to_string(),
            agent_filter: None,
            event_kind_filter: None,
            time_window: None,
            skip_count: 0,
            max_hits: 0,
            data_paths: vec!["event.data".to_string()],
        };
        self.breakpoints
            .lock()
            .add(spec)
            .map_err(|e| e.to_string())?;
        Ok(id.0)
    }

    async fn remove_breakpoint(&self, breakpoint_id: &str) -> Result<(), String> {
        self.breakpoints
            .lock()
            .remove(&BreakpointId::new(breakpoint_id))
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
