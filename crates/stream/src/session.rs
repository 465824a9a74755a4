// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection client session.
//!
//! Three tasks cooperate per connection: a reader pumping raw payloads, a
//! writer draining the outbound queue, and the session loop in between.
//! The writer owns the socket send half, so a stalled client never blocks
//! the session loop — the outbound queue absorbs frames and applies the
//! drop-oldest policy instead.
//!
//! Protocol state machine:
//!
//! ```text
//! Connecting → Authenticated → Subscribed ⇄ Streaming → Closing → Closed
//!       │                            │
//!       └─► Rejected                 └─► Backpressured → Streaming (on drain)
//! ```

use crate::auth::Authenticator;
use crate::backpressure::{BackpressureConfig, OutboundQueue, QueueState};
use crate::batcher::{BatcherConfig, EventBatcher};
use crate::frames::{self, ClientFrame, ErrorCode, ServerFrame, StreamError};
use crate::hub::{StreamHub, SubscriberHandle};
use crate::limiter::{LimitDecision, RateLimitConfig, SlidingWindowLimiter};
use async_trait::async_trait;
use parking_lot::Mutex;
use retrace_core::{AgentId, Clock, SessionId, SystemClock, SystemState, TraceEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Result of a historical replay: the events plus any breakpoint hits the
/// replay driver fired along the way (as loose JSON for the wire).
#[derive(Debug, Clone, Default)]
pub struct HistoryReply {
    pub events: Vec<TraceEvent>,
    pub hits: Vec<serde_json::Value>,
}

/// Replay-side operations a session can invoke on behalf of its client.
///
/// Implemented by the server over the store, reconstructor and breakpoint
/// engine; stringly-typed at this seam so the transport stays decoupled.
#[async_trait]
pub trait ReplayAccess: Send + Sync {
    /// Replay the session's events within an inclusive range, evaluating
    /// installed breakpoints along the way.
    async fn history(
        &self,
        session: &SessionId,
        range: (i64, i64),
    ) -> Result<HistoryReply, String>;

    /// Reconstructed state at an instant.
    async fn state_at(&self, session: &SessionId, t: i64) -> Result<SystemState, String>;

    /// Install a breakpoint from a client condition; returns its id.
    async fn set_breakpoint(
        &self,
        session: &SessionId,
        trace_id: &str,
        condition: &str,
    ) -> Result<String, String>;

    /// Remove a breakpoint by id.
    async fn remove_breakpoint(&self, breakpoint_id: &str) -> Result<(), String>;
}

/// Protocol phase of one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Authenticated,
    Subscribed,
    Streaming,
    Closing,
    Closed,
    Rejected,
}

/// Session tuning knobs.
#[derive(Clone)]
pub struct SessionConfig {
    pub batcher: BatcherConfig,
    pub backpressure: BackpressureConfig,
    pub rate_limit: RateLimitConfig,
    pub heartbeat_interval_ms: u64,
    /// Max records per historical_data chunk.
    pub historical_data_limit: usize,
    pub compress_frames: bool,
    /// Protocol errors tolerated within a 10 s window before closing.
    pub max_protocol_errors: u32,
    /// Capacity of the live feed channel from the hub.
    pub feed_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batcher: BatcherConfig::default(),
            backpressure: BackpressureConfig::default(),
            rate_limit: RateLimitConfig::default(),
            heartbeat_interval_ms: 30_000,
            historical_data_limit: 500,
            compress_frames: false,
            max_protocol_errors: 5,
            feed_capacity: 1024,
        }
    }
}

/// Outbound queue shared with the writer task.
type SharedQueue = Arc<(Mutex<OutboundQueue<Vec<u8>>>, Notify)>;

/// One client connection.
pub struct ClientSession<A: ReplayAccess> {
    config: SessionConfig,
    auth: Authenticator,
    hub: StreamHub,
    access: Arc<A>,
    clock: SystemClock,

    phase: SessionPhase,
    session_id: Option<SessionId>,
    limiter: SlidingWindowLimiter,
    batcher: EventBatcher,
    queue: SharedQueue,

    protocol_errors: u32,
    protocol_errors_since: Instant,
    last_ack: u64,
}

impl<A: ReplayAccess + 'static> ClientSession<A> {
    pub fn new(
        config: SessionConfig,
        auth: Authenticator,
        hub: StreamHub,
        access: Arc<A>,
    ) -> Self {
        let clock = SystemClock;
        let now = clock.now_ms();
        let phase = if auth.enabled() {
            SessionPhase::Connecting
        } else {
            SessionPhase::Authenticated
        };
        Self {
            limiter: SlidingWindowLimiter::new(config.rate_limit.clone()),
            batcher: EventBatcher::new(config.batcher.clone(), now),
            queue: Arc::new((
                Mutex::new(OutboundQueue::new(config.backpressure.clone())),
                Notify::new(),
            )),
            config,
            auth,
            hub,
            access,
            clock,
            phase,
            session_id: None,
            protocol_errors: 0,
            protocol_errors_since: Instant::now(),
            last_ack: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Drive the connection until it closes or `shutdown` fires.
    pub async fn run<S>(mut self, stream: S, shutdown: Arc<Notify>) -> Result<(), StreamError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);

        // Reader task: pumps raw payloads; stops on fatal transport errors.
        let (payload_tx, mut payload_rx) = mpsc::channel::<Result<Vec<u8>, StreamError>>(16);
        let reader_task = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                let result = frames::read_payload(&mut reader).await;
                let fatal = result.is_err();
                if payload_tx.send(result).await.is_err() || fatal {
                    break;
                }
            }
        });

        // Writer task: drains the shared queue; owns the send half. A
        // single write stuck past the deadline closes the connection.
        const WRITE_DEADLINE: Duration = Duration::from_secs(30);
        let (write_err_tx, mut write_err_rx) = mpsc::channel::<StreamError>(1);
        let writer_queue = Arc::clone(&self.queue);
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            loop {
                let notified = writer_queue.1.notified();
                let payload = { writer_queue.0.lock().pop() };
                match payload {
                    Some(bytes) => {
                        let result =
                            tokio::time::timeout(WRITE_DEADLINE, write_payload(&mut writer, &bytes))
                                .await
                                .unwrap_or(Err(StreamError::Timeout));
                        if let Err(e) = result {
                            let _ = write_err_tx.send(e).await;
                            break;
                        }
                    }
                    None => notified.await,
                }
            }
        });

        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await; // immediate first tick

        let flush_every = Duration::from_millis((self.config.batcher.batch_timeout_ms as u64).clamp(10, 1000));
        let mut flush_tick = tokio::time::interval(flush_every);

        let mut live_rx: Option<mpsc::Receiver<Arc<TraceEvent>>> = None;
        let mut sub_handle: Option<SubscriberHandle> = None;
        let mut last_inbound = Instant::now();

        let result = loop {
            let pulling = self.pulling_live() && live_rx.is_some();
            tokio::select! {
                inbound = payload_rx.recv() => {
                    match inbound {
                        None | Some(Err(StreamError::ConnectionClosed)) => break Ok(()),
                        Some(Err(e)) => {
                            debug!(error = %e, "transport error, closing session");
                            break Err(e);
                        }
                        Some(Ok(payload)) => {
                            last_inbound = Instant::now();
                            match self.admit(payload.len()).await {
                                LimitDecision::Exceeded => {
                                    self.enqueue(&ServerFrame::Error {
                                        code: ErrorCode::RateLimit,
                                        message: "rate limit exceeded".to_string(),
                                    });
                                    break Err(StreamError::RateLimitExceeded);
                                }
                                LimitDecision::Allowed | LimitDecision::Throttled => {}
                            }
                            match frames::decode_frame::<ClientFrame>(&payload) {
                                Ok(frame) => {
                                    if !self.on_frame(frame, &mut live_rx, &mut sub_handle).await {
                                        break Ok(());
                                    }
                                }
                                Err(e) => {
                                    if !self.protocol_error(&format!("malformed frame: {e}")) {
                                        break Ok(());
                                    }
                                }
                            }
                        }
                    }
                }

                maybe_event = recv_live(&mut live_rx), if pulling => {
                    match maybe_event {
                        Some(event) => {
                            self.phase = SessionPhase::Streaming;
                            let now = self.clock.now_ms();
                            if let Some(batch) = self.batcher.push(event, now) {
                                self.enqueue_events(&batch);
                            }
                        }
                        None => live_rx = None,
                    }
                }

                write_err = write_err_rx.recv() => {
                    match write_err {
                        Some(e) => {
                            debug!(error = %e, "write side failed, closing session");
                            break Err(e);
                        }
                        None => break Ok(()),
                    }
                }

                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() >= heartbeat_interval * 2 {
                        debug!("client silent past heartbeat deadline, closing");
                        break Ok(());
                    }
                    self.enqueue_heartbeat();
                }

                _ = flush_tick.tick() => {
                    let now = self.clock.now_ms();
                    if let Some(batch) = self.batcher.tick(now) {
                        self.enqueue_events(&batch);
                    }
                }

                _ = shutdown.notified() => {
                    debug!("server shutdown, closing session");
                    break Ok(());
                }
            }
        };

        // Closing: flush the batcher and give the writer a bounded window
        // to drain what is already queued.
        self.phase = SessionPhase::Closing;
        let now = self.clock.now_ms();
        let remainder = self.batcher.flush(now);
        self.enqueue_events(&remainder);
        self.settle(Duration::from_secs(3)).await;

        drop(sub_handle);
        reader_task.abort();
        writer_task.abort();
        self.phase = SessionPhase::Closed;
        result
    }

    fn pulling_live(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Subscribed | SessionPhase::Streaming
        ) && self.queue.0.lock().state() == QueueState::Streaming
    }

    /// Rate-limit admission; throttled messages are delayed, not dropped.
    async fn admit(&mut self, bytes: usize) -> LimitDecision {
        let decision = self.limiter.check(self.clock.now_ms(), bytes);
        if decision == LimitDecision::Throttled {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        decision
    }

    /// Handle one decoded client frame. Returns `false` to close.
    async fn on_frame(
        &mut self,
        frame: ClientFrame,
        live_rx: &mut Option<mpsc::Receiver<Arc<TraceEvent>>>,
        sub_handle: &mut Option<SubscriberHandle>,
    ) -> bool {
        // Until authenticated, only auth frames are accepted.
        if self.phase == SessionPhase::Connecting {
            return match frame {
                ClientFrame::Auth { token, api_key } => {
                    let credential = token.or(api_key).unwrap_or_default();
                    if self.auth.check(&credential) {
                        self.phase = SessionPhase::Authenticated;
                        true
                    } else {
                        self.enqueue(&ServerFrame::Error {
                            code: ErrorCode::Auth,
                            message: "authentication failed".to_string(),
                        });
                        self.phase = SessionPhase::Rejected;
                        false
                    }
                }
                _ => {
                    self.enqueue(&ServerFrame::Error {
                        code: ErrorCode::Auth,
                        message: "authenticate first".to_string(),
                    });
                    self.protocol_error("frame before auth")
                }
            };
        }

        match frame {
            ClientFrame::Auth { .. } => true, // already authenticated

            ClientFrame::SubscribeSession { session_id } => {
                let session = SessionId::new(session_id);
                let (handle, rx) = self
                    .hub
                    .subscribe(session.clone(), self.config.feed_capacity);
                *sub_handle = Some(handle);
                *live_rx = Some(rx);
                self.session_id = Some(session);
                self.phase = SessionPhase::Subscribed;
                true
            }

            ClientFrame::FilterAgents { agent_ids } => match sub_handle {
                Some(handle) => {
                    let filter: Vec<AgentId> = agent_ids.into_iter().map(AgentId::new).collect();
                    handle.set_agent_filter(Some(filter));
                    true
                }
                None => self.protocol_error("filter_agents before subscribe"),
            },

            ClientFrame::RequestHistory { time_range } => {
                let Some(session) = self.session_id.clone() else {
                    return self.protocol_error("request_history before subscribe");
                };
                // While chunks are queued the live feed is not pulled, so
                // historical frames fully precede resumed live frames.
                let was_streaming = self.phase == SessionPhase::Streaming;
                self.phase = SessionPhase::Subscribed;
                match self
                    .access
                    .history(&session, (time_range.start, time_range.end))
                    .await
                {
                    Ok(reply) => {
                        self.enqueue_history(&reply.events);
                        for hit in reply.hits {
                            self.enqueue(&ServerFrame::BreakpointHit { data: hit });
                        }
                    }
                    Err(message) => self.enqueue(&ServerFrame::Error {
                        code: ErrorCode::BadRequest,
                        message,
                    }),
                }
                if was_streaming {
                    self.phase = SessionPhase::Streaming;
                }
                true
            }

            ClientFrame::TimeTravel { timestamp } => {
                let Some(session) = self.session_id.clone() else {
                    return self.protocol_error("time_travel before subscribe");
                };
                match self.access.state_at(&session, timestamp).await {
                    Ok(state) => {
                        let state_json = serde_json::to_value(&state).unwrap_or(json!(null));
                        self.enqueue(&ServerFrame::StateSnapshot {
                            timestamp,
                            state: state_json,
                        });
                    }
                    Err(message) => self.enqueue(&ServerFrame::Error {
                        code: ErrorCode::BadRequest,
                        message,
                    }),
                }
                true
            }

            ClientFrame::SetBreakpoint {
                trace_id,
                condition,
            } => {
                let session = self.session_id.clone().unwrap_or_else(|| SessionId::new(""));
                if let Err(message) = self
                    .access
                    .set_breakpoint(&session, &trace_id, &condition)
                    .await
                {
                    self.enqueue(&ServerFrame::Error {
                        code: ErrorCode::BadRequest,
                        message,
                    });
                }
                true
            }

            ClientFrame::RemoveBreakpoint { breakpoint_id } => {
                if let Err(message) = self.access.remove_breakpoint(&breakpoint_id).await {
                    self.enqueue(&ServerFrame::Error {
                        code: ErrorCode::BadRequest,
                        message,
                    });
                }
                true
            }

            ClientFrame::Ack { seq } => {
                self.last_ack = self.last_ack.max(seq);
                true
            }
        }
    }

    /// Count a protocol offense; returns `false` when the connection
    /// should close.
    fn protocol_error(&mut self, message: &str) -> bool {
        const WINDOW: Duration = Duration::from_secs(10);
        if self.protocol_errors_since.elapsed() > WINDOW {
            self.protocol_errors = 0;
            self.protocol_errors_since = Instant::now();
        }
        self.protocol_errors += 1;
        warn!(count = self.protocol_errors, message, "protocol error");

        self.enqueue(&ServerFrame::Error {
            code: ErrorCode::BadRequest,
            message: message.to_string(),
        });
        self.protocol_errors <= self.config.max_protocol_errors
    }

    // --- outbound ---------------------------------------------------------

    fn enqueue(&self, frame: &ServerFrame) {
        let payload = match frames::encode_frame(frame, self.config.compress_frames) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound frame");
                return;
            }
        };
        let size = payload.len();
        {
            let mut queue = self.queue.0.lock();
            queue.push(payload, size);
        }
        self.queue.1.notify_one();
    }

    fn enqueue_events(&mut self, batch: &[Arc<TraceEvent>]) {
        if batch.is_empty() {
            return;
        }
        for event in batch {
            let data = match serde_json::to_value(event.as_ref()) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "failed to serialize trace event");
                    continue;
                }
            };
            self.enqueue(&ServerFrame::TraceEvent {
                timestamp: event.timestamp,
                data,
            });
        }
        if matches!(self.phase, SessionPhase::Subscribed) {
            self.phase = SessionPhase::Streaming;
        }
    }

    fn enqueue_history(&self, events: &[TraceEvent]) {
        let limit = self.config.historical_data_limit.max(1);
        let total = events.len().div_ceil(limit);
        for (index, chunk) in events.chunks(limit).enumerate() {
            let traces: Vec<serde_json::Value> = chunk
                .iter()
                .filter_map(|e| serde_json::to_value(e).ok())
                .collect();
            self.enqueue(&ServerFrame::HistoricalData {
                seq: index + 1,
                total,
                traces,
            });
        }
        if events.is_empty() {
            self.enqueue(&ServerFrame::HistoricalData {
                seq: 1,
                total: 1,
                traces: Vec::new(),
            });
        }
    }

    fn enqueue_heartbeat(&self) {
        let (depth, bytes, dropped, state) = {
            let queue = self.queue.0.lock();
            (queue.len(), queue.bytes(), queue.dropped(), queue.state())
        };
        let hub = self.hub.metrics();
        self.enqueue(&ServerFrame::Heartbeat {
            timestamp: self.clock.now_ms(),
            metrics: json!({
                "queue_depth": depth,
                "queue_bytes": bytes,
                "events_dropped": dropped + hub.dropped,
                "backpressured": state == QueueState::Backpressured,
                "published": hub.published,
                "delivered": hub.delivered,
                "last_ack": self.last_ack,
            }),
        });
    }

    /// Wait (bounded) for the writer task to drain the queue.
    async fn settle(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queue.0.lock().is_empty() || Instant::now() >= deadline {
                return;
            }
            self.queue.1.notify_one();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn recv_live(
    rx: &mut Option<mpsc::Receiver<Arc<TraceEvent>>>,
) -> Option<Arc<TraceEvent>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_payload<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), StreamError> {
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
