// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Live streaming fan-out for Retrace
//!
//! Per-connection client sessions with authentication, inbound rate
//! limiting, outbound batching and backpressure, heartbeats, historical
//! replay, and time-travel integration.

pub mod auth;
pub mod backpressure;
pub mod batcher;
pub mod frames;
pub mod hub;
pub mod limiter;
pub mod session;

pub use auth::{AllowAll, ApiKeyValidator, Authenticator, TokenValidator};
pub use backpressure::{BackpressureConfig, OutboundQueue, QueueState};
pub use batcher::{BatcherConfig, EventBatcher};
pub use frames::{
    read_frame, write_frame, ClientFrame, ErrorCode, ServerFrame, StreamError, TimeRange,
    MAX_FRAME_SIZE,
};
pub use hub::{HubMetricsSnapshot, StreamHub, SubscriberHandle};
pub use limiter::{LimitDecision, RateLimitConfig, SlidingWindowLimiter};
pub use session::{ClientSession, HistoryReply, ReplayAccess, SessionConfig, SessionPhase};
