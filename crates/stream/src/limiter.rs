// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound sliding-window rate limiter.
//!
//! Counts messages and bytes per client within a rolling window. Going
//! over the limit throttles delivery; staying over for the grace period
//! escalates to disconnect.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_ms: i64,
    pub max_messages: usize,
    pub max_bytes: usize,
    /// Sustained throttling past this duration escalates to `Exceeded`.
    pub grace_period_ms: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 1000,
            max_messages: 100,
            max_bytes: 1024 * 1024,
            grace_period_ms: 5000,
        }
    }
}

/// Outcome of admitting one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    /// Over limit: delay delivery, do not disconnect.
    Throttled,
    /// Over limit beyond the grace period: disconnect.
    Exceeded,
}

/// Per-client sliding window over `(timestamp, bytes)` entries.
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    entries: VecDeque<(i64, usize)>,
    bytes_in_window: usize,
    throttled_since: Option<i64>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            bytes_in_window: 0,
            throttled_since: None,
        }
    }

    /// Admit one message of `bytes` received at `now_ms`.
    pub fn check(&mut self, now_ms: i64, bytes: usize) -> LimitDecision {
        self.evict(now_ms);

        let over = self.entries.len() + 1 > self.config.max_messages
            || self.bytes_in_window + bytes > self.config.max_bytes;

        // The message was received either way; it occupies the window.
        self.entries.push_back((now_ms, bytes));
        self.bytes_in_window += bytes;

        if !over {
            self.throttled_since = None;
            return LimitDecision::Allowed;
        }

        match self.throttled_since {
            None => {
                self.throttled_since = Some(now_ms);
                LimitDecision::Throttled
            }
            Some(since) if now_ms - since >= self.config.grace_period_ms => {
                LimitDecision::Exceeded
            }
            Some(_) => LimitDecision::Throttled,
        }
    }

    fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.config.window_ms;
        while let Some(&(ts, bytes)) = self.entries.front() {
            if ts > cutoff {
                break;
            }
            self.entries.pop_front();
            self.bytes_in_window -= bytes;
        }
    }
}

#[cfg(test)]
#[path = "limiter_tests.rs"]
mod tests;
