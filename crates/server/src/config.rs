// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server configuration.
//!
//! One TOML-deserialized structure with defaults for every option, mapped
//! onto the per-component configs at startup.

use retrace_store::{SnapshotStoreConfig, StoreConfig, WriterConfig};
use retrace_stream::{BackpressureConfig, BatcherConfig, RateLimitConfig, SessionConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: PathBuf,
    /// Batcher flush cadence.
    pub flush_interval_ms: u64,
    /// Write batch max rows (and queue capacity).
    pub batch_size: usize,
    /// Min payload bytes before block compression.
    pub compression_threshold: usize,
    /// Age limit enforced by the retention sweeper.
    pub retention_days: u32,
    pub connection_pool_size: u32,
    /// Untagged snapshot cap per session.
    pub max_snapshots: usize,
    /// Auto-snapshot cadence for active sessions (0 = off).
    pub snapshot_interval_ms: u64,
    pub streaming: StreamingSettings,
    pub rate_limit: RateLimitSettings,
    pub backpressure: BackpressureSettings,
    pub auth: AuthSettings,
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/retrace.db"),
            flush_interval_ms: 1000,
            batch_size: 1000,
            compression_threshold: 1024,
            retention_days: 30,
            connection_pool_size: 4,
            max_snapshots: 50,
            snapshot_interval_ms: 0,
            streaming: StreamingSettings::default(),
            rate_limit: RateLimitSettings::default(),
            backpressure: BackpressureSettings::default(),
            auth: AuthSettings::default(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    pub port: u16,
    pub max_connections: usize,
    pub heartbeat_interval_ms: u64,
    /// Outbound frame batch size.
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub historical_data_limit: usize,
    pub compress_frames: bool,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            port: 8475,
            max_connections: 256,
            heartbeat_interval_ms: 30_000,
            batch_size: 50,
            batch_timeout_ms: 1000,
            historical_data_limit: 500,
            compress_frames: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_ms: u64,
    pub max_messages: usize,
    pub max_bytes: usize,
    pub grace_period_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_ms: 1000,
            max_messages: 100,
            max_bytes: 1024 * 1024,
            grace_period_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackpressureSettings {
    pub high: usize,
    pub low: usize,
    pub max_queue: usize,
    pub drop_oldest: bool,
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self {
            high: 1024 * 1024,
            low: 256 * 1024,
            max_queue: 1000,
            drop_oldest: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthSettings {
    pub enabled: bool,
    pub api_keys: Vec<String>,
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.database_path.clone(),
            pool_size: self.connection_pool_size,
            compression_threshold: self.compression_threshold,
            ..StoreConfig::default()
        }
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms.max(1)),
            ..WriterConfig::default()
        }
    }

    pub fn snapshot_config(&self) -> SnapshotStoreConfig {
        SnapshotStoreConfig {
            max_snapshots: self.max_snapshots,
            ..SnapshotStoreConfig::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            batcher: BatcherConfig {
                batch_size: self.streaming.batch_size,
                batch_timeout_ms: self.streaming.batch_timeout_ms as i64,
            },
            backpressure: BackpressureConfig {
                high_watermark_bytes: self.backpressure.high,
                low_watermark_bytes: self.backpressure.low,
                max_queue_frames: self.backpressure.max_queue,
                drop_oldest: self.backpressure.drop_oldest,
            },
            rate_limit: RateLimitConfig {
                window_ms: self.rate_limit.window_ms as i64,
                max_messages: self.rate_limit.max_messages,
                max_bytes: self.rate_limit.max_bytes,
                grace_period_ms: self.rate_limit.grace_period_ms as i64,
            },
            heartbeat_interval_ms: self.streaming.heartbeat_interval_ms,
            historical_data_limit: self.streaming.historical_data_limit,
            compress_frames: self.streaming.compress_frames,
            ..SessionConfig::default()
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
