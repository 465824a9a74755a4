// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire frames for the streaming protocol.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. Frame
//! payloads may be compressed with the payload codec; the one-byte marker
//! distinguishes compressed bodies from bare JSON.

use retrace_core::codec;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Streaming protocol errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("codec error: {0}")]
    Codec(#[from] retrace_core::CodecError),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("authentication failed")]
    AuthFailure,

    #[error("rate limit exceeded")]
    RateLimitExceeded,
}

/// Typed error codes carried in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "RATE_LIMIT")]
    RateLimit,
    #[serde(rename = "AUTH")]
    Auth,
    #[serde(rename = "BAD_REQUEST")]
    BadRequest,
    #[serde(rename = "BACKPRESSURE")]
    Backpressure,
}

/// Inclusive time range in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "apiKey")]
        api_key: Option<String>,
    },
    SubscribeSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    FilterAgents {
        #[serde(rename = "agentIds")]
        agent_ids: Vec<String>,
    },
    RequestHistory {
        #[serde(rename = "timeRange")]
        time_range: TimeRange,
    },
    TimeTravel {
        timestamp: i64,
    },
    SetBreakpoint {
        #[serde(rename = "traceId")]
        trace_id: String,
        condition: String,
    },
    RemoveBreakpoint {
        #[serde(rename = "breakpointId")]
        breakpoint_id: String,
    },
    Ack {
        seq: u64,
    },
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    TraceEvent {
        timestamp: i64,
        data: Value,
    },
    HistoricalData {
        seq: usize,
        total: usize,
        traces: Vec<Value>,
    },
    Heartbeat {
        timestamp: i64,
        metrics: Value,
    },
    StateSnapshot {
        timestamp: i64,
        state: Value,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    BreakpointHit {
        data: Value,
    },
}

/// Encode a frame to its wire payload (without the length prefix).
pub fn encode_frame<T: Serialize>(frame: &T, compress: bool) -> Result<Vec<u8>, StreamError> {
    let bytes = if compress {
        // Marker-framed via the payload codec; bodies under the threshold
        // stay plain behind the marker byte.
        let value = serde_json::to_value(frame)?;
        codec::encode(&value, codec::DEFAULT_COMPRESSION_THRESHOLD)?
    } else {
        serde_json::to_vec(frame)?
    };

    if bytes.len() > MAX_FRAME_SIZE {
        return Err(StreamError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode a wire payload into a frame, compressed or bare.
pub fn decode_frame<T: DeserializeOwned>(payload: &[u8]) -> Result<T, StreamError> {
    match payload.first() {
        // Codec markers; JSON text never starts with these bytes.
        Some(0x00) | Some(0x01) => {
            let value = codec::decode(payload)?;
            Ok(serde_json::from_value(value)?)
        }
        _ => Ok(serde_json::from_slice(payload)?),
    }
}

/// Read one length-prefixed payload from an async reader.
///
/// Returns the raw payload and its size on the wire.
pub async fn read_payload<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, StreamError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(StreamError::ConnectionClosed);
        }
        Err(e) => return Err(StreamError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(StreamError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read one frame from an async reader. Returns the frame and its wire size.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<(T, usize), StreamError>
where
    R: tokio::io::AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let payload = read_payload(reader).await?;
    let size = payload.len();
    Ok((decode_frame(&payload)?, size))
}

/// Write one frame to an async writer.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T, compress: bool) -> Result<(), StreamError>
where
    W: tokio::io::AsyncWriteExt + Unpin,
    T: Serialize,
{
    let payload = encode_frame(frame, compress)?;
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
#[path = "frames_tests.rs"]
mod tests;
