// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC protocol for daemon communication.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. Each
//! connection carries exactly one request/response cycle (§6's
//! Observable supervisor API).

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use afk_core::{Session, SessionStatus};
use afk_engine::{CronError, SweepSummary};

fn default_enabled() -> bool {
    true
}

/// Request from a CLI client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    /// Health check ping.
    Ping,

    /// Submit a new worker task (§6 `submit`).
    Submit {
        task: String,
        working_dir: std::path::PathBuf,
        #[serde(default)]
        iterations_planned: Option<u32>,
    },

    /// Cancel a running or queued session (§6 `stop`).
    Stop { id: String },

    /// Re-arm a stopped or failed session for another run (§6 `resume`).
    Resume { id: String },

    /// Fetch the externally visible view of one session (§6 `get`).
    Get { id: String },

    /// List sessions, optionally filtered by status.
    List { status: Option<SessionStatus> },

    /// Return the last `lines` lines of a session's log (§6 `tail`).
    Tail { id: String, lines: usize },

    /// Aggregate lifecycle statistics (§4.E `stats`).
    Stats,

    /// Run a retention sweep (§6 `cleanup`).
    Cleanup { dry_run: bool },

    /// Create a new cron or interval schedule. `description` is natural
    /// language ("every weekday at 9am") resolved to a cron expression
    /// by the Oracle Gateway.
    ScheduleCreate { description: String, command: String, timezone: String, #[serde(default = "default_enabled")] enabled: bool },

    /// List all persisted schedules.
    ScheduleList,

    /// Stop a schedule's timer without deleting it.
    ScheduleStop { id: String },

    /// Delete a schedule outright.
    ScheduleDelete { id: String },

    /// Request daemon shutdown.
    Shutdown,
}

/// Response from the daemon to a CLI client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Pong,
    Session(Session),
    Sessions(Vec<Session>),
    Tail { lines: Vec<String> },
    Stats(LifecycleStats),
    CleanupSummary(SweepSummary),
    Schedule(ScheduleSummary),
    Schedules(Vec<ScheduleSummary>),
    Ack,
    Error { message: String },
}

/// The externally visible lifecycle-wide counters (§4.E `stats`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LifecycleStats {
    pub total: usize,
    pub by_status: std::collections::HashMap<SessionStatus, usize>,
    pub avg_duration_s: f64,
    pub success_ratio_pct: f64,
    pub total_duration_s: f64,
}

impl From<crate::lifecycle::LifecycleStats> for LifecycleStats {
    fn from(stats: crate::lifecycle::LifecycleStats) -> Self {
        Self {
            total: stats.total,
            by_status: stats.by_status,
            avg_duration_s: stats.avg_duration_s,
            success_ratio_pct: stats.success_ratio_pct,
            total_duration_s: stats.total_duration_s,
        }
    }
}

/// A schedule as surfaced over the wire; mirrors [`afk_core::Schedule`]
/// without exposing its internal id-generation details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleSummary {
    pub id: String,
    pub command: String,
    pub cron: String,
    pub timezone: String,
    pub enabled: bool,
    pub next_run: Option<u64>,
    pub run_count: u64,
}

impl From<&afk_core::Schedule> for ScheduleSummary {
    fn from(schedule: &afk_core::Schedule) -> Self {
        Self {
            id: schedule.id.to_string(),
            command: schedule.command.clone(),
            cron: schedule.cron.clone(),
            timezone: schedule.timezone.clone(),
            enabled: schedule.enabled,
            next_run: schedule.next_run,
            run_count: schedule.run_count,
        }
    }
}

/// Protocol-level failures distinct from domain errors carried in a
/// [`Response::Error`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("malformed cron expression: {0}")]
    Cron(#[from] CronError),
}

/// Maximum message size (200 MB).
pub const MAX_MESSAGE_SIZE: usize = 200 * 1024 * 1024;

/// Default IPC timeout.
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Protocol version, derived from the crate version so mismatched
/// client/daemon builds are detectable without a handshake field.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Encode a message to JSON bytes, without the length prefix.
///
/// Use with [`write_message`], which adds the length-prefix framing.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge { size: json.len(), max: MAX_MESSAGE_SIZE });
    }
    Ok(json)
}

/// Decode a message from its wire-format bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Read a length-prefixed message from an async reader.
pub async fn read_message<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ProtocolError::ConnectionClosed),
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge { size: len, max: MAX_MESSAGE_SIZE });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed message to an async writer.
pub async fn write_message<W: tokio::io::AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> Result<(), ProtocolError> {
    let len = data.len();
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge { size: len, max: MAX_MESSAGE_SIZE });
    }
    writer.write_all(&(len as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a request, bounding the wait with `timeout`.
pub async fn read_request<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R, timeout: std::time::Duration) -> Result<Request, ProtocolError> {
    let bytes = tokio::time::timeout(timeout, read_message(reader)).await.map_err(|_| ProtocolError::Timeout)??;
    decode(&bytes)
}

/// Write a response, bounding the wait with `timeout`.
pub async fn write_response<W: tokio::io::AsyncWriteExt + Unpin>(writer: &mut W, response: &Response, timeout: std::time::Duration) -> Result<(), ProtocolError> {
    let data = encode(response)?;
    tokio::time::timeout(timeout, write_message(writer, &data)).await.map_err(|_| ProtocolError::Timeout)?
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
