// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unified error taxonomy (§7). Every error crosses crate boundaries as a
//! `SupervisorError` so callers can branch on `code()`/`retryable()` without
//! downcasting a `Box<dyn Error>`.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Fatal,
}

/// Sub-classification of a non-zero worker exit, from stderr fingerprinting
/// (§4.F step e).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExitKind {
    UsageLimit,
    Network,
    Auth,
    Generic,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("duplicate id: {0}")]
    Duplicate(String),

    #[error("store busy, retry later")]
    DbBusy,

    #[error("store unavailable: {0}")]
    DbUnavailable(String),

    #[error("worker spawn failed: {0}")]
    WorkerSpawnFailed(String),

    #[error("no such worker executable: {0}")]
    NoSuchExecutable(String),

    #[error("worker exited non-zero ({exit_code:?}): {kind:?}")]
    WorkerExitError {
        exit_code: Option<i32>,
        kind: WorkerExitKind,
        message: String,
    },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("circuit open: {0}")]
    CircuitOpen(String),

    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("oracle returned an invalid response: {0}")]
    OracleInvalidResponse(String),

    #[error("filesystem error: {0}")]
    FilesystemError(String),
}

impl SupervisorError {
    /// Stable string code for logging/telemetry and wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::InvalidState(_) => "invalid_state",
            SupervisorError::Duplicate(_) => "duplicate",
            SupervisorError::DbBusy => "db_busy",
            SupervisorError::DbUnavailable(_) => "db_unavailable",
            SupervisorError::WorkerSpawnFailed(_) => "worker_spawn_failed",
            SupervisorError::NoSuchExecutable(_) => "no_such_executable",
            SupervisorError::WorkerExitError { .. } => "worker_exit_error",
            SupervisorError::Timeout(_) => "timeout",
            SupervisorError::Cancelled => "cancelled",
            SupervisorError::CircuitOpen(_) => "circuit_open",
            SupervisorError::OracleUnavailable(_) => "oracle_unavailable",
            SupervisorError::OracleInvalidResponse(_) => "oracle_invalid_response",
            SupervisorError::FilesystemError(_) => "filesystem_error",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SupervisorError::DbUnavailable(_) => ErrorSeverity::Fatal,
            SupervisorError::NoSuchExecutable(_) => ErrorSeverity::Fatal,
            SupervisorError::NotFound(_)
            | SupervisorError::InvalidState(_)
            | SupervisorError::Duplicate(_)
            | SupervisorError::Cancelled => ErrorSeverity::Info,
            _ => ErrorSeverity::Warning,
        }
    }

    /// Whether a caller should retry the operation that produced this error.
    pub fn retryable(&self) -> bool {
        match self {
            SupervisorError::DbBusy => true,
            SupervisorError::WorkerSpawnFailed(_) => true,
            SupervisorError::Timeout(_) => true,
            SupervisorError::CircuitOpen(_) => false,
            SupervisorError::OracleUnavailable(_) => false,
            SupervisorError::FilesystemError(code) => {
                matches!(code.as_str(), "EMFILE" | "ENFILE" | "EAGAIN" | "EBUSY")
            }
            SupervisorError::WorkerExitError { kind, exit_code, .. } => match kind {
                WorkerExitKind::UsageLimit => true,
                WorkerExitKind::Network => true,
                WorkerExitKind::Auth => false,
                WorkerExitKind::Generic => {
                    matches!(exit_code, Some(1) | Some(130) | Some(143))
                }
            },
            _ => false,
        }
    }
}

/// Classify a worker's stderr tail plus exit code per §4.F step (e).
pub fn classify_worker_exit(exit_code: Option<i32>, stderr_tail: &str) -> WorkerExitKind {
    let lower = stderr_tail.to_ascii_lowercase();
    const USAGE_LIMIT_MARKERS: &[&str] = &[
        "usage limit",
        "rate limit",
        "quota exceeded",
        "too many requests",
        "limit exceeded",
    ];
    if USAGE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        return WorkerExitKind::UsageLimit;
    }
    if exit_code != Some(0) && (lower.contains("network") || lower.contains("connection")) {
        return WorkerExitKind::Network;
    }
    if exit_code != Some(0) && (lower.contains("auth") || lower.contains("permission")) {
        return WorkerExitKind::Auth;
    }
    WorkerExitKind::Generic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_limit_fingerprint_matches_case_insensitively() {
        assert_eq!(
            classify_worker_exit(Some(1), "Rate Limit exceeded, reset in 2 seconds"),
            WorkerExitKind::UsageLimit
        );
        assert_eq!(
            classify_worker_exit(Some(1), "QUOTA EXCEEDED"),
            WorkerExitKind::UsageLimit
        );
    }

    #[test]
    fn auth_errors_are_not_retryable() {
        let kind = classify_worker_exit(Some(2), "authentication failed");
        assert_eq!(kind, WorkerExitKind::Auth);
        let err = SupervisorError::WorkerExitError {
            exit_code: Some(2),
            kind,
            message: "authentication failed".into(),
        };
        assert!(!err.retryable());
    }

    #[test]
    fn generic_exit_retryable_only_for_known_codes() {
        let kind = classify_worker_exit(Some(1), "boom");
        let err = SupervisorError::WorkerExitError {
            exit_code: Some(1),
            kind,
            message: "boom".into(),
        };
        assert!(err.retryable());

        let err2 = SupervisorError::WorkerExitError {
            exit_code: Some(7),
            kind: WorkerExitKind::Generic,
            message: "boom".into(),
        };
        assert!(!err2.retryable());
    }

    #[test]
    fn filesystem_retry_codes() {
        assert!(SupervisorError::FilesystemError("EBUSY".into()).retryable());
        assert!(!SupervisorError::FilesystemError("ENOENT".into()).retryable());
    }
}
