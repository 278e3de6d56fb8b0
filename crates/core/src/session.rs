// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The authoritative session record (§3 of the specification).

use crate::id::SessionId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle status of a session. `Completed | Failed | Stopped | Error` are
/// terminal: once reached, no further field on the session may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Starting,
    Running,
    Completed,
    Failed,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Stopped
                | SessionStatus::Error
        )
    }

    /// Whether `self -> next` is a legal state-machine transition.
    ///
    /// `created -> starting -> running -> {completed|failed|stopped}`, plus
    /// any non-terminal state may jump to `error`. Terminal states are sinks.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        use SessionStatus::*;
        match (self, next) {
            (Created, Starting) => true,
            (Created, Error) => true,
            (Starting, Running) => true,
            (Starting, Error) => true,
            (Starting, Failed) => true,
            (Running, Completed | Failed | Stopped | Error) => true,
            // Allow re-affirming the current non-terminal status (idempotent
            // progress updates from the iteration engine).
            (a, b) if a == b => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Created => "created",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A single worker-child attempt, kept for diagnostics (`getStatus` tail).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub iteration: u32,
    pub attempt: u32,
    pub classification: String,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub exit_code: Option<i32>,
}

/// The authoritative session row (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub task: String,
    pub status: SessionStatus,
    pub iterations_planned: u32,
    pub iterations_completed: u32,
    pub model: String,
    pub working_dir: PathBuf,
    pub namespace: String,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub pid: Option<u32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    #[serde(default)]
    pub attempt_history: Vec<AttemptRecord>,
}

impl Session {
    pub fn new(id: SessionId, task: impl Into<String>, working_dir: PathBuf, now_ms: u64) -> Self {
        Self {
            id,
            task: task.into(),
            status: SessionStatus::Created,
            iterations_planned: 1,
            iterations_completed: 0,
            model: "default".to_string(),
            working_dir,
            namespace: "default".to_string(),
            created_at: now_ms,
            started_at: None,
            completed_at: None,
            pid: None,
            metadata: serde_json::Value::Null,
            error: None,
            attempt_history: Vec::new(),
        }
    }

    /// Invariant: `iterations_completed <= iterations_planned` always holds.
    pub fn invariants_hold(&self) -> bool {
        self.iterations_completed <= self.iterations_planned
            && self.started_at.map(|s| self.completed_at.is_none_or(|c| s <= c)).unwrap_or(true)
            && (!self.status.is_terminal() || self.completed_at.is_some())
    }
}

/// Partial update for `SessionStore::update`. `None` fields are left
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub iterations_planned: Option<u32>,
    pub iterations_completed: Option<u32>,
    pub model: Option<String>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub pid: Option<Option<u32>>,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<Option<String>>,
    pub push_attempt: Option<AttemptRecord>,
}

impl SessionPatch {
    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn iterations_completed(mut self, n: u32) -> Self {
        self.iterations_completed = Some(n);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(Some(message.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_sinks() {
        for terminal in [
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Stopped,
            SessionStatus::Error,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(SessionStatus::Running));
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        assert!(SessionStatus::Created.can_transition_to(SessionStatus::Starting));
        assert!(SessionStatus::Starting.can_transition_to(SessionStatus::Running));
        assert!(SessionStatus::Running.can_transition_to(SessionStatus::Completed));
    }

    #[test]
    fn skipping_starting_is_illegal() {
        assert!(!SessionStatus::Created.can_transition_to(SessionStatus::Running));
    }

    #[test]
    fn any_non_terminal_state_can_error() {
        assert!(SessionStatus::Created.can_transition_to(SessionStatus::Error));
        assert!(SessionStatus::Starting.can_transition_to(SessionStatus::Error));
        assert!(SessionStatus::Running.can_transition_to(SessionStatus::Error));
    }

    #[test]
    fn fresh_session_satisfies_invariants() {
        let s = Session::new(SessionId::new("s1"), "fix the bug", PathBuf::from("/tmp"), 0);
        assert!(s.invariants_hold());
    }
}
