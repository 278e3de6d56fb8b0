// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Lifecycle Manager (§4.E): the state-machine front door every
//! session passes through, from `create` to one of the three terminal
//! statuses. Persistence itself lives in [`afk_storage::SessionStore`];
//! this module owns the transition rules, the externally visible
//! status projection, and the lightweight terminal-session reaper that
//! is distinct from the Cleanup Engine's full retention sweep (§4.G).

use std::path::PathBuf;
use std::sync::Arc;

use afk_core::{Clock, Session, SessionId, SessionPatch, SessionStatus, SupervisorError, SystemClock};
use afk_storage::{SessionStore, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("could not determine state directory")]
    NoStateDir,

    #[error("failed to acquire lock: daemon already running? (pid file held)")]
    LockFailed(#[source] std::io::Error),

    #[error("failed to bind socket at {0}: {1}")]
    BindFailed(PathBuf, std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The externally visible view of a session (§4.E `getStatus`). Leaves
/// out internal bookkeeping (attempt history, metadata) that callers of
/// the wire protocol don't need.
#[derive(Debug, Clone)]
pub struct StatusView {
    pub id: SessionId,
    pub task: String,
    pub status: SessionStatus,
    pub current_iteration: u32,
    pub total_iterations: u32,
    pub duration_s: Option<f64>,
    pub error: Option<String>,
}

impl StatusView {
    fn from_session(session: &Session, now_ms: u64) -> Self {
        let duration_s = session.started_at.map(|started| {
            let end = session.completed_at.unwrap_or(now_ms);
            end.saturating_sub(started) as f64 / 1000.0
        });
        Self {
            id: session.id.clone(),
            task: session.task.clone(),
            status: session.status,
            current_iteration: session.iterations_completed,
            total_iterations: session.iterations_planned,
            duration_s,
            error: session.error.clone(),
        }
    }
}

/// Aggregate counters across every session the store holds (§4.E `stats`).
#[derive(Debug, Clone, Default)]
pub struct LifecycleStats {
    pub total: usize,
    pub by_status: std::collections::HashMap<SessionStatus, usize>,
    pub avg_duration_s: f64,
    pub success_ratio_pct: f64,
    pub total_duration_s: f64,
}

pub struct LifecycleManager<C: Clock = SystemClock> {
    store: Arc<SessionStore>,
    clock: C,
}

impl<C: Clock> LifecycleManager<C> {
    pub fn new(store: Arc<SessionStore>, clock: C) -> Self {
        Self { store, clock }
    }

    /// Creates a session in `created` status and persists it.
    pub fn create(&self, task: &str, working_dir: PathBuf, iterations_planned: u32) -> Result<Session, LifecycleError> {
        let id = SessionId::new(uuid::Uuid::new_v4().to_string());
        let mut session = Session::new(id, task, working_dir, self.clock.now_ms());
        session.iterations_planned = iterations_planned.max(1);
        self.store.create_session(session.clone())?;
        Ok(session)
    }

    /// Applies a validated status transition. Rejects writes once the
    /// session has reached a terminal status; `started_at`/`completed_at`
    /// stamping happens inside the store as a side effect of the status
    /// event itself.
    pub fn set_status(&self, id: &SessionId, status: SessionStatus, patch: SessionPatch) -> Result<Session, LifecycleError> {
        let patch = SessionPatch { status: Some(status), ..patch };
        Ok(self.store.update_session(id, patch, self.clock.now_ms())?)
    }

    pub fn get_status(&self, id: &SessionId) -> Result<StatusView, LifecycleError> {
        let session = self.store.get_session(id)?;
        Ok(StatusView::from_session(&session, self.clock.now_ms()))
    }

    pub fn fail(&self, id: &SessionId, error: impl Into<String>) -> Result<Session, LifecycleError> {
        self.set_status(id, SessionStatus::Failed, SessionPatch::default().error(error.into()))
    }

    /// Marks a session complete. `output` is folded into the session's
    /// metadata rather than given its own column, mirroring how
    /// milestone summaries already ride in the progress journal.
    pub fn complete(&self, id: &SessionId, output: Option<String>) -> Result<Session, LifecycleError> {
        let mut patch = SessionPatch::default().status(SessionStatus::Completed);
        if let Some(output) = output {
            patch.metadata = Some(serde_json::json!({ "output": output }));
        }
        Ok(self.store.update_session(id, patch, self.clock.now_ms())?)
    }

    /// Deletes terminal sessions (and their log files) older than
    /// `older_than_days`. Unlike the Cleanup Engine's sweep, this has no
    /// preserve-recent floor and no legacy-directory phase; it exists so
    /// a caller can reclaim space without waiting for the next
    /// scheduled retention pass.
    pub fn cleanup_completed(&self, logs_dir: &std::path::Path, older_than_days: u64) -> Result<usize, LifecycleError> {
        let cutoff_ms = older_than_days.saturating_mul(24 * 60 * 60 * 1000);
        let now = self.clock.now_ms();
        let mut deleted = 0;
        for session in self.store.list_sessions()? {
            if !session.status.is_terminal() {
                continue;
            }
            let terminal_at = session.completed_at.unwrap_or(session.created_at);
            if now.saturating_sub(terminal_at) < cutoff_ms {
                continue;
            }
            self.store.delete_session(&session.id)?;
            let log_path = logs_dir.join(format!("{}.log", session.id));
            if let Err(e) = std::fs::remove_file(&log_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(session_id = %session.id, error = %e, "failed to remove log during lifecycle cleanup");
                }
            }
            deleted += 1;
        }
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<LifecycleStats, LifecycleError> {
        let sessions = self.store.list_sessions()?;
        let mut stats = LifecycleStats { total: sessions.len(), ..Default::default() };
        let now = self.clock.now_ms();
        let mut terminal_count = 0usize;
        let mut completed_count = 0usize;

        for session in &sessions {
            *stats.by_status.entry(session.status).or_insert(0) += 1;
            if let Some(started) = session.started_at {
                let end = session.completed_at.unwrap_or(now);
                let duration_s = end.saturating_sub(started) as f64 / 1000.0;
                stats.total_duration_s += duration_s;
                if session.status.is_terminal() {
                    terminal_count += 1;
                    if session.status == SessionStatus::Completed {
                        completed_count += 1;
                    }
                }
            }
        }

        if terminal_count > 0 {
            stats.avg_duration_s = stats.total_duration_s / terminal_count as f64;
            stats.success_ratio_pct = completed_count as f64 / terminal_count as f64 * 100.0;
        }
        Ok(stats)
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
