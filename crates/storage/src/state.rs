// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Session Store (§4.A): materialized state derived from WAL replay,
//! and the facade the rest of the supervisor talks to.

use crate::checkpoint::{CheckpointError, CheckpointResult, Checkpointer};
use crate::snapshot::SnapshotError;
use crate::wal::{Wal, WalError};
use afk_core::{Event, Schedule, ScheduleId, ScheduleResult, Session, SessionId, SessionPatch, SessionStatus, SupervisorError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("wal error: {0}")]
    Wal(#[from] WalError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// In-memory state derived by folding the WAL's `Event`s, one session and
/// schedule table each (§3). Every handler here must be idempotent: a
/// crash can replay an event that was already visible before the crash.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MaterializedState {
    pub sessions: HashMap<String, Session>,
    pub schedules: HashMap<String, Schedule>,
}

impl MaterializedState {
    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::SessionCreated { session } => {
                self.sessions
                    .entry(session.id.to_string())
                    .or_insert_with(|| (**session).clone());
            }
            Event::SessionStatusChanged { id, status, at_ms, error } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    session.status = *status;
                    session.error.clone_from(error);
                    if session.started_at.is_none() && *status == SessionStatus::Running {
                        session.started_at = Some(*at_ms);
                    }
                    if status.is_terminal() && session.completed_at.is_none() {
                        session.completed_at = Some(*at_ms);
                    }
                }
            }
            Event::SessionIterationsUpdated { id, iterations_completed } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    // Guard against regressing on a replayed/duplicated event.
                    session.iterations_completed = session.iterations_completed.max(*iterations_completed);
                }
            }
            Event::SessionPidUpdated { id, pid } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    session.pid = *pid;
                }
            }
            Event::SessionMetadataMerged { id, metadata } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    if let (Some(dst), Some(src)) = (session.metadata.as_object_mut(), metadata.as_object()) {
                        for (k, v) in src {
                            dst.insert(k.clone(), v.clone());
                        }
                    } else {
                        session.metadata = metadata.clone();
                    }
                }
            }
            Event::SessionAttemptRecorded { id, attempt } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    let already_recorded = session
                        .attempt_history
                        .iter()
                        .any(|a| a.iteration == attempt.iteration && a.attempt == attempt.attempt);
                    if !already_recorded {
                        session.attempt_history.push(attempt.clone());
                    }
                }
            }
            Event::SessionDeleted { id } => {
                self.sessions.remove(id.as_str());
            }
            Event::ScheduleCreated { schedule } => {
                self.schedules
                    .entry(schedule.id.to_string())
                    .or_insert_with(|| (**schedule).clone());
            }
            Event::ScheduleNextRunComputed { id, next_run } => {
                if let Some(schedule) = self.schedules.get_mut(id.as_str()) {
                    schedule.next_run = *next_run;
                }
            }
            Event::ScheduleEnabledChanged { id, enabled } => {
                if let Some(schedule) = self.schedules.get_mut(id.as_str()) {
                    schedule.enabled = *enabled;
                }
            }
            Event::ScheduleFired { id, at_ms, result, spawned_session_id: _ } => {
                if let Some(schedule) = self.schedules.get_mut(id.as_str()) {
                    // Guard: only count a fire once, keyed by timestamp, so a
                    // replayed event doesn't double the run count.
                    if schedule.last_run != Some(*at_ms) {
                        schedule.run_count += 1;
                    }
                    schedule.last_run = Some(*at_ms);
                    schedule.last_error = result.error.clone();
                    schedule.last_result = Some(result.clone());
                }
            }
            Event::ScheduleDeleted { id } => {
                self.schedules.remove(id.as_str());
            }
        }
    }
}

struct Inner {
    wal: Wal,
    state: MaterializedState,
}

/// Session and schedule persistence facade (§4.A). Backed by a WAL plus
/// periodic background checkpoints; see `afk-storage`'s crate docs for the
/// durability ordering.
pub struct SessionStore {
    inner: Mutex<Inner>,
    checkpointer: Checkpointer,
}

/// Bounded retry windows for a contended store, per §4.A's "db busy" rule:
/// at most 3 attempts before giving up and returning `DbBusy`.
const LOCK_BACKOFFS: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(200),
];

impl SessionStore {
    /// Open (or create) the store rooted at `data_dir`, replaying the WAL
    /// on top of the most recent snapshot.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).map_err(WalError::Io)?;
        let snapshot_path = data_dir.join("snapshot.bin");
        let wal_path = data_dir.join("wal.jsonl");

        let loaded = crate::checkpoint::load_snapshot(&snapshot_path)?;
        let (processed_seq, mut state) = match loaded {
            Some(s) => (s.seq, s.state),
            None => (0, MaterializedState::default()),
        };

        let mut wal = Wal::open(&wal_path, processed_seq)?;
        while let Some(entry) = wal.next_unprocessed()? {
            state.apply_event(&entry.event);
            wal.mark_processed(entry.seq);
        }

        Ok(Self {
            inner: Mutex::new(Inner { wal, state }),
            checkpointer: Checkpointer::new(snapshot_path),
        })
    }

    fn with_lock<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T, StoreError>) -> Result<T, StoreError> {
        for backoff in LOCK_BACKOFFS {
            if let Some(mut guard) = self.inner.try_lock_for(backoff) {
                return f(&mut guard);
            }
        }
        Err(SupervisorError::DbBusy.into())
    }

    fn record(inner: &mut Inner, event: Event) -> Result<(), StoreError> {
        inner.state.apply_event(&event);
        let seq = inner.wal.append(&event)?;
        inner.wal.mark_processed(seq);
        Ok(())
    }

    /// Flush the WAL's write buffer if the group-commit interval or
    /// threshold has been reached. Call this from a periodic background
    /// task; it is not implied by `create`/`update`/`delete`.
    pub fn flush_if_needed(&self) -> Result<(), StoreError> {
        self.with_lock(|inner| {
            if inner.wal.needs_flush() {
                inner.wal.flush()?;
            }
            Ok(())
        })
    }

    /// Force an immediate flush, e.g. on graceful shutdown.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.with_lock(|inner| inner.wal.flush().map_err(Into::into))
    }

    /// Run a background checkpoint and, once durable, truncate the WAL up
    /// to the checkpointed sequence.
    pub fn checkpoint(&self) -> Result<CheckpointResult, StoreError> {
        let (seq, state) = self.with_lock(|inner| {
            inner.wal.flush()?;
            Ok((inner.wal.processed_seq(), inner.state.clone()))
        })?;
        let result = self.checkpointer.start(seq, &state).wait()?;
        self.with_lock(|inner| inner.wal.truncate_before(result.seq).map_err(Into::into))?;
        Ok(result)
    }

    // -- sessions --

    pub fn create_session(&self, session: Session) -> Result<(), StoreError> {
        self.with_lock(|inner| {
            if inner.state.sessions.contains_key(session.id.as_str()) {
                return Err(SupervisorError::Duplicate(session.id.to_string()).into());
            }
            Self::record(inner, Event::SessionCreated { session: Box::new(session) })
        })
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.with_lock(|inner| {
            inner
                .state
                .sessions
                .get(id.as_str())
                .cloned()
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()).into())
        })
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.with_lock(|inner| Ok(inner.state.sessions.values().cloned().collect()))
    }

    pub fn list_sessions_by_status(&self, status: SessionStatus) -> Result<Vec<Session>, StoreError> {
        self.with_lock(|inner| {
            Ok(inner
                .state
                .sessions
                .values()
                .filter(|s| s.status == status)
                .cloned()
                .collect())
        })
    }

    pub fn update_session(&self, id: &SessionId, patch: SessionPatch, now_ms: u64) -> Result<Session, StoreError> {
        self.with_lock(|inner| {
            let current_status;
            let current_error;
            {
                let current = inner
                    .state
                    .sessions
                    .get(id.as_str())
                    .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
                current_status = current.status;
                current_error = current.error.clone();
            }

            if current_status.is_terminal() {
                return Err(SupervisorError::InvalidState(format!(
                    "session {id} is in terminal status {current_status} and cannot be mutated further"
                ))
                .into());
            }

            if let Some(status) = patch.status {
                if !current_status.can_transition_to(status) {
                    return Err(SupervisorError::InvalidState(format!(
                        "{current_status} -> {status} is not a legal transition for session {id}"
                    ))
                    .into());
                }
                let error = patch.error.clone().unwrap_or(current_error);
                Self::record(inner, Event::SessionStatusChanged { id: id.clone(), status, at_ms: now_ms, error })?;
            }
            if let Some(n) = patch.iterations_completed {
                Self::record(inner, Event::SessionIterationsUpdated { id: id.clone(), iterations_completed: n })?;
            }
            if let Some(pid) = patch.pid {
                Self::record(inner, Event::SessionPidUpdated { id: id.clone(), pid })?;
            }
            if let Some(metadata) = patch.metadata {
                Self::record(inner, Event::SessionMetadataMerged { id: id.clone(), metadata })?;
            }
            if let Some(attempt) = patch.push_attempt {
                Self::record(inner, Event::SessionAttemptRecorded { id: id.clone(), attempt })?;
            }

            Ok(inner.state.sessions.get(id.as_str()).cloned().expect("session present"))
        })
    }

    pub fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        self.with_lock(|inner| {
            if !inner.state.sessions.contains_key(id.as_str()) {
                return Err(SupervisorError::NotFound(id.to_string()).into());
            }
            Self::record(inner, Event::SessionDeleted { id: id.clone() })
        })
    }

    // -- schedules --

    pub fn create_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.with_lock(|inner| {
            if inner.state.schedules.contains_key(schedule.id.as_str()) {
                return Err(SupervisorError::Duplicate(schedule.id.to_string()).into());
            }
            Self::record(inner, Event::ScheduleCreated { schedule: Box::new(schedule) })
        })
    }

    pub fn get_schedule(&self, id: &ScheduleId) -> Result<Schedule, StoreError> {
        self.with_lock(|inner| {
            inner
                .state
                .schedules
                .get(id.as_str())
                .cloned()
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()).into())
        })
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        self.with_lock(|inner| Ok(inner.state.schedules.values().cloned().collect()))
    }

    pub fn set_schedule_next_run(&self, id: &ScheduleId, next_run: Option<u64>) -> Result<(), StoreError> {
        self.with_lock(|inner| {
            if !inner.state.schedules.contains_key(id.as_str()) {
                return Err(SupervisorError::NotFound(id.to_string()).into());
            }
            Self::record(inner, Event::ScheduleNextRunComputed { id: id.clone(), next_run })
        })
    }

    pub fn set_schedule_enabled(&self, id: &ScheduleId, enabled: bool) -> Result<(), StoreError> {
        self.with_lock(|inner| {
            if !inner.state.schedules.contains_key(id.as_str()) {
                return Err(SupervisorError::NotFound(id.to_string()).into());
            }
            Self::record(inner, Event::ScheduleEnabledChanged { id: id.clone(), enabled })
        })
    }

    pub fn record_schedule_fired(
        &self,
        id: &ScheduleId,
        at_ms: u64,
        result: ScheduleResult,
        spawned_session_id: Option<SessionId>,
    ) -> Result<(), StoreError> {
        self.with_lock(|inner| {
            if !inner.state.schedules.contains_key(id.as_str()) {
                return Err(SupervisorError::NotFound(id.to_string()).into());
            }
            Self::record(inner, Event::ScheduleFired { id: id.clone(), at_ms, result, spawned_session_id })
        })
    }

    pub fn delete_schedule(&self, id: &ScheduleId) -> Result<(), StoreError> {
        self.with_lock(|inner| {
            if !inner.state.schedules.contains_key(id.as_str()) {
                return Err(SupervisorError::NotFound(id.to_string()).into());
            }
            Self::record(inner, Event::ScheduleDeleted { id: id.clone() })
        })
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
