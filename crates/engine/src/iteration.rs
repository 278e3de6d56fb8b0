// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Iteration Engine (§4.F): drives one session through its planned
//! iterations, spawning a worker child per attempt, streaming its output,
//! detecting usage-limit refusals, retrying with backoff, and persisting
//! every state transition through the Session Store and Progress Tracker.

use crate::circuit_breaker::{Category, CircuitBreaker};
use afk_adapters::{
    LogManager, NixProbe, OracleClient, ProcessMonitor, ProcessProbe, SpawnError, SpawnSpec,
    WorkerSpawner,
};
use afk_core::{
    classify_worker_exit, AttemptRecord, Clock, SessionId, SessionPatch, SessionStatus,
    SupervisorError, SystemClock,
};
use afk_storage::{ProgressTracker, SessionStore, StoreError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const USAGE_LIMIT_MARKERS: &[&str] =
    &["usage limit", "rate limit", "quota exceeded", "too many requests", "limit exceeded"];

fn usage_limit_reset(line: &str, default_reset: Duration) -> Option<Duration> {
    let lower = line.to_ascii_lowercase();
    if !USAGE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        return None;
    }
    Some(parse_reset_duration(&lower).unwrap_or(default_reset))
}

/// Parses `"reset in N (seconds|minutes|hours)"`. `None` if the message
/// doesn't carry a parseable reset time; the caller falls back to a
/// conservative default rather than treating this as a parse error.
fn parse_reset_duration(lower: &str) -> Option<Duration> {
    let after = lower.find("reset in")? + "reset in".len();
    let rest = lower[after..].trim_start();
    let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
    if digits_end == 0 {
        return None;
    }
    let n: u64 = rest[..digits_end].parse().ok()?;
    let unit = rest[digits_end..].trim_start();
    let secs = if unit.starts_with("second") {
        n
    } else if unit.starts_with("minute") {
        n * 60
    } else if unit.starts_with("hour") {
        n * 3600
    } else {
        return None;
    };
    Some(Duration::from_secs(secs))
}

/// Heuristic fallback plan when the Oracle Gateway is unavailable or
/// returns a low-confidence complexity estimate (§4.F step 1).
fn heuristic_iterations(task: &str) -> u32 {
    let lower = task.to_ascii_lowercase();
    let mut n: i32 = if ["fix", "update", "rename"].iter().any(|k| lower.contains(k)) {
        2
    } else if ["refactor", "migrate", "architecture", "system"].iter().any(|k| lower.contains(k)) {
        10
    } else {
        5
    };
    let words = task.split_whitespace().count();
    if words < 5 {
        n -= 2;
    } else if words > 15 {
        n += 3;
    }
    n.clamp(1, 20) as u32
}

fn backoff_for(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    Duration::from_secs((1u64 << exponent).min(10))
}

/// What a worker child was run with, minus the things the engine fills in
/// per attempt (session id, working directory).
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

pub struct IterationEngineConfig {
    pub worker: WorkerCommand,
    /// Per-iteration attempt budget before the session transitions to
    /// `failed` (§4.F step f, default 3).
    pub max_attempts_per_iteration: u32,
    /// Wall-clock budget per attempt before a forced kill (§4.F step d,
    /// default 30s).
    pub iteration_timeout: Duration,
    /// Reset wait used when a usage-limit message carries no parseable
    /// duration (§4.F step c, default 15 minutes).
    pub default_usage_limit_reset: Duration,
}

impl Default for IterationEngineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerCommand { program: "worker".to_string(), args: Vec::new() },
            max_attempts_per_iteration: 3,
            iteration_timeout: Duration::from_secs(30),
            default_usage_limit_reset: Duration::from_secs(15 * 60),
        }
    }
}

enum AttemptOutcome {
    Success,
    Cancelled,
    UsageLimit(Duration),
    Retryable(SupervisorError),
    Fatal(SupervisorError),
}

enum IterationOutcome {
    Completed,
    Cancelled,
    Failed(SupervisorError),
}

/// Drives sessions through their planned iterations (§4.F, the hardest
/// subsystem). Holds an `Arc<dyn WorkerSpawner>`/`Arc<dyn OracleClient>`
/// pair rather than extra type parameters, since `#[async_trait]` traits
/// are object-safe and a session's spawner/oracle never change at runtime.
pub struct IterationEngine<C: Clock = SystemClock, P: ProcessProbe = NixProbe> {
    store: Arc<SessionStore>,
    progress: Arc<ProgressTracker<C>>,
    logs: Arc<LogManager<C>>,
    monitor: Arc<ProcessMonitor<P>>,
    breaker: Arc<CircuitBreaker<C>>,
    spawner: Arc<dyn WorkerSpawner>,
    oracle: Arc<dyn OracleClient>,
    clock: C,
    config: IterationEngineConfig,
    cancelled: Mutex<HashSet<String>>,
}

impl<C: Clock, P: ProcessProbe> IterationEngine<C, P> {
    pub fn new(
        store: Arc<SessionStore>,
        progress: Arc<ProgressTracker<C>>,
        logs: Arc<LogManager<C>>,
        monitor: Arc<ProcessMonitor<P>>,
        breaker: Arc<CircuitBreaker<C>>,
        spawner: Arc<dyn WorkerSpawner>,
        oracle: Arc<dyn OracleClient>,
        clock: C,
        config: IterationEngineConfig,
    ) -> Self {
        Self { store, progress, logs, monitor, breaker, spawner, oracle, clock, config, cancelled: Mutex::new(HashSet::new()) }
    }

    /// Trips a session's cancellation flag. The running iteration reacts
    /// at its next suspension point and force-kills its child via the
    /// Process Monitor's grace-period kill.
    pub fn cancel(&self, session_id: &SessionId) {
        self.cancelled.lock().insert(session_id.to_string());
    }

    fn is_cancelled(&self, session_id: &SessionId) -> bool {
        self.cancelled.lock().contains(session_id.as_str())
    }

    fn clear_cancellation(&self, session_id: &SessionId) {
        self.cancelled.lock().remove(session_id.as_str());
    }

    /// Consults the Oracle Gateway for a plan, falling back to a keyword
    /// heuristic when it is unavailable or returns low confidence.
    pub async fn plan(&self, task: &str) -> (u32, String) {
        match self.oracle.analyze_complexity(task).await {
            Ok(plan) if plan.confidence >= 0.7 => (plan.iterations.clamp(1, 20), plan.model),
            _ => (heuristic_iterations(task), "default".to_string()),
        }
    }

    /// On supervisor restart, scans non-terminal sessions: a session whose
    /// recorded PID is dead and has no worker fingerprint left in the
    /// process table is marked `failed`; everything else is reattached to
    /// the monitor so a subsequent `run` resumes from its next iteration.
    pub fn recover(&self) -> Result<Vec<SessionId>, StoreError> {
        let mut resumed = Vec::new();
        let mut candidates = self.store.list_sessions_by_status(SessionStatus::Running)?;
        candidates.extend(self.store.list_sessions_by_status(SessionStatus::Starting)?);

        for session in candidates {
            let pid_alive = session.pid.map(|pid| self.monitor.is_pid_alive(pid)).unwrap_or(false);
            let validation = self.monitor.validate(&session.id, false);
            if !pid_alive && !validation.worker_process_present_by_fingerprint {
                warn!(session_id = %session.id, "no live worker found on restart, marking failed");
                self.store.update_session(
                    &session.id,
                    SessionPatch::default().status(SessionStatus::Failed).error("supervisor_restart"),
                    self.clock.now_ms(),
                )?;
                self.progress.complete_session(session.id.as_str(), None, "failed");
            } else {
                if let Some(pid) = session.pid {
                    self.monitor.register(session.id.clone(), pid, Vec::new(), self.clock.now_ms());
                }
                resumed.push(session.id);
            }
        }
        Ok(resumed)
    }

    /// Drives `session_id` to a terminal state. Idempotent on resume: a
    /// session already `running` picks up from `iterations_completed + 1`.
    pub async fn run(&self, session_id: SessionId) -> Result<(), StoreError> {
        let mut session = self.store.get_session(&session_id)?;
        let now = self.clock.now_ms();

        if session.status == SessionStatus::Created {
            self.store.update_session(&session_id, SessionPatch::default().status(SessionStatus::Starting), now)?;
            self.progress.init_journal(session_id.as_str(), session.iterations_planned);
            if let Err(e) = self.logs.open_stream(session_id.as_str()) {
                warn!(session_id = %session_id, error = %e, "failed to open log stream");
            }
            session = self.store.update_session(
                &session_id,
                SessionPatch::default().status(SessionStatus::Running).iterations_completed(session.iterations_completed),
                self.clock.now_ms(),
            )?;
        }

        let start_at = (session.iterations_completed + 1).max(1);
        for n in start_at..=session.iterations_planned {
            if self.is_cancelled(&session_id) {
                return self.finish(&session_id, SessionStatus::Stopped, None).await;
            }

            if self.breaker.allow(Category::Worker).is_err() {
                info!(session_id = %session_id, "worker circuit open, deferring iteration");
                return Err(SupervisorError::CircuitOpen("worker".to_string()).into());
            }

            self.progress.start_iteration(session_id.as_str(), n, None);

            match self.drive_iteration(&session_id, &session.working_dir, n).await {
                IterationOutcome::Completed => {
                    self.breaker.record_success(Category::Worker);
                    self.progress.complete_iteration(session_id.as_str(), None, Vec::new(), Vec::new(), Vec::new());
                    self.store.update_session(&session_id, SessionPatch::default().iterations_completed(n), self.clock.now_ms())?;
                }
                IterationOutcome::Cancelled => {
                    self.breaker.record_success(Category::Worker);
                    return self.finish(&session_id, SessionStatus::Stopped, None).await;
                }
                IterationOutcome::Failed(err) => {
                    self.breaker.record_failure(Category::Worker);
                    return self.finish(&session_id, SessionStatus::Failed, Some(err.to_string())).await;
                }
            }
        }

        self.finish(&session_id, SessionStatus::Completed, None).await
    }

    async fn finish(&self, session_id: &SessionId, status: SessionStatus, error: Option<String>) -> Result<(), StoreError> {
        let mut patch = SessionPatch::default().status(status);
        if let Some(message) = error {
            patch = patch.error(message);
        }
        self.store.update_session(session_id, patch, self.clock.now_ms())?;
        self.progress.complete_session(session_id.as_str(), None, &status.to_string());
        self.monitor.unregister(session_id);
        self.clear_cancellation(session_id);
        Ok(())
    }

    /// Attempt loop for one iteration number: spawn, stream, classify,
    /// retry with backoff or wait out a usage limit, up to the
    /// per-iteration attempt budget.
    async fn drive_iteration(&self, session_id: &SessionId, working_dir: &Path, iteration: u32) -> IterationOutcome {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.is_cancelled(session_id) {
                return IterationOutcome::Cancelled;
            }

            let (outcome, record) = self.run_attempt(session_id, working_dir, iteration, attempt).await;
            let _ = self.store.update_session(session_id, SessionPatch { push_attempt: Some(record), ..Default::default() }, self.clock.now_ms());

            match outcome {
                AttemptOutcome::Success => return IterationOutcome::Completed,
                AttemptOutcome::Cancelled => return IterationOutcome::Cancelled,
                AttemptOutcome::UsageLimit(reset) => {
                    self.progress.log_action(session_id.as_str(), "usage_limit", "sleeping until reset", &format!("{reset:?}"), true);
                    if self.sleep_cancellable(reset, session_id).await {
                        return IterationOutcome::Cancelled;
                    }
                }
                AttemptOutcome::Retryable(err) => {
                    self.progress.log_action(session_id.as_str(), "worker_exit", "iteration attempt failed", &err.to_string(), false);
                    if attempt >= self.config.max_attempts_per_iteration {
                        return IterationOutcome::Failed(err);
                    }
                    if self.sleep_cancellable(backoff_for(attempt), session_id).await {
                        return IterationOutcome::Cancelled;
                    }
                }
                AttemptOutcome::Fatal(err) => {
                    self.progress.log_action(session_id.as_str(), "worker_exit", "iteration attempt failed", &err.to_string(), false);
                    return IterationOutcome::Failed(err);
                }
            }
        }
    }

    async fn sleep_cancellable(&self, duration: Duration, session_id: &SessionId) -> bool {
        const POLL: Duration = Duration::from_millis(200);
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.is_cancelled(session_id) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(POLL.min(deadline - now)).await;
        }
    }

    async fn run_attempt(&self, session_id: &SessionId, working_dir: &Path, iteration: u32, attempt: u32) -> (AttemptOutcome, AttemptRecord) {
        let started_at = self.clock.now_ms();
        let finalize = |classification: &str, ended_at: Option<u64>, exit_code: Option<i32>| AttemptRecord {
            iteration,
            attempt,
            classification: classification.to_string(),
            started_at,
            ended_at,
            exit_code,
        };

        if self.breaker.allow(Category::ProcessSpawn).is_err() {
            let err = SupervisorError::CircuitOpen("process_spawn".to_string());
            return (AttemptOutcome::Retryable(err), finalize("circuit_open", Some(self.clock.now_ms()), None));
        }

        let spec = SpawnSpec {
            session_id: session_id.clone(),
            program: self.config.worker.program.clone(),
            args: self.config.worker.args.clone(),
            working_dir: working_dir.to_path_buf(),
            env: Vec::new(),
        };

        let mut child = match self.spawner.spawn(spec).await {
            Ok(child) => child,
            Err(e) => {
                self.breaker.record_failure(Category::ProcessSpawn);
                return match e {
                    SpawnError::NoSuchExecutable(program) => (
                        AttemptOutcome::Fatal(SupervisorError::NoSuchExecutable(program)),
                        finalize("spawn_failed", Some(self.clock.now_ms()), None),
                    ),
                    SpawnError::Io(io) => (
                        AttemptOutcome::Retryable(SupervisorError::WorkerSpawnFailed(io.to_string())),
                        finalize("spawn_failed", Some(self.clock.now_ms()), None),
                    ),
                };
            }
        };
        self.breaker.record_success(Category::ProcessSpawn);
        self.monitor.register(session_id.clone(), child.pid, Vec::new(), self.clock.now_ms());

        let mut stderr_tail = String::new();
        let logs = Arc::clone(&self.logs);
        let session_key = session_id.as_str().to_string();

        enum Loop {
            Exited(std::io::Result<std::process::ExitStatus>),
            UsageLimit(Duration),
            Cancelled,
        }

        let loop_result = tokio::time::timeout(self.config.iteration_timeout, async {
            let mut stdout_done = false;
            let mut stderr_done = false;
            loop {
                if self.is_cancelled(session_id) {
                    return Loop::Cancelled;
                }
                let (stdout_lines, stderr_lines, child_proc) = child.split_mut();
                tokio::select! {
                    line = stdout_lines.recv(), if !stdout_done => {
                        match line {
                            Some(l) => logs.append(&session_key, &l),
                            None => stdout_done = true,
                        }
                    }
                    line = stderr_lines.recv(), if !stderr_done => {
                        match line {
                            Some(l) => {
                                logs.append(&session_key, &l);
                                stderr_tail.push_str(&l);
                                stderr_tail.push('\n');
                                if let Some(reset) = usage_limit_reset(&l, self.config.default_usage_limit_reset) {
                                    return Loop::UsageLimit(reset);
                                }
                            }
                            None => stderr_done = true,
                        }
                    }
                    status = child_proc.wait() => {
                        return Loop::Exited(status);
                    }
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
        })
        .await;

        let ended_at = self.clock.now_ms();
        match loop_result {
            Err(_elapsed) => {
                self.monitor.stop_session(session_id).await;
                child.kill().await;
                (AttemptOutcome::Retryable(SupervisorError::Timeout(self.config.iteration_timeout)), finalize("timeout", Some(ended_at), None))
            }
            Ok(Loop::Cancelled) => {
                self.monitor.stop_session(session_id).await;
                child.kill().await;
                (AttemptOutcome::Cancelled, finalize("cancelled", Some(ended_at), None))
            }
            Ok(Loop::UsageLimit(reset)) => {
                child.kill().await;
                self.monitor.unregister(session_id);
                (AttemptOutcome::UsageLimit(reset), finalize("usage_limit", Some(ended_at), None))
            }
            Ok(Loop::Exited(status)) => {
                self.monitor.unregister(session_id);
                let exit_code = status.ok().and_then(|s| s.code());
                if exit_code == Some(0) {
                    (AttemptOutcome::Success, finalize("success", Some(ended_at), exit_code))
                } else {
                    let kind = classify_worker_exit(exit_code, &stderr_tail);
                    let err = SupervisorError::WorkerExitError { exit_code, kind, message: stderr_tail.clone() };
                    let classification = format!("{kind:?}").to_lowercase();
                    if err.retryable() {
                        (AttemptOutcome::Retryable(err), finalize(&classification, Some(ended_at), exit_code))
                    } else {
                        (AttemptOutcome::Fatal(err), finalize(&classification, Some(ended_at), exit_code))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "iteration_tests.rs"]
mod tests;
