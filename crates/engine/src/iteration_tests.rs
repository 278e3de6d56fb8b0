// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use afk_adapters::{FakeOracleClient, FakeProbe, FakeWorkerSpawner, ScriptedSpawn};
use afk_core::{FakeClock, Session, SessionStatus};
use std::time::Duration as StdDuration;

fn open_engine() -> (IterationEngine<FakeClock, FakeProbe>, Arc<SessionStore>, Arc<FakeWorkerSpawner>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    let clock = FakeClock::new();
    let progress = Arc::new(ProgressTracker::new(dir.path().join("progress"), clock.clone()));
    let logs = Arc::new(LogManager::new(dir.path().join("logs"), clock.clone()));
    let monitor = Arc::new(ProcessMonitor::new(FakeProbe::new(), "afk-worker"));
    let breaker = Arc::new(CircuitBreaker::new(clock.clone()));
    let spawner = Arc::new(FakeWorkerSpawner::new());
    let oracle = Arc::new(FakeOracleClient::new());

    let config = IterationEngineConfig {
        worker: WorkerCommand { program: "afk-worker".to_string(), args: Vec::new() },
        max_attempts_per_iteration: 3,
        iteration_timeout: StdDuration::from_secs(5),
        default_usage_limit_reset: StdDuration::from_secs(2),
    };

    let engine = IterationEngine::new(
        Arc::clone(&store),
        progress,
        logs,
        monitor,
        breaker,
        spawner.clone(),
        oracle,
        clock,
        config,
    );
    (engine, store, spawner, dir)
}

fn new_session(store: &SessionStore, working_dir: &Path, iterations_planned: u32) -> SessionId {
    let id = SessionId::new("sess-1".to_string());
    let mut session = Session::new(id.clone(), "fix the thing", working_dir.to_path_buf(), 0);
    session.iterations_planned = iterations_planned;
    store.create_session(session).unwrap();
    id
}

#[tokio::test]
async fn happy_path_completes_every_planned_iteration() {
    let (engine, store, spawner, dir) = open_engine();
    let id = new_session(&store, dir.path(), 2);
    spawner.push_script(ScriptedSpawn { stdout: vec!["working".to_string()], stderr: vec![], exit_code: 0, pid: 100 });
    spawner.push_script(ScriptedSpawn { stdout: vec!["working".to_string()], stderr: vec![], exit_code: 0, pid: 101 });

    engine.run(id.clone()).await.unwrap();

    let session = store.get_session(&id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.iterations_completed, 2);
    assert_eq!(session.attempt_history.len(), 2);
}

#[tokio::test]
async fn usage_limit_message_is_retried_after_the_reset_wait() {
    let (engine, store, spawner, dir) = open_engine();
    let id = new_session(&store, dir.path(), 1);
    spawner.push_script(ScriptedSpawn {
        stdout: vec![],
        stderr: vec!["usage limit reached, reset in 2 seconds".to_string()],
        exit_code: 1,
        pid: 200,
    });
    spawner.push_script(ScriptedSpawn { stdout: vec!["done".to_string()], stderr: vec![], exit_code: 0, pid: 201 });

    engine.run(id.clone()).await.unwrap();

    let session = store.get_session(&id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.attempt_history.len(), 2);
    assert_eq!(session.attempt_history[0].classification, "usage_limit");
    assert_eq!(session.attempt_history[1].classification, "success");
}

#[tokio::test]
async fn a_non_retryable_auth_failure_fails_the_session_without_exhausting_the_attempt_budget() {
    let (engine, store, spawner, dir) = open_engine();
    let id = new_session(&store, dir.path(), 1);
    spawner.push_script(ScriptedSpawn {
        stdout: vec![],
        stderr: vec!["authentication failed: invalid api key".to_string()],
        exit_code: 1,
        pid: 300,
    });

    engine.run(id.clone()).await.unwrap();

    let session = store.get_session(&id).unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.attempt_history.len(), 1);
    assert!(session.error.is_some());
}

#[tokio::test]
async fn a_missing_worker_executable_fails_the_session_without_retrying() {
    let (engine, store, spawner, dir) = open_engine();
    let id = new_session(&store, dir.path(), 1);
    spawner.push_error(afk_adapters::SpawnError::NoSuchExecutable("afk-worker".to_string()));

    engine.run(id.clone()).await.unwrap();

    let session = store.get_session(&id).unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.attempt_history.len(), 1, "a missing executable must not be retried");
    assert!(session.error.as_deref().unwrap_or_default().contains("afk-worker"));
}

#[tokio::test]
async fn cancelling_mid_iteration_stops_the_session_within_the_grace_period() {
    let (engine, store, spawner, dir) = open_engine();
    let id = new_session(&store, dir.path(), 3);
    // Only the first iteration gets a script; the second iteration's spawn
    // fails and backs off for 1s, giving the cancellation flag a window to
    // land while the session is still "mid-iteration".
    spawner.push_script(ScriptedSpawn { stdout: vec![], stderr: vec![], exit_code: 0, pid: 400 });

    let run_id = id.clone();
    let engine = Arc::new(engine);
    let running = Arc::clone(&engine);
    let handle = tokio::spawn(async move { running.run(run_id).await });

    tokio::time::sleep(StdDuration::from_millis(100)).await;
    engine.cancel(&id);

    tokio::time::timeout(StdDuration::from_secs(5), handle).await.unwrap().unwrap().unwrap();

    let session = store.get_session(&id).unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.iterations_completed, 1);
}

#[tokio::test]
async fn recover_resumes_from_the_next_incomplete_iteration_after_a_restart() {
    let (engine, store, _spawner, dir) = open_engine();
    let id = new_session(&store, dir.path(), 3);
    store.update_session(&id, SessionPatch::default().status(SessionStatus::Starting), 0).unwrap();
    store
        .update_session(
            &id,
            SessionPatch { status: Some(SessionStatus::Running), iterations_completed: Some(1), pid: Some(Some(9999)), ..Default::default() },
            0,
        )
        .unwrap();

    engine.monitor.probe().mark_alive(9999);
    let resumed = engine.recover().unwrap();
    assert_eq!(resumed, vec![id.clone()]);

    let session = store.get_session(&id).unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    assert_eq!(session.iterations_completed, 1);
}

#[tokio::test]
async fn recover_fails_sessions_whose_worker_left_no_trace() {
    let (engine, store, _spawner, dir) = open_engine();
    let id = new_session(&store, dir.path(), 3);
    store.update_session(&id, SessionPatch::default().status(SessionStatus::Starting), 0).unwrap();
    store
        .update_session(
            &id,
            SessionPatch { status: Some(SessionStatus::Running), iterations_completed: Some(1), pid: Some(Some(12345)), ..Default::default() },
            0,
        )
        .unwrap();

    let resumed = engine.recover().unwrap();
    assert!(resumed.is_empty());

    let session = store.get_session(&id).unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.error.as_deref(), Some("supervisor_restart"));
}

#[test]
fn heuristic_plans_short_fix_tasks_with_few_iterations() {
    assert_eq!(heuristic_iterations("fix bug"), 1);
}

#[test]
fn heuristic_plans_large_migrations_with_many_iterations() {
    assert_eq!(heuristic_iterations("migrate the entire billing system to the new architecture end to end"), 10);
}

#[test]
fn heuristic_bumps_up_long_winded_complex_tasks() {
    let task = "refactor the entire billing and invoicing subsystem across every service boundary and downstream consumer system end to end";
    assert_eq!(heuristic_iterations(task), 13);
}

#[test]
fn usage_limit_detection_ignores_unrelated_stderr() {
    assert!(usage_limit_reset("just a normal log line", StdDuration::from_secs(60)).is_none());
}

#[test]
fn usage_limit_reset_parses_minutes() {
    let reset = usage_limit_reset("quota exceeded, reset in 5 minutes", StdDuration::from_secs(1)).unwrap();
    assert_eq!(reset, StdDuration::from_secs(300));
}

#[test]
fn usage_limit_reset_falls_back_to_the_default_when_unparseable() {
    let reset = usage_limit_reset("rate limit hit, try again soon", StdDuration::from_secs(900)).unwrap();
    assert_eq!(reset, StdDuration::from_secs(900));
}

#[test]
fn backoff_grows_exponentially_and_caps_at_ten_seconds() {
    assert_eq!(backoff_for(1), StdDuration::from_secs(1));
    assert_eq!(backoff_for(2), StdDuration::from_secs(2));
    assert_eq!(backoff_for(3), StdDuration::from_secs(4));
    assert_eq!(backoff_for(5), StdDuration::from_secs(10));
}
