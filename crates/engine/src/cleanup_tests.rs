// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use afk_core::{FakeClock, Session, SessionId, SessionPatch};
use std::path::PathBuf;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

fn open() -> (Arc<SessionStore>, PathBuf, PathBuf, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    let log_dir = dir.path().join("logs");
    std::fs::create_dir_all(&log_dir).unwrap();
    let audit_log = dir.path().join("audit.jsonl");
    (store, log_dir, audit_log, dir)
}

fn make_completed_session(store: &SessionStore, n: usize, completed_at_ms: u64) -> SessionId {
    let id = SessionId::new(format!("sess-{n}"));
    let session = Session::new(id.clone(), "task", PathBuf::from("/tmp"), 0);
    store.create_session(session).unwrap();
    store.update_session(&id, SessionPatch::default().status(SessionStatus::Starting), 0).unwrap();
    store.update_session(&id, SessionPatch::default().status(SessionStatus::Running), 0).unwrap();
    store.update_session(&id, SessionPatch::default().status(SessionStatus::Completed), completed_at_ms).unwrap();
    id
}

#[test]
fn sweep_deletes_everything_past_preserve_recent_and_leaves_the_rest() {
    let (store, log_dir, audit_log, _dir) = open();
    let now = 100 * DAY_MS;
    let base = now - 20 * DAY_MS;
    for n in 0..15 {
        make_completed_session(&store, n, base + n as u64 * 1000);
    }

    let engine = CleanupEngine::new(store.clone(), log_dir, audit_log, RetentionPolicy::default(), FakeClock::at(now));

    let summary = engine.sweep(false);
    assert_eq!(summary.deleted, 5);
    assert_eq!(summary.preserved, 10);
    assert_eq!(summary.errors, 0);

    let remaining = store.list_sessions().unwrap();
    assert_eq!(remaining.len(), 10);

    let second = engine.sweep(false);
    assert_eq!(second.deleted, 0);
    assert_eq!(second.preserved, 10);
}

#[test]
fn sessions_younger_than_their_ttl_are_preserved_even_past_the_recent_count() {
    let (store, log_dir, audit_log, _dir) = open();
    let now = 100 * DAY_MS;
    // All 15 are fresh (1 hour old); none should be deleted despite
    // exceeding preserve_recent, since none has crossed the 7-day ttl.
    for n in 0..15 {
        make_completed_session(&store, n, now - 3_600_000 + n as u64 * 1000);
    }

    let engine = CleanupEngine::new(store.clone(), log_dir, audit_log, RetentionPolicy::default(), FakeClock::at(now));
    let summary = engine.sweep(false);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.preserved, 15);
}

#[test]
fn dry_run_reports_deletions_without_touching_the_store() {
    let (store, log_dir, audit_log, _dir) = open();
    let now = 100 * DAY_MS;
    let base = now - 20 * DAY_MS;
    for n in 0..15 {
        make_completed_session(&store, n, base + n as u64 * 1000);
    }

    let engine = CleanupEngine::new(store.clone(), log_dir, audit_log.clone(), RetentionPolicy::default(), FakeClock::at(now));
    let summary = engine.sweep(true);
    assert_eq!(summary.deleted, 5);
    assert_eq!(store.list_sessions().unwrap().len(), 15);
    assert!(audit_log.exists());

    let contents = std::fs::read_to_string(&audit_log).unwrap();
    assert_eq!(contents.lines().count(), 1);
    assert!(contents.contains("\"mode\":\"dry-run\""));
}

#[test]
fn orphaned_logs_without_a_matching_session_are_removed() {
    let (store, log_dir, audit_log, _dir) = open();
    std::fs::write(log_dir.join("ghost-session.log"), b"stale output").unwrap();

    let engine = CleanupEngine::new(store, log_dir.clone(), audit_log, RetentionPolicy::default(), FakeClock::new());
    let summary = engine.sweep(false);

    assert_eq!(summary.deleted, 1);
    assert!(!log_dir.join("ghost-session.log").exists());
}

#[test]
fn dry_run_legacy_dir_sweep_leaves_entries_on_disk() {
    let (store, log_dir, audit_log, dir) = open();
    let legacy_dir = dir.path().join("legacy_registry");
    std::fs::create_dir_all(&legacy_dir).unwrap();
    std::fs::write(legacy_dir.join("old-job.json"), b"{}").unwrap();

    let policy = RetentionPolicy { legacy_max_age: Duration::from_millis(0), ..RetentionPolicy::default() };
    let engine = CleanupEngine::new(store, log_dir, audit_log, policy, FakeClock::new()).with_legacy_dir(legacy_dir.clone());

    let summary = engine.sweep(true);
    assert_eq!(summary.deleted, 1);
    assert!(legacy_dir.join("old-job.json").exists(), "dry run must not remove legacy entries");

    let real = engine.sweep(false);
    assert_eq!(real.deleted, 1);
    assert!(!legacy_dir.join("old-job.json").exists());
}

#[test]
fn running_sessions_are_never_swept_regardless_of_age() {
    let (store, log_dir, audit_log, _dir) = open();
    let id = SessionId::new("sess-running".to_string());
    let session = Session::new(id.clone(), "task", PathBuf::from("/tmp"), 0);
    store.create_session(session).unwrap();
    store.update_session(&id, SessionPatch::default().status(SessionStatus::Starting), 0).unwrap();
    store.update_session(&id, SessionPatch::default().status(SessionStatus::Running), 0).unwrap();

    let engine = CleanupEngine::new(store.clone(), log_dir, audit_log, RetentionPolicy::default(), FakeClock::at(1_000 * DAY_MS));
    let summary = engine.sweep(false);

    assert_eq!(summary.deleted, 0);
    assert_eq!(store.list_sessions().unwrap().len(), 1);
}
