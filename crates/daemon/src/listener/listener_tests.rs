// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::Notify;

use super::*;
use crate::supervisor::{Config, Supervisor};

fn test_ctx(state: &TempDir) -> ListenCtx {
    std::env::set_var("AFK_MOCK_ORACLE", "1");
    let supervisor = Supervisor::start(blank_config(state)).expect("supervisor should start against a fresh temp dir");
    std::env::remove_var("AFK_MOCK_ORACLE");
    ListenCtx { supervisor: Arc::new(supervisor), start_time: Instant::now(), shutdown: Arc::new(Notify::new()) }
}

fn blank_config(state: &TempDir) -> Config {
    let root = state.path();
    Config {
        state_dir: root.to_path_buf(),
        socket_path: root.join("daemon.sock"),
        lock_path: root.join("daemon.pid"),
        version_path: root.join("daemon.version"),
        log_path: root.join("daemon.log"),
        store_dir: root.join("store"),
        logs_dir: root.join("logs"),
        progress_dir: root.join("progress"),
        audit_log_path: root.join("audit").join("cleanup-audit.log"),
        legacy_dir: root.join("legacy_registry"),
    }
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let state = tempfile::tempdir().unwrap();
    let ctx = test_ctx(&state);
    let response = handle_request(Request::Ping, &ctx).await;
    assert!(matches!(response, Response::Pong));
}

#[tokio::test]
async fn submit_then_get_round_trips_the_session() {
    let state = tempfile::tempdir().unwrap();
    let ctx = test_ctx(&state);

    let submitted =
        handle_request(Request::Submit { task: "write a changelog".to_string(), working_dir: state.path().to_path_buf(), iterations_planned: Some(1) }, &ctx)
            .await;
    let id = match submitted {
        Response::Session(session) => session.id.to_string(),
        other => panic!("expected Session, got {other:?}"),
    };

    let fetched = handle_request(Request::Get { id: id.clone() }, &ctx).await;
    match fetched {
        Response::Session(session) => assert_eq!(session.id.to_string(), id),
        other => panic!("expected Session, got {other:?}"),
    }
}

#[tokio::test]
async fn get_for_an_unknown_session_is_an_error_response() {
    let state = tempfile::tempdir().unwrap();
    let ctx = test_ctx(&state);
    let response = handle_request(Request::Get { id: "does-not-exist".to_string() }, &ctx).await;
    assert!(matches!(response, Response::Error { .. }));
}

#[tokio::test]
async fn stopping_an_unknown_session_is_a_no_op_ack() {
    let state = tempfile::tempdir().unwrap();
    let ctx = test_ctx(&state);
    let response = handle_request(Request::Stop { id: "never-submitted".to_string() }, &ctx).await;
    assert!(matches!(response, Response::Ack));
}

#[tokio::test]
async fn shutdown_notifies_the_shared_notify() {
    let state = tempfile::tempdir().unwrap();
    let ctx = test_ctx(&state);
    let response = handle_request(Request::Shutdown, &ctx).await;
    assert!(matches!(response, Response::Ack));
    ctx.shutdown.notify_one();
}

#[test]
fn tail_log_returns_empty_for_a_missing_file() {
    let state = tempfile::tempdir().unwrap();
    let lines = tail_log(&state.path().join("missing.log"), 10);
    assert!(lines.is_empty());
}

#[test]
fn tail_log_returns_only_the_last_n_lines() {
    let state = tempfile::tempdir().unwrap();
    let path = state.path().join("session.log");
    std::fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();
    let lines = tail_log(&path, 2);
    assert_eq!(lines, vec!["three".to_string(), "four".to_string()]);
}
