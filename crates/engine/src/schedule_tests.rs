// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use afk_adapters::{CronPlan, FakeOracleClient};
use afk_core::{FakeClock, ScheduleType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

struct RecordingSubmitter {
    calls: StdMutex<Vec<String>>,
    counter: AtomicU64,
}

impl RecordingSubmitter {
    fn new() -> Self {
        Self { calls: StdMutex::new(Vec::new()), counter: AtomicU64::new(0) }
    }
}

#[async_trait::async_trait]
impl JobSubmitter for RecordingSubmitter {
    async fn submit(&self, command: &str) -> Result<SessionId, SupervisorError> {
        self.calls.lock().unwrap().push(command.to_string());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(SessionId::new(format!("sess-{n}")))
    }
}

fn open_store() -> (Arc<SessionStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    (store, dir)
}

#[tokio::test]
async fn create_persists_the_oracle_translated_schedule() {
    let (store, _dir) = open_store();
    let oracle = Arc::new(FakeOracleClient::new());
    oracle.push_cron_reply(Ok(CronPlan {
        cron: "0 9 * * 1".to_string(),
        schedule_type: ScheduleType::Recurring,
        explanation: "every Monday at 9am".to_string(),
    }));
    let submitter = Arc::new(RecordingSubmitter::new());
    let engine = ScheduleEngine::new(store.clone(), oracle, submitter, FakeClock::new());

    let schedule = engine
        .create(
            "every monday at 9am",
            CreateOptions { command: "do the thing".to_string(), timezone: "UTC".to_string(), enabled: false },
        )
        .await
        .unwrap();

    assert_eq!(schedule.cron, "0 9 * * 1");
    assert_eq!(schedule.schedule_type, ScheduleType::Recurring);
    let listed = engine.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, schedule.id);
}

#[tokio::test]
async fn create_rejects_a_cron_expression_the_oracle_cannot_produce_validly() {
    let (store, _dir) = open_store();
    let oracle = Arc::new(FakeOracleClient::new());
    oracle.push_cron_reply(Ok(CronPlan {
        cron: "not a cron".to_string(),
        schedule_type: ScheduleType::Recurring,
        explanation: "nonsense".to_string(),
    }));
    let submitter = Arc::new(RecordingSubmitter::new());
    let engine = ScheduleEngine::new(store, oracle, submitter, FakeClock::new());

    let result = engine
        .create("whenever", CreateOptions { command: "noop".to_string(), timezone: "UTC".to_string(), enabled: false })
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn stop_disables_without_deleting() {
    let (store, _dir) = open_store();
    let oracle = Arc::new(FakeOracleClient::new());
    oracle.push_cron_reply(Ok(CronPlan {
        cron: "* * * * *".to_string(),
        schedule_type: ScheduleType::Recurring,
        explanation: "every minute".to_string(),
    }));
    let submitter = Arc::new(RecordingSubmitter::new());
    let engine = ScheduleEngine::new(store, oracle, submitter, FakeClock::new());

    let schedule = engine
        .create("every minute", CreateOptions { command: "noop".to_string(), timezone: "UTC".to_string(), enabled: true })
        .await
        .unwrap();

    engine.stop(&schedule.id).unwrap();
    let listed = engine.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].enabled);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (store, _dir) = open_store();
    let oracle = Arc::new(FakeOracleClient::new());
    let submitter = Arc::new(RecordingSubmitter::new());
    let engine = ScheduleEngine::new(store, oracle, submitter, FakeClock::new());

    let missing = ScheduleId::new("does-not-exist".to_string());
    engine.delete(&missing).unwrap();
    engine.delete(&missing).unwrap();
}

#[tokio::test]
async fn restore_reactivates_enabled_schedules_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.into_path();

    {
        let store = Arc::new(SessionStore::open(&path).unwrap());
        let oracle = Arc::new(FakeOracleClient::new());
        oracle.push_cron_reply(Ok(CronPlan {
            cron: "* * * * *".to_string(),
            schedule_type: ScheduleType::Recurring,
            explanation: "every minute".to_string(),
        }));
        let submitter = Arc::new(RecordingSubmitter::new());
        let engine = ScheduleEngine::new(store, oracle, submitter, FakeClock::new());
        engine
            .create("every minute", CreateOptions { command: "noop".to_string(), timezone: "UTC".to_string(), enabled: true })
            .await
            .unwrap();
    }

    let store = Arc::new(SessionStore::open(&path).unwrap());
    let oracle = Arc::new(FakeOracleClient::new());
    let submitter = Arc::new(RecordingSubmitter::new());
    let engine = ScheduleEngine::new(store, oracle, submitter, FakeClock::new());
    engine.restore().unwrap();

    let listed = engine.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].enabled);
    engine.shutdown();
}
