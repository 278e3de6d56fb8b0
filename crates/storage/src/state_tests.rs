// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use afk_core::{AttemptRecord, Schedule, ScheduleId, ScheduleResult, Session, SessionId, SessionPatch, SessionStatus};
use std::path::PathBuf;
use tempfile::tempdir;

fn session(id: &str) -> Session {
    Session::new(SessionId::new(id), "fix the bug", PathBuf::from("/tmp"), 1_767_225_600_000)
}

fn schedule(id: &str) -> Schedule {
    Schedule::new(ScheduleId::new(id), "every morning", "0 9 * * *", "afk run morning", "UTC", 1_767_225_600_000)
}

mod materialized_state {
    use super::*;

    #[test]
    fn session_created_is_idempotent() {
        let mut state = MaterializedState::default();
        let event = Event::SessionCreated { session: Box::new(session("s1")) };
        state.apply_event(&event);
        state.apply_event(&event);
        assert_eq!(state.sessions.len(), 1);
    }

    #[test]
    fn status_changed_sets_started_and_completed_timestamps() {
        let mut state = MaterializedState::default();
        state.apply_event(&Event::SessionCreated { session: Box::new(session("s1")) });

        state.apply_event(&Event::SessionStatusChanged {
            id: SessionId::new("s1"),
            status: SessionStatus::Running,
            at_ms: 100,
            error: None,
        });
        assert_eq!(state.sessions["s1"].started_at, Some(100));
        assert!(state.sessions["s1"].completed_at.is_none());

        state.apply_event(&Event::SessionStatusChanged {
            id: SessionId::new("s1"),
            status: SessionStatus::Completed,
            at_ms: 200,
            error: None,
        });
        assert_eq!(state.sessions["s1"].completed_at, Some(200));
    }

    #[test]
    fn completed_at_does_not_move_on_replay() {
        let mut state = MaterializedState::default();
        state.apply_event(&Event::SessionCreated { session: Box::new(session("s1")) });
        let done = Event::SessionStatusChanged {
            id: SessionId::new("s1"),
            status: SessionStatus::Completed,
            at_ms: 200,
            error: None,
        };
        state.apply_event(&done);
        state.apply_event(&done);
        assert_eq!(state.sessions["s1"].completed_at, Some(200));
    }

    #[test]
    fn iterations_updated_never_regresses() {
        let mut state = MaterializedState::default();
        state.apply_event(&Event::SessionCreated { session: Box::new(session("s1")) });
        state.apply_event(&Event::SessionIterationsUpdated { id: SessionId::new("s1"), iterations_completed: 5 });
        state.apply_event(&Event::SessionIterationsUpdated { id: SessionId::new("s1"), iterations_completed: 3 });
        assert_eq!(state.sessions["s1"].iterations_completed, 5);
    }

    #[test]
    fn metadata_merge_is_key_by_key() {
        let mut state = MaterializedState::default();
        state.apply_event(&Event::SessionCreated { session: Box::new(session("s1")) });
        state.apply_event(&Event::SessionMetadataMerged {
            id: SessionId::new("s1"),
            metadata: serde_json::json!({"a": 1}),
        });
        state.apply_event(&Event::SessionMetadataMerged {
            id: SessionId::new("s1"),
            metadata: serde_json::json!({"b": 2}),
        });
        let metadata = &state.sessions["s1"].metadata;
        assert_eq!(metadata["a"], 1);
        assert_eq!(metadata["b"], 2);
    }

    #[test]
    fn attempt_recorded_dedups_by_iteration_and_attempt() {
        let mut state = MaterializedState::default();
        state.apply_event(&Event::SessionCreated { session: Box::new(session("s1")) });
        let attempt = AttemptRecord {
            iteration: 1,
            attempt: 1,
            classification: "generic".into(),
            started_at: 0,
            ended_at: Some(10),
            exit_code: Some(0),
        };
        let event = Event::SessionAttemptRecorded { id: SessionId::new("s1"), attempt: attempt.clone() };
        state.apply_event(&event);
        state.apply_event(&event);
        assert_eq!(state.sessions["s1"].attempt_history.len(), 1);
    }

    #[test]
    fn session_deleted_removes_entry() {
        let mut state = MaterializedState::default();
        state.apply_event(&Event::SessionCreated { session: Box::new(session("s1")) });
        state.apply_event(&Event::SessionDeleted { id: SessionId::new("s1") });
        assert!(state.sessions.is_empty());
    }

    #[test]
    fn schedule_fired_run_count_guarded_by_timestamp() {
        let mut state = MaterializedState::default();
        state.apply_event(&Event::ScheduleCreated { schedule: Box::new(schedule("sch1")) });

        let result = ScheduleResult { success: true, output: None, error: None, duration_ms: 5 };
        let fired = Event::ScheduleFired {
            id: ScheduleId::new("sch1"),
            at_ms: 100,
            result: result.clone(),
            spawned_session_id: None,
        };
        state.apply_event(&fired);
        state.apply_event(&fired);
        assert_eq!(state.schedules["sch1"].run_count, 1);

        state.apply_event(&Event::ScheduleFired {
            id: ScheduleId::new("sch1"),
            at_ms: 200,
            result,
            spawned_session_id: None,
        });
        assert_eq!(state.schedules["sch1"].run_count, 2);
    }

    #[test]
    fn schedule_deleted_removes_entry() {
        let mut state = MaterializedState::default();
        state.apply_event(&Event::ScheduleCreated { schedule: Box::new(schedule("sch1")) });
        state.apply_event(&Event::ScheduleDeleted { id: ScheduleId::new("sch1") });
        assert!(state.schedules.is_empty());
    }
}

mod store {
    use super::*;

    fn open_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn create_and_get_round_trips() {
        let (store, _dir) = open_store();
        store.create_session(session("s1")).unwrap();
        let loaded = store.get_session(&SessionId::new("s1")).unwrap();
        assert_eq!(loaded.id, SessionId::new("s1"));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let (store, _dir) = open_store();
        store.create_session(session("s1")).unwrap();
        let err = store.create_session(session("s1")).unwrap_err();
        assert!(matches!(err, StoreError::Supervisor(SupervisorError::Duplicate(_))));
    }

    #[test]
    fn get_missing_session_not_found() {
        let (store, _dir) = open_store();
        let err = store.get_session(&SessionId::new("nope")).unwrap_err();
        assert!(matches!(err, StoreError::Supervisor(SupervisorError::NotFound(_))));
    }

    #[test]
    fn list_sessions_by_status_filters() {
        let (store, _dir) = open_store();
        store.create_session(session("s1")).unwrap();
        store.create_session(session("s2")).unwrap();
        store
            .update_session(&SessionId::new("s1"), SessionPatch::default().status(SessionStatus::Starting), 10)
            .unwrap();

        let starting = store.list_sessions_by_status(SessionStatus::Starting).unwrap();
        assert_eq!(starting.len(), 1);
        assert_eq!(starting[0].id, SessionId::new("s1"));

        let created = store.list_sessions_by_status(SessionStatus::Created).unwrap();
        assert_eq!(created.len(), 1);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let (store, _dir) = open_store();
        store.create_session(session("s1")).unwrap();
        let err = store
            .update_session(&SessionId::new("s1"), SessionPatch::default().status(SessionStatus::Running), 10)
            .unwrap_err();
        assert!(matches!(err, StoreError::Supervisor(SupervisorError::InvalidState(_))));
    }

    #[test]
    fn non_status_fields_are_also_rejected_once_terminal() {
        let (store, _dir) = open_store();
        let id = SessionId::new("s1");
        store.create_session(session("s1")).unwrap();
        store.update_session(&id, SessionPatch::default().status(SessionStatus::Starting), 10).unwrap();
        store.update_session(&id, SessionPatch::default().status(SessionStatus::Running), 20).unwrap();
        store.update_session(&id, SessionPatch::default().status(SessionStatus::Completed), 30).unwrap();

        let iterations_only = SessionPatch { iterations_completed: Some(1), ..Default::default() };
        let err = store.update_session(&id, iterations_only, 40).unwrap_err();
        assert!(matches!(err, StoreError::Supervisor(SupervisorError::InvalidState(_))));

        let attempt = AttemptRecord { iteration: 1, attempt: 1, classification: "success".to_string(), started_at: 30, ended_at: Some(31), exit_code: Some(0) };
        let attempt_only = SessionPatch { push_attempt: Some(attempt), ..Default::default() };
        let err = store.update_session(&id, attempt_only, 40).unwrap_err();
        assert!(matches!(err, StoreError::Supervisor(SupervisorError::InvalidState(_))));
    }

    #[test]
    fn legal_transition_updates_status() {
        let (store, _dir) = open_store();
        store.create_session(session("s1")).unwrap();
        let updated = store
            .update_session(&SessionId::new("s1"), SessionPatch::default().status(SessionStatus::Starting), 10)
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Starting);
    }

    #[test]
    fn delete_missing_session_not_found() {
        let (store, _dir) = open_store();
        let err = store.delete_session(&SessionId::new("nope")).unwrap_err();
        assert!(matches!(err, StoreError::Supervisor(SupervisorError::NotFound(_))));
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let (store, _dir) = open_store();
        store.create_session(session("s1")).unwrap();
        store.delete_session(&SessionId::new("s1")).unwrap();
        assert!(store.get_session(&SessionId::new("s1")).is_err());
    }

    #[test]
    fn schedule_crud_round_trips() {
        let (store, _dir) = open_store();
        store.create_schedule(schedule("sch1")).unwrap();

        store.set_schedule_next_run(&ScheduleId::new("sch1"), Some(500)).unwrap();
        assert_eq!(store.get_schedule(&ScheduleId::new("sch1")).unwrap().next_run, Some(500));

        store.set_schedule_enabled(&ScheduleId::new("sch1"), false).unwrap();
        assert!(!store.get_schedule(&ScheduleId::new("sch1")).unwrap().enabled);

        let result = ScheduleResult { success: true, output: None, error: None, duration_ms: 1 };
        store.record_schedule_fired(&ScheduleId::new("sch1"), 1000, result, None).unwrap();
        assert_eq!(store.get_schedule(&ScheduleId::new("sch1")).unwrap().run_count, 1);

        store.delete_schedule(&ScheduleId::new("sch1")).unwrap();
        assert!(store.get_schedule(&ScheduleId::new("sch1")).is_err());
        assert!(store.list_schedules().unwrap().is_empty());
    }

    #[test]
    fn checkpoint_truncates_wal_and_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SessionStore::open(dir.path()).unwrap();
            store.create_session(session("s1")).unwrap();
            store.create_session(session("s2")).unwrap();
            store.checkpoint().unwrap();
        }

        let reopened = SessionStore::open(dir.path()).unwrap();
        let sessions = reopened.list_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn uncheckpointed_events_replay_from_wal_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SessionStore::open(dir.path()).unwrap();
            store.create_session(session("s1")).unwrap();
            store.flush().unwrap();
        }

        let reopened = SessionStore::open(dir.path()).unwrap();
        let loaded = reopened.get_session(&SessionId::new("s1")).unwrap();
        assert_eq!(loaded.id, SessionId::new("s1"));
    }
}
