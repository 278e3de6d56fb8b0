// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Events recorded in the Session Store's write-ahead log (§4.A).
//!
//! `MaterializedState::apply_event` (in `afk-storage`) must treat every
//! variant idempotently: applying the same event twice must produce the same
//! state as applying it once, since a crash can replay an event that was
//! already visible in memory before the crash.

use crate::id::{ScheduleId, SessionId};
use crate::schedule::ScheduleResult;
use crate::session::{AttemptRecord, Session, SessionStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    SessionCreated {
        session: Box<Session>,
    },
    SessionStatusChanged {
        id: SessionId,
        status: SessionStatus,
        at_ms: u64,
        error: Option<String>,
    },
    SessionIterationsUpdated {
        id: SessionId,
        iterations_completed: u32,
    },
    SessionPidUpdated {
        id: SessionId,
        pid: Option<u32>,
    },
    SessionMetadataMerged {
        id: SessionId,
        metadata: serde_json::Value,
    },
    SessionAttemptRecorded {
        id: SessionId,
        attempt: AttemptRecord,
    },
    SessionDeleted {
        id: SessionId,
    },
    ScheduleCreated {
        schedule: Box<crate::schedule::Schedule>,
    },
    ScheduleNextRunComputed {
        id: ScheduleId,
        next_run: Option<u64>,
    },
    ScheduleEnabledChanged {
        id: ScheduleId,
        enabled: bool,
    },
    ScheduleFired {
        id: ScheduleId,
        at_ms: u64,
        result: ScheduleResult,
        spawned_session_id: Option<SessionId>,
    },
    ScheduleDeleted {
        id: ScheduleId,
    },
}
