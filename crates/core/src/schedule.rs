// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Schedule Engine domain types (§3, §4.H).

use crate::id::ScheduleId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Recurring,
}

/// Outcome of the most recent fire of a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A persisted cron-driven job definition (§4.H, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub natural_language: String,
    pub cron: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    pub command: String,
    pub timezone: String,
    pub enabled: bool,
    pub created_at: u64,
    pub last_run: Option<u64>,
    pub next_run: Option<u64>,
    pub run_count: u64,
    pub last_result: Option<ScheduleResult>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Schedule {
    pub fn new(
        id: ScheduleId,
        natural_language: impl Into<String>,
        cron: impl Into<String>,
        command: impl Into<String>,
        timezone: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            natural_language: natural_language.into(),
            cron: cron.into(),
            schedule_type: ScheduleType::Recurring,
            command: command.into(),
            timezone: timezone.into(),
            enabled: true,
            created_at: now_ms,
            last_run: None,
            next_run: None,
            run_count: 0,
            last_result: None,
            last_error: None,
        }
    }
}
