// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Iteration journal entry types persisted by the Progress Tracker (§3, §4.B).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Running,
    Completed,
    Failed,
}

/// One recorded worker action within an iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub result: String,
    pub success: bool,
}

/// One iteration's worth of journal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationEntry {
    pub session_id: String,
    pub number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    pub start: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
    pub status: IterationStatus,
    pub duration_s: u64,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
    #[serde(default)]
    pub achievements: Vec<String>,
    #[serde(default)]
    pub challenges: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Set on placeholder entries synthesized by `updateProgress`'s gap
    /// auto-heal (§4.B).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_created_reason: Option<String>,
}

impl IterationEntry {
    pub fn new_running(session_id: impl Into<String>, number: u32, goal: Option<String>, start: u64) -> Self {
        Self {
            session_id: session_id.into(),
            number,
            goal,
            start,
            end: None,
            status: IterationStatus::Running,
            duration_s: 0,
            actions: Vec::new(),
            achievements: Vec::new(),
            challenges: Vec::new(),
            next_steps: Vec::new(),
            summary: None,
            auto_created_reason: None,
        }
    }

    pub fn placeholder(session_id: impl Into<String>, number: u32, now: u64) -> Self {
        let mut entry = Self::new_running(session_id, number, None, now);
        entry.status = IterationStatus::Completed;
        entry.end = Some(now);
        entry.auto_created_reason = Some("auto-created".to_string());
        entry
    }
}
