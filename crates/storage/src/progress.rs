// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Progress Tracker (§4.B): one crash-safe JSON journal per session,
//! written through a backup-copy / tmp-write / rename / read-back-verify
//! protocol. A save that exhausts its retries is logged and dropped —
//! session survival takes priority over journal completeness.

use afk_core::{ActionEntry, Clock, IterationEntry, IterationStatus, SystemClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("read-back verification failed")]
    VerifyFailed,
    #[error("journal failed validation: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub timestamp: u64,
    pub text: String,
    pub impact: String,
}

/// On-disk progress journal for one session (§3, §4.B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressJournal {
    pub session_id: String,
    pub start_time: u64,
    pub total_iterations: u32,
    pub current_iteration: u32,
    pub status: String,
    #[serde(default)]
    pub iterations: Vec<IterationEntry>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub overall_summary: Option<String>,
    pub last_update: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub version: u32,
    #[serde(default)]
    pub error: Option<String>,
}

const JOURNAL_VERSION: u32 = 1;

impl ProgressJournal {
    fn fresh(session_id: &str, total_iterations: u32, now: u64) -> Self {
        Self {
            session_id: session_id.to_string(),
            start_time: now,
            total_iterations,
            current_iteration: 0,
            status: "starting".to_string(),
            iterations: Vec::new(),
            milestones: Vec::new(),
            overall_summary: None,
            last_update: now,
            metadata: serde_json::Value::Null,
            version: JOURNAL_VERSION,
            error: None,
        }
    }

    fn validate(&self) -> Result<(), ProgressError> {
        if self.session_id.is_empty() {
            return Err(ProgressError::Invalid("session_id is empty".into()));
        }
        if self.total_iterations == 0 {
            return Err(ProgressError::Invalid("total_iterations must be > 0".into()));
        }
        Ok(())
    }
}

/// Crash-safe per-session journal store.
pub struct ProgressTracker<C: Clock = SystemClock> {
    dir: PathBuf,
    clock: C,
    cache: Mutex<HashMap<String, ProgressJournal>>,
}

const SAVE_BACKOFFS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(400),
];

impl<C: Clock> ProgressTracker<C> {
    pub fn new(dir: PathBuf, clock: C) -> Self {
        Self { dir, clock, cache: Mutex::new(HashMap::new()) }
    }

    fn journal_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}-progress.json"))
    }

    fn backup_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}-progress.json.backup"))
    }

    /// Read the journal from disk, falling back to the sibling backup, per
    /// §4.B's `load()`. Never returns an error: a corrupt journal and a
    /// corrupt backup both just mean "start fresh".
    pub fn load(&self, session_id: &str) -> Option<ProgressJournal> {
        let path = self.journal_path(session_id);
        if let Ok(bytes) = fs::read(&path) {
            match serde_json::from_slice::<ProgressJournal>(&bytes).map_err(ProgressError::from).and_then(|j| {
                j.validate()?;
                Ok(j)
            }) {
                Ok(journal) => return Some(journal),
                Err(e) => warn!(session_id, error = %e, "progress journal unreadable, trying backup"),
            }
        }

        let backup = self.backup_path(session_id);
        if let Ok(bytes) = fs::read(&backup) {
            match serde_json::from_slice::<ProgressJournal>(&bytes).map_err(ProgressError::from).and_then(|j| {
                j.validate()?;
                Ok(j)
            }) {
                Ok(journal) => {
                    warn!(session_id, "recovered progress journal from backup");
                    return Some(journal);
                }
                Err(e) => warn!(session_id, error = %e, "progress journal backup also unreadable"),
            }
        }
        None
    }

    fn get_or_init(&self, cache: &mut HashMap<String, ProgressJournal>, session_id: &str, total_iterations: u32) {
        if cache.contains_key(session_id) {
            return;
        }
        let journal = self.load(session_id).unwrap_or_else(|| {
            ProgressJournal::fresh(session_id, total_iterations.max(1), self.clock.now_ms())
        });
        cache.insert(session_id.to_string(), journal);
    }

    fn try_save(&self, journal: &ProgressJournal) -> Result<(), ProgressError> {
        let path = self.journal_path(&journal.session_id);
        let backup = self.backup_path(&journal.session_id);
        if path.exists() {
            fs::copy(&path, &backup)?;
        }

        let tmp = self.dir.join(format!(
            "{}-progress.json.tmp.{}.{}",
            journal.session_id,
            std::process::id(),
            journal.last_update
        ));
        fs::create_dir_all(&self.dir)?;
        fs::write(&tmp, serde_json::to_vec_pretty(journal)?)?;
        fs::rename(&tmp, &path)?;

        let verify: ProgressJournal = serde_json::from_slice(&fs::read(&path)?)?;
        if verify.session_id != journal.session_id || verify.last_update != journal.last_update {
            if backup.exists() {
                let _ = fs::copy(&backup, &path);
            }
            return Err(ProgressError::VerifyFailed);
        }

        if backup.exists() {
            let _ = fs::remove_file(&backup);
        }
        Ok(())
    }

    /// Save with the five-step atomic protocol, retrying with exponential
    /// backoff on verify failure. A total failure is logged, not propagated.
    fn save(&self, journal: &ProgressJournal) {
        for (attempt, backoff) in SAVE_BACKOFFS.iter().enumerate() {
            match self.try_save(journal) {
                Ok(()) => return,
                Err(e) => {
                    warn!(session_id = %journal.session_id, attempt, error = %e, "progress journal save failed");
                    if attempt + 1 < SAVE_BACKOFFS.len() {
                        std::thread::sleep(*backoff);
                    }
                }
            }
        }
        error!(session_id = %journal.session_id, "progress journal save failed after all retries, continuing without a durable update");
    }

    /// Create (or reset) a session's journal at the start of the run,
    /// per §4.F step 2.
    pub fn init_journal(&self, session_id: &str, total_iterations: u32) {
        let mut cache = self.cache.lock();
        let journal = ProgressJournal::fresh(session_id, total_iterations.max(1), self.clock.now_ms());
        self.save(&journal);
        cache.insert(session_id.to_string(), journal);
    }

    pub fn start_iteration(&self, session_id: &str, number: u32, goal: Option<String>) {
        let mut cache = self.cache.lock();
        self.get_or_init(&mut cache, session_id, number);
        let now = self.clock.now_ms();
        let journal = cache.get_mut(session_id).expect("just inserted");
        journal.iterations.push(IterationEntry::new_running(session_id, number, goal, now));
        journal.current_iteration = number;
        journal.status = "running".to_string();
        journal.last_update = now;
        self.save(journal);
    }

    pub fn log_action(&self, session_id: &str, kind: &str, action: &str, result: &str, success: bool) {
        let mut cache = self.cache.lock();
        self.get_or_init(&mut cache, session_id, 1);
        let now = self.clock.now_ms();
        let journal = cache.get_mut(session_id).expect("just inserted");
        if let Some(current) = journal.iterations.last_mut() {
            current.actions.push(ActionEntry {
                timestamp: now,
                kind: kind.to_string(),
                action: action.to_string(),
                result: result.to_string(),
                success,
            });
        }
        journal.last_update = now;
        self.save(journal);
    }

    pub fn add_milestone(&self, session_id: &str, text: &str, impact: &str) {
        let mut cache = self.cache.lock();
        self.get_or_init(&mut cache, session_id, 1);
        let now = self.clock.now_ms();
        let journal = cache.get_mut(session_id).expect("just inserted");
        journal.milestones.push(Milestone { timestamp: now, text: text.to_string(), impact: impact.to_string() });
        journal.last_update = now;
        self.save(journal);
    }

    /// Coalesce a state update, auto-healing gaps by synthesizing
    /// placeholder iterations when `current_iteration` jumps ahead of what
    /// has actually been recorded (§4.B).
    pub fn update_progress(
        &self,
        session_id: &str,
        status: Option<&str>,
        current_iteration: Option<u32>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut cache = self.cache.lock();
        self.get_or_init(&mut cache, session_id, current_iteration.unwrap_or(1));
        let now = self.clock.now_ms();
        let journal = cache.get_mut(session_id).expect("just inserted");

        if let Some(target) = current_iteration {
            let recorded = journal.iterations.len() as u32;
            for n in (recorded + 1)..=target {
                journal.iterations.push(IterationEntry::placeholder(session_id, n, now));
            }
            journal.current_iteration = target;
        }
        if let Some(status) = status {
            journal.status = status.to_string();
        }
        if let Some(metadata) = metadata {
            journal.metadata = metadata;
        }
        journal.last_update = now;
        self.save(journal);
    }

    pub fn complete_iteration(
        &self,
        session_id: &str,
        summary: Option<String>,
        achievements: Vec<String>,
        challenges: Vec<String>,
        next_steps: Vec<String>,
    ) {
        let mut cache = self.cache.lock();
        self.get_or_init(&mut cache, session_id, 1);
        let now = self.clock.now_ms();
        let journal = cache.get_mut(session_id).expect("just inserted");
        if let Some(current) = journal.iterations.last_mut() {
            current.end = Some(now);
            current.status = IterationStatus::Completed;
            current.duration_s = current.end.unwrap_or(now).saturating_sub(current.start) / 1000;
            current.summary = summary;
            current.achievements = achievements;
            current.challenges = challenges;
            current.next_steps = next_steps;
        }
        journal.last_update = now;
        self.save(journal);
    }

    pub fn complete_session(&self, session_id: &str, summary: Option<String>, final_status: &str) {
        let mut cache = self.cache.lock();
        self.get_or_init(&mut cache, session_id, 1);
        let now = self.clock.now_ms();
        let journal = cache.get_mut(session_id).expect("just inserted");
        journal.overall_summary = summary;
        journal.status = final_status.to_string();
        journal.last_update = now;
        self.save(journal);
    }
}
