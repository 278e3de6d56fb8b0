// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Cleanup Engine (§4.G): a retention-driven sweep of terminal
//! sessions, their log files, and a legacy registry directory. Every
//! sweep (dry-run or not) appends a JSON-lines audit record.

use afk_core::{Clock, SessionStatus, SystemClock};
use afk_storage::SessionStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub completed: Duration,
    pub failed: Duration,
    pub error: Duration,
    pub stopped: Duration,
    /// Always kept regardless of age, per status bucket.
    pub preserve_recent: usize,
    pub legacy_max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: DAY * 7,
            failed: DAY * 30,
            error: DAY * 30,
            stopped: DAY * 14,
            preserve_recent: 10,
            legacy_max_age: DAY * 7,
        }
    }
}

impl RetentionPolicy {
    fn ttl_for(&self, status: SessionStatus) -> Option<Duration> {
        match status {
            SessionStatus::Completed => Some(self.completed),
            SessionStatus::Failed => Some(self.failed),
            SessionStatus::Error => Some(self.error),
            SessionStatus::Stopped => Some(self.stopped),
            SessionStatus::Running | SessionStatus::Created | SessionStatus::Starting => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Deletion {
    pub session_id: String,
    pub reason: String,
    pub bytes_reclaimed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepSummary {
    pub scanned: usize,
    pub deleted: usize,
    pub preserved: usize,
    pub errors: usize,
    pub bytes_reclaimed: u64,
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    timestamp: u64,
    mode: &'a str,
    stats: &'a SweepSummary,
    deletions: &'a [Deletion],
    errors: &'a [String],
}

/// Sweeps the session store, its log directory, and an optional legacy
/// registry path according to a [`RetentionPolicy`] (§4.G).
pub struct CleanupEngine<C: Clock = SystemClock> {
    store: Arc<SessionStore>,
    log_dir: PathBuf,
    legacy_dir: Option<PathBuf>,
    audit_log_path: PathBuf,
    policy: RetentionPolicy,
    clock: C,
}

impl<C: Clock> CleanupEngine<C> {
    pub fn new(store: Arc<SessionStore>, log_dir: PathBuf, audit_log_path: PathBuf, policy: RetentionPolicy, clock: C) -> Self {
        Self { store, log_dir, legacy_dir: None, audit_log_path, policy, clock }
    }

    pub fn with_legacy_dir(mut self, dir: PathBuf) -> Self {
        self.legacy_dir = Some(dir);
        self
    }

    fn log_path(&self, session_id: &str) -> PathBuf {
        self.log_dir.join(format!("{session_id}.log"))
    }

    /// Runs every sweep phase in order. `dry_run` skips phases 1-3's
    /// actual deletions but still computes and audits what would have
    /// happened.
    pub fn sweep(&self, dry_run: bool) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let mut deletions = Vec::new();
        let mut errors = Vec::new();

        self.sweep_database(dry_run, &mut summary, &mut deletions, &mut errors);
        self.sweep_orphaned_logs(dry_run, &mut summary, &mut deletions, &mut errors);
        self.sweep_legacy_dir(dry_run, &mut summary, &mut deletions, &mut errors);
        self.append_audit(dry_run, &summary, &deletions, &errors);

        summary.errors = errors.len();
        summary
    }

    fn sweep_database(&self, dry_run: bool, summary: &mut SweepSummary, deletions: &mut Vec<Deletion>, errors: &mut Vec<String>) {
        let now = self.clock.now_ms();
        let all = match self.store.list_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                errors.push(e.to_string());
                return;
            }
        };

        let mut by_status: std::collections::HashMap<SessionStatus, Vec<_>> = std::collections::HashMap::new();
        for session in all {
            if self.policy.ttl_for(session.status).is_some() {
                by_status.entry(session.status).or_default().push(session);
            }
        }

        for (status, mut bucket) in by_status {
            let Some(ttl) = self.policy.ttl_for(status) else { continue };
            bucket.sort_by_key(|s| std::cmp::Reverse(s.completed_at.unwrap_or(s.created_at)));
            summary.scanned += bucket.len();

            for (index, session) in bucket.into_iter().enumerate() {
                if index < self.policy.preserve_recent {
                    summary.preserved += 1;
                    continue;
                }
                let terminal_at = session.completed_at.unwrap_or(session.created_at);
                let age_ms = now.saturating_sub(terminal_at);
                if age_ms < ttl.as_millis() as u64 {
                    summary.preserved += 1;
                    continue;
                }

                let log_path = self.log_path(session.id.as_str());
                let bytes = std::fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0);

                if !dry_run {
                    if let Err(e) = self.store.delete_session(&session.id) {
                        errors.push(format!("delete session {}: {e}", session.id));
                        continue;
                    }
                    if let Err(e) = std::fs::remove_file(&log_path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(session_id = %session.id, error = %e, "failed to remove session log during sweep");
                        }
                    }
                }

                summary.deleted += 1;
                summary.bytes_reclaimed += bytes;
                deletions.push(Deletion { session_id: session.id.to_string(), reason: format!("{status} retention expired"), bytes_reclaimed: bytes });
            }
        }
    }

    fn sweep_orphaned_logs(&self, dry_run: bool, summary: &mut SweepSummary, deletions: &mut Vec<Deletion>, errors: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(&self.log_dir) else { return };
        let known: HashSet<String> = match self.store.list_sessions() {
            Ok(sessions) => sessions.into_iter().map(|s| s.id.to_string()).collect(),
            Err(e) => {
                errors.push(e.to_string());
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            if path.extension().and_then(|e| e.to_str()) != Some("log") || known.contains(stem) {
                continue;
            }
            summary.scanned += 1;
            let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if !dry_run {
                if let Err(e) = std::fs::remove_file(&path) {
                    errors.push(format!("remove orphaned log {}: {e}", path.display()));
                    continue;
                }
            }
            summary.deleted += 1;
            summary.bytes_reclaimed += bytes;
            deletions.push(Deletion { session_id: stem.to_string(), reason: "orphaned log, no matching session".to_string(), bytes_reclaimed: bytes });
        }
    }

    fn sweep_legacy_dir(&self, dry_run: bool, summary: &mut SweepSummary, deletions: &mut Vec<Deletion>, errors: &mut Vec<String>) {
        let Some(legacy_dir) = &self.legacy_dir else { return };
        let Ok(entries) = std::fs::read_dir(legacy_dir) else { return };
        let now = self.clock.now_ms();

        for entry in entries.flatten() {
            let path = entry.path();
            let mtime_ms = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(now);
            if now.saturating_sub(mtime_ms) < self.policy.legacy_max_age.as_millis() as u64 {
                continue;
            }
            summary.scanned += 1;
            let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if !dry_run {
                let remove = if path.is_dir() { std::fs::remove_dir_all(&path) } else { std::fs::remove_file(&path) };
                if let Err(e) = remove {
                    errors.push(format!("remove legacy entry {}: {e}", path.display()));
                    continue;
                }
            }
            summary.deleted += 1;
            summary.bytes_reclaimed += bytes;
            deletions.push(Deletion {
                session_id: path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string(),
                reason: "legacy entry older than retention".to_string(),
                bytes_reclaimed: bytes,
            });
        }
    }

    fn append_audit(&self, dry_run: bool, summary: &SweepSummary, deletions: &[Deletion], errors: &[String]) {
        let record = AuditRecord {
            timestamp: self.clock.now_ms(),
            mode: if dry_run { "dry-run" } else { "execute" },
            stats: summary,
            deletions,
            errors,
        };
        let Ok(line) = serde_json::to_string(&record) else { return };
        if let Some(parent) = self.audit_log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        use std::io::Write;
        match std::fs::OpenOptions::new().create(true).append(true).open(&self.audit_log_path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!(error = %e, "failed to append cleanup audit record");
                }
            }
            Err(e) => warn!(error = %e, "failed to open cleanup audit log"),
        }
    }
}

#[cfg(test)]
#[path = "cleanup_tests.rs"]
mod tests;
