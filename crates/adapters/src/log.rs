// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Log Manager (§4.C): append-only per-session log files with bounded
//! size, tailing, search, and retention. A single writer handle per session
//! is cached so appends are totally ordered; reads open the file
//! independently and never block the writer.

use afk_core::{Clock, SystemClock};
use parking_lot::Mutex;
use regex::RegexBuilder;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid search pattern: {0}")]
    InvalidPattern(String),
}

/// Default rotation threshold (§4.C).
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Default retention window for `cleanupOlderThan`.
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct LogStats {
    pub size_bytes: u64,
    pub created_ms: Option<u64>,
    pub modified_ms: Option<u64>,
    pub line_count: usize,
}

#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub line_number: usize,
    pub content: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub case_insensitive: bool,
    pub max_results: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { case_insensitive: false, max_results: 1000 }
    }
}

/// Cancellation handle for `follow`. Dropping it does not stop the task;
/// call `cancel()` explicitly.
pub struct FollowHandle {
    cancelled: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl FollowHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

/// A handle returned by `open_stream`, serializing appends for one session.
pub struct AppendHandle {
    session_id: String,
    file: Arc<Mutex<File>>,
}

impl AppendHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Append-only per-session log files with rotation and retention (§4.C).
pub struct LogManager<C: Clock = SystemClock> {
    dir: PathBuf,
    clock: C,
    max_log_size: u64,
    handles: Mutex<HashMap<String, Arc<Mutex<File>>>>,
}

impl<C: Clock> LogManager<C> {
    pub fn new(dir: PathBuf, clock: C) -> Self {
        Self { dir, clock, max_log_size: DEFAULT_MAX_LOG_SIZE, handles: Mutex::new(HashMap::new()) }
    }

    pub fn with_max_log_size(mut self, max_log_size: u64) -> Self {
        self.max_log_size = max_log_size;
        self
    }

    fn log_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.log"))
    }

    fn timestamp_prefix(&self) -> String {
        let ms = self.clock.now_ms();
        chrono::DateTime::from_timestamp_millis(ms as i64)
            .map(|t| t.format("[%H:%M:%S]").to_string())
            .unwrap_or_else(|| "[--:--:--]".to_string())
    }

    fn handle_for(&self, session_id: &str) -> Result<Arc<Mutex<File>>, LogError> {
        let mut handles = self.handles.lock();
        if let Some(h) = handles.get(session_id) {
            return Ok(Arc::clone(h));
        }
        std::fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new().create(true).append(true).open(self.log_path(session_id))?;
        let handle = Arc::new(Mutex::new(file));
        handles.insert(session_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Opens (creating if necessary) a session's log and writes a banner
    /// header. Returns a handle future appends can be routed through.
    pub fn open_stream(&self, session_id: &str) -> Result<AppendHandle, LogError> {
        let file = self.handle_for(session_id)?;
        let banner = format!(
            "=== session {session_id} started at {} ===\n",
            self.timestamp_prefix()
        );
        if let Err(e) = file.lock().write_all(banner.as_bytes()) {
            warn!(session_id, error = %e, "failed to write log banner");
        }
        Ok(AppendHandle { session_id: session_id.to_string(), file })
    }

    /// Appends a line, timestamping it. Fails open: an I/O error is logged
    /// and dropped rather than propagated to the worker.
    pub fn append(&self, session_id: &str, text: &str) {
        let file = match self.handle_for(session_id) {
            Ok(f) => f,
            Err(e) => {
                warn!(session_id, error = %e, "log append dropped, could not open handle");
                return;
            }
        };
        let prefix = self.timestamp_prefix();
        let mut guard = file.lock();
        for line in text.lines() {
            if let Err(e) = writeln!(guard, "{prefix} {line}") {
                warn!(session_id, error = %e, "log append dropped");
                return;
            }
        }
    }

    pub fn read_all(&self, session_id: &str) -> Result<String, LogError> {
        Ok(std::fs::read_to_string(self.log_path(session_id))?)
    }

    pub fn read_tail(&self, session_id: &str, lines: usize) -> Result<Vec<String>, LogError> {
        let content = match std::fs::read_to_string(self.log_path(session_id)) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let all: Vec<String> = content.lines().map(str::to_string).collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].to_vec())
    }

    /// Emits the existing tail, then polls for subsequent appends until
    /// cancelled. Polling (rather than a filesystem watch) keeps this crate
    /// free of a notify dependency for a single-reader-per-session use case.
    pub fn follow(
        &self,
        session_id: &str,
        lines: usize,
        mut on_line: impl FnMut(String) + Send + 'static,
    ) -> Result<FollowHandle, LogError> {
        let path = self.log_path(session_id);
        let tail = self.read_tail(session_id, lines)?;
        let mut offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        for line in tail {
            on_line(line);
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_task = Arc::clone(&cancelled);
        let task = tokio::spawn(async move {
            loop {
                if cancelled_task.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(FOLLOW_POLL_INTERVAL).await;
                let Ok(file) = File::open(&path) else { continue };
                let mut reader = BufReader::new(file);
                use std::io::{Seek, SeekFrom};
                if reader.seek(SeekFrom::Start(offset)).is_err() {
                    continue;
                }
                let mut buf = String::new();
                loop {
                    buf.clear();
                    match reader.read_line(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            offset += n as u64;
                            let line = buf.trim_end_matches('\n').to_string();
                            on_line(line);
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        Ok(FollowHandle { cancelled, task })
    }

    pub fn search(&self, session_id: &str, pattern: &str, options: SearchOptions) -> Result<Vec<SearchMatch>, LogError> {
        let content = self.read_all(session_id)?;
        let regex = RegexBuilder::new(&regex::escape(pattern))
            .case_insensitive(options.case_insensitive)
            .build()
            .map_err(|e| LogError::InvalidPattern(e.to_string()))?;

        let mut out = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                out.push(SearchMatch { line_number: idx + 1, content: line.to_string() });
                if out.len() >= options.max_results {
                    break;
                }
            }
        }
        Ok(out)
    }

    pub fn stats(&self, session_id: &str) -> Result<LogStats, LogError> {
        let path = self.log_path(session_id);
        let metadata = std::fs::metadata(&path)?;
        let to_ms = |t: std::io::Result<std::time::SystemTime>| {
            t.ok().and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok()).map(|d| d.as_millis() as u64)
        };
        let content = std::fs::read_to_string(&path)?;
        Ok(LogStats {
            size_bytes: metadata.len(),
            created_ms: to_ms(metadata.created()),
            modified_ms: to_ms(metadata.modified()),
            line_count: content.lines().count(),
        })
    }

    /// If the session's log exceeds `max_log_size`, renames it to
    /// `<file>.<epoch_ms>` and compresses it with gzip off the hot path.
    /// A fresh writer handle is created lazily on the next append.
    pub fn rotate(&self, session_id: &str) -> Result<bool, LogError> {
        let path = self.log_path(session_id);
        let size = match std::fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if size <= self.max_log_size {
            return Ok(false);
        }

        self.handles.lock().remove(session_id);
        let rotated_path = self.dir.join(format!("{session_id}.log.{}", self.clock.now_ms()));
        std::fs::rename(&path, &rotated_path)?;

        tokio::task::spawn_blocking(move || {
            if let Err(e) = compress_and_remove(&rotated_path) {
                error!(path = %rotated_path.display(), error = %e, "failed to compress rotated log");
            }
        });

        Ok(true)
    }

    /// Deletes log files (rotated or not) whose mtime is older than
    /// `days`. Returns the number of files removed.
    pub fn cleanup_older_than(&self, days: u64) -> Result<usize, LogError> {
        let cutoff = self.clock.now_ms().saturating_sub(days * 86_400_000);
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Ok(0);
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else { continue };
            let Ok(modified) = metadata.modified() else { continue };
            let Ok(modified_ms) = modified.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64) else {
                continue;
            };
            if modified_ms < cutoff {
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn compress_and_remove(path: &Path) -> std::io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let data = std::fs::read(path)?;
    let gz_path = path.with_extension(format!(
        "{}.gz",
        path.extension().and_then(|e| e.to_str()).unwrap_or_default()
    ));
    let gz_file = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(gz_file, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?;
    std::fs::remove_file(path)?;
    Ok(())
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
