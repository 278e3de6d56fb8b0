// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Process Monitor (§4.D): an in-memory registry of supervised child
//! PIDs. It is the authority on "is session X currently alive?" but never
//! touches `libc` directly — liveness and signalling go through the
//! `ProcessProbe` trait so the registry itself stays deterministic in tests.

use afk_core::SessionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Graceful-then-forced signal used by `stopSession`/`killOrphans`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// Liveness and signalling primitives the monitor is built on. A production
/// `NixProbe` implements this with real `kill(2)` calls; tests use a
/// `FakeProbe` that never touches the OS.
pub trait ProcessProbe: Send + Sync + 'static {
    /// Signal-0 liveness check: true if the process exists and is reachable.
    fn is_alive(&self, pid: u32) -> bool;

    /// Send a signal, tolerating "no such process" as success (§4.D: all
    /// `kill*` paths must treat already-dead as success).
    fn send_signal(&self, pid: u32, signal: Signal);

    /// Enumerate live processes whose command line contains `fingerprint`,
    /// for orphan detection. Best-effort: an empty result is always valid.
    fn find_by_fingerprint(&self, fingerprint: &str) -> Vec<(u32, String)>;
}

/// Production probe. Liveness and signalling use `nix`'s `kill(2)` wrapper;
/// fingerprint scanning walks `/proc` on Linux and returns nothing elsewhere
/// (best-effort per the contract, never a hard failure).
#[derive(Debug, Clone, Copy, Default)]
pub struct NixProbe;

#[cfg(unix)]
impl ProcessProbe for NixProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    fn send_signal(&self, pid: u32, signal: Signal) {
        use nix::sys::signal::{kill, Signal as NixSignal};
        use nix::unistd::Pid;
        let nix_signal = match signal {
            Signal::Term => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };
        // ESRCH ("no such process") means the target is already dead, which
        // is the success case for every caller of this method.
        let _ = kill(Pid::from_raw(pid as i32), nix_signal);
    }

    fn find_by_fingerprint(&self, fingerprint: &str) -> Vec<(u32, String)> {
        find_by_fingerprint_proc(fingerprint)
    }
}

#[cfg(target_os = "linux")]
fn find_by_fingerprint_proc(fingerprint: &str) -> Vec<(u32, String)> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return out;
    };
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&cmdline).replace('\0', " ");
        if cmdline.contains(fingerprint) {
            out.push((pid, cmdline));
        }
    }
    out
}

#[cfg(all(unix, not(target_os = "linux")))]
fn find_by_fingerprint_proc(_fingerprint: &str) -> Vec<(u32, String)> {
    Vec::new()
}

/// A registered supervised process: the worker's own PID plus any auxiliary
/// helper PIDs (e.g. a platform wake-lock helper spawned alongside it).
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub session_id: SessionId,
    pub pid: u32,
    pub aux_pids: Vec<u32>,
    pub registered_at: u64,
}

/// The four-way liveness check from §4.D's `validate`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validation {
    pub in_registry: bool,
    pub pid_alive: bool,
    pub recent_journal_activity: bool,
    pub worker_process_present_by_fingerprint: bool,
}

impl Validation {
    pub fn is_active(&self) -> bool {
        self.in_registry || self.pid_alive || self.recent_journal_activity || self.worker_process_present_by_fingerprint
    }
}

const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// In-memory registry of currently supervised child processes (§4.D).
pub struct ProcessMonitor<P: ProcessProbe = NixProbe> {
    probe: Arc<P>,
    records: Mutex<HashMap<String, ProcessRecord>>,
    fingerprint: String,
    grace: Duration,
    shutdown_started: AtomicBool,
}

impl<P: ProcessProbe> ProcessMonitor<P> {
    pub fn new(probe: P, fingerprint: impl Into<String>) -> Self {
        Self {
            probe: Arc::new(probe),
            records: Mutex::new(HashMap::new()),
            fingerprint: fingerprint.into(),
            grace: DEFAULT_GRACE,
            shutdown_started: AtomicBool::new(false),
        }
    }

    /// Override the graceful-to-forced grace period (production default 5s;
    /// tests shrink this to keep suites fast).
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn register(&self, session_id: SessionId, pid: u32, aux_pids: Vec<u32>, registered_at: u64) {
        self.records.lock().insert(
            session_id.to_string(),
            ProcessRecord { session_id, pid, aux_pids, registered_at },
        );
    }

    pub fn unregister(&self, session_id: &SessionId) {
        self.records.lock().remove(session_id.as_str());
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.records.lock().contains_key(session_id.as_str())
    }

    pub fn info(&self, session_id: &SessionId) -> Option<ProcessRecord> {
        self.records.lock().get(session_id.as_str()).cloned()
    }

    pub fn list_all(&self) -> Vec<ProcessRecord> {
        self.records.lock().values().cloned().collect()
    }

    pub fn is_pid_alive(&self, pid: u32) -> bool {
        self.probe.is_alive(pid)
    }

    pub fn validate(&self, session_id: &SessionId, recent_journal_activity: bool) -> Validation {
        let record = self.info(session_id);
        let pid_alive = record.as_ref().map(|r| self.probe.is_alive(r.pid)).unwrap_or(false);
        let worker_process_present_by_fingerprint = self
            .probe
            .find_by_fingerprint(&self.fingerprint)
            .iter()
            .any(|(_, cmdline)| cmdline.contains(session_id.as_str()));
        Validation {
            in_registry: record.is_some(),
            pid_alive,
            recent_journal_activity,
            worker_process_present_by_fingerprint,
        }
    }

    /// Processes that look like a worker invocation but whose session id is
    /// not tracked in the registry.
    pub fn find_orphans(&self) -> Vec<(u32, String)> {
        let registered: std::collections::HashSet<u32> =
            self.records.lock().values().flat_map(|r| std::iter::once(r.pid).chain(r.aux_pids.clone())).collect();
        self.probe
            .find_by_fingerprint(&self.fingerprint)
            .into_iter()
            .filter(|(pid, _)| !registered.contains(pid))
            .collect()
    }

    /// Graceful signal now, forced kill after the grace period if still
    /// alive. `kill*` paths tolerate already-dead targets as success.
    pub async fn kill_orphans(&self) {
        let orphans = self.find_orphans();
        for (pid, _) in &orphans {
            self.probe.send_signal(*pid, Signal::Term);
        }
        let probe = Arc::clone(&self.probe);
        let pids: Vec<u32> = orphans.into_iter().map(|(pid, _)| pid).collect();
        let grace = self.grace;
        tokio::time::sleep(grace).await;
        for pid in pids {
            if probe.is_alive(pid) {
                probe.send_signal(pid, Signal::Kill);
            }
        }
    }

    /// Graceful signal to the main PID and any auxiliary PIDs, unregister
    /// immediately, and schedule a forced kill after the grace period.
    /// Idempotent: stopping a session not in the registry is a no-op.
    pub async fn stop_session(&self, session_id: &SessionId) {
        let Some(record) = self.records.lock().remove(session_id.as_str()) else {
            return;
        };
        let mut pids = vec![record.pid];
        pids.extend(record.aux_pids);
        for pid in &pids {
            self.probe.send_signal(*pid, Signal::Term);
        }

        let probe = Arc::clone(&self.probe);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for pid in pids {
                if probe.is_alive(pid) {
                    probe.send_signal(pid, Signal::Kill);
                }
            }
        });
    }

    /// Install-once shutdown hook: stop every registered session. A second
    /// call after the registry has drained is a safe no-op.
    pub async fn stop_all(&self) {
        self.shutdown_started.store(true, Ordering::SeqCst);
        let session_ids: Vec<SessionId> = self.records.lock().values().map(|r| r.session_id.clone()).collect();
        for session_id in session_ids {
            self.stop_session(&session_id).await;
        }
    }

    pub fn shutdown_started(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn probe(&self) -> &P {
        &self.probe
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::{ProcessProbe, Signal};
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    /// In-memory probe for hermetic tests: no real PIDs, no real signals.
    #[derive(Default)]
    pub struct FakeProbe {
        alive: Mutex<HashSet<u32>>,
        signals_sent: Mutex<Vec<(u32, Signal)>>,
        fingerprint_matches: Mutex<HashMap<String, Vec<(u32, String)>>>,
    }

    impl FakeProbe {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn mark_alive(&self, pid: u32) {
            self.alive.lock().insert(pid);
        }

        pub fn mark_dead(&self, pid: u32) {
            self.alive.lock().remove(&pid);
        }

        pub fn set_fingerprint_matches(&self, fingerprint: impl Into<String>, matches: Vec<(u32, String)>) {
            self.fingerprint_matches.lock().insert(fingerprint.into(), matches);
        }

        pub fn signals_sent(&self) -> Vec<(u32, Signal)> {
            self.signals_sent.lock().clone()
        }
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().contains(&pid)
        }

        fn send_signal(&self, pid: u32, signal: Signal) {
            self.signals_sent.lock().push((pid, signal));
            if signal == Signal::Kill {
                self.alive.lock().remove(&pid);
            }
        }

        fn find_by_fingerprint(&self, fingerprint: &str) -> Vec<(u32, String)> {
            self.fingerprint_matches.lock().get(fingerprint).cloned().unwrap_or_default()
        }
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
