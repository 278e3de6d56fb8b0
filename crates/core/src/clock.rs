// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Time abstraction so the engine and storage layers can be driven
//! deterministically in tests.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now", abstracted so retry/backoff and timestamp logic can be
/// tested without real sleeps.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Current time as epoch milliseconds.
    fn now_ms(&self) -> u64;
}

/// Production clock backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Deterministic clock for tests. Starts at an arbitrary fixed epoch and
/// only advances when told to, so iteration-engine backoff and schedule
/// next-run tests don't depend on wall-clock timing.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now_ms: Arc<AtomicU64>,
    /// Secondary store for tests that want a shared, lockable view (e.g.
    /// asserting on a snapshot while another task advances the clock).
    shared: Arc<Mutex<()>>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    /// Starts at 2026-01-01T00:00:00Z so formatted timestamps look sane in
    /// failure output.
    pub fn new() -> Self {
        Self::at(1_767_225_600_000)
    }

    pub fn at(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
            shared: Arc::new(Mutex::new(())),
        }
    }

    pub fn advance_ms(&self, delta: u64) {
        let _guard = self.shared.lock();
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, value: u64) {
        let _guard = self.shared.lock();
        self.now_ms.store(value, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
