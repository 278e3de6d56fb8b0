// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-category circuit breaker shared across sessions (§4.F). Each
//! category accumulates consecutive failures independently; once a
//! category trips, new work in that category fails fast with
//! `CircuitOpen` until the cooldown elapses, at which point one probe
//! is allowed through (half-open) before the circuit fully closes.

use afk_core::{Clock, SupervisorError, SystemClock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Worker,
    ProcessSpawn,
    Filesystem,
}

impl Category {
    fn label(self) -> &'static str {
        match self {
            Category::Worker => "worker",
            Category::ProcessSpawn => "process_spawn",
            Category::Filesystem => "filesystem",
        }
    }

    /// Consecutive failures before the circuit opens, and how long it
    /// stays open before allowing a half-open probe.
    fn thresholds(self) -> (u32, Duration) {
        match self {
            Category::Worker => (3, Duration::from_secs(30)),
            Category::ProcessSpawn => (5, Duration::from_secs(60)),
            Category::Filesystem => (10, Duration::from_secs(10)),
        }
    }
}

/// Successive half-open probes required to fully close a circuit.
const HALF_OPEN_CLOSE_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { opened_at_ms: u64 },
    HalfOpen { consecutive_successes: u32 },
}

/// Shared failure accumulator, one instance per supervisor root.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    clock: C,
    states: Mutex<HashMap<Category, State>>,
}

impl<C: Clock> CircuitBreaker<C> {
    pub fn new(clock: C) -> Self {
        Self { clock, states: Mutex::new(HashMap::new()) }
    }

    /// Call before starting work in `category`. Returns `CircuitOpen` if
    /// the category is tripped and its cooldown has not yet elapsed;
    /// otherwise transitions a stale `Open` into `HalfOpen` and allows
    /// the caller through as a probe.
    pub fn allow(&self, category: Category) -> Result<(), SupervisorError> {
        let mut states = self.states.lock();
        let (_, cooldown) = category.thresholds();
        let state = states.entry(category).or_insert(State::Closed { consecutive_failures: 0 });
        match *state {
            State::Closed { .. } | State::HalfOpen { .. } => Ok(()),
            State::Open { opened_at_ms } => {
                if self.clock.now_ms().saturating_sub(opened_at_ms) >= cooldown.as_millis() as u64 {
                    *state = State::HalfOpen { consecutive_successes: 0 };
                    Ok(())
                } else {
                    Err(SupervisorError::CircuitOpen(category.label().to_string()))
                }
            }
        }
    }

    pub fn record_success(&self, category: Category) {
        let mut states = self.states.lock();
        let state = states.entry(category).or_insert(State::Closed { consecutive_failures: 0 });
        *state = match *state {
            State::HalfOpen { consecutive_successes } if consecutive_successes + 1 >= HALF_OPEN_CLOSE_THRESHOLD => {
                State::Closed { consecutive_failures: 0 }
            }
            State::HalfOpen { consecutive_successes } => {
                State::HalfOpen { consecutive_successes: consecutive_successes + 1 }
            }
            _ => State::Closed { consecutive_failures: 0 },
        };
    }

    pub fn record_failure(&self, category: Category) {
        let mut states = self.states.lock();
        let (threshold, _) = category.thresholds();
        let now_ms = self.clock.now_ms();
        let state = states.entry(category).or_insert(State::Closed { consecutive_failures: 0 });
        *state = match *state {
            State::Closed { consecutive_failures } if consecutive_failures + 1 >= threshold => {
                State::Open { opened_at_ms: now_ms }
            }
            State::Closed { consecutive_failures } => State::Closed { consecutive_failures: consecutive_failures + 1 },
            // A half-open probe failing re-opens the circuit immediately.
            State::HalfOpen { .. } => State::Open { opened_at_ms: now_ms },
            State::Open { opened_at_ms } => State::Open { opened_at_ms },
        };
    }

    pub fn is_open(&self, category: Category) -> bool {
        matches!(self.states.lock().get(&category), Some(State::Open { .. }))
    }

    /// Force a category closed regardless of its current state, for
    /// external operator recovery.
    pub fn force_close(&self, category: Category) {
        self.states.lock().insert(category, State::Closed { consecutive_failures: 0 });
    }
}

#[cfg(test)]
#[path = "circuit_breaker_tests.rs"]
mod tests;
