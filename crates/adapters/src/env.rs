// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the adapters crate.

use std::time::Duration;

fn parse_duration_ms(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn parse_usize(var: &str) -> Option<usize> {
    std::env::var(var).ok().and_then(|s| s.parse::<usize>().ok())
}

/// Number of attempts for a single Oracle Gateway call, including the
/// first (default: 3, per §4.I's "bounded retries with progressive delay").
pub fn oracle_max_attempts() -> usize {
    parse_usize("AFK_ORACLE_MAX_ATTEMPTS").filter(|&n| n > 0).unwrap_or(3)
}

/// Base delay before the first retry; doubled on each subsequent attempt
/// (default: 500ms).
pub fn oracle_retry_base_ms() -> Duration {
    parse_duration_ms("AFK_ORACLE_RETRY_BASE_MS").unwrap_or(Duration::from_millis(500))
}
