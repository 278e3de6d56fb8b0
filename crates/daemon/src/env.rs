// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Environment inputs recognized by the daemon (§6): where its state
//! lives on disk, and the two flags that change its runtime behavior
//! without a config file.

use std::path::PathBuf;

use crate::lifecycle::LifecycleError;

/// Resolve the daemon's state directory: `AFK_STATE_DIR` wins outright,
/// then `XDG_STATE_HOME/afk`, then `~/.local/state/afk`.
pub fn state_dir() -> Result<PathBuf, LifecycleError> {
    if let Ok(dir) = std::env::var("AFK_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return Ok(PathBuf::from(xdg).join("afk"));
    }
    let home = std::env::var("HOME").map_err(|_| LifecycleError::NoStateDir)?;
    Ok(PathBuf::from(home).join(".local/state/afk"))
}

/// `AFK_DEBUG=1` widens the default log filter to `debug` and disables
/// log rotation so nothing is truncated mid-investigation.
pub fn debug_enabled() -> bool {
    matches!(std::env::var("AFK_DEBUG").as_deref(), Ok("1") | Ok("true"))
}

/// `AFK_MOCK_ORACLE=1` swaps the subprocess oracle client for a
/// deterministic stub. Intended for integration tests, never
/// production.
pub fn mock_oracle_enabled() -> bool {
    matches!(std::env::var("AFK_MOCK_ORACLE").as_deref(), Ok("1") | Ok("true"))
}
