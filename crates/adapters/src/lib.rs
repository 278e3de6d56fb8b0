// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
// Enable coverage(off) attribute for excluding test infrastructure
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Adapters for external I/O

mod env;
pub mod log;
pub mod oracle;
pub mod process;
pub mod worker;

pub use log::{AppendHandle, FollowHandle, LogError, LogManager, LogStats, SearchMatch, SearchOptions};
pub use oracle::{
    CachingOracleClient, Complexity, ComplexityPlan, CronPlan, OracleClient, OracleError,
    SubprocessOracleClient,
};
pub use process::{NixProbe, ProcessMonitor, ProcessProbe, ProcessRecord, Signal, Validation};
pub use worker::{CommandWorkerSpawner, SpawnError, SpawnSpec, SpawnedChild, WorkerSpawner};

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
pub use oracle::fake::FakeOracleClient;
#[cfg(any(test, feature = "test-support"))]
pub use process::fake::FakeProbe;
#[cfg(any(test, feature = "test-support"))]
pub use worker::fake::{FakeWorkerSpawner, ScriptedSpawn};
