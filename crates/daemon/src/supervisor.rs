// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Composition root: wires the storage layer and every engine module
//! into one running supervisor, and owns the startup/shutdown sequence
//! (§6's on-disk layout) around them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use afk_adapters::{CachingOracleClient, CommandWorkerSpawner, LogManager, NixProbe, OracleClient, ProcessMonitor, SubprocessOracleClient};
use afk_core::{Session, SessionId, SupervisorError, SystemClock};
use afk_engine::{CircuitBreaker, CleanupEngine, IterationEngine, IterationEngineConfig, JobSubmitter, RetentionPolicy, ScheduleEngine, WorkerCommand};
use afk_storage::{ProgressTracker, SessionStore};
use async_trait::async_trait;

use crate::env;
use crate::lifecycle::{LifecycleError, LifecycleManager};
use crate::mock_oracle::MockOracleClient;

/// On-disk layout (§6), all rooted at one user-scoped state directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub socket_path: PathBuf,
    pub lock_path: PathBuf,
    pub version_path: PathBuf,
    pub log_path: PathBuf,
    pub store_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub progress_dir: PathBuf,
    pub audit_log_path: PathBuf,
    pub legacy_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self, LifecycleError> {
        let state_dir = env::state_dir()?;
        Ok(Self {
            socket_path: state_dir.join("daemon.sock"),
            lock_path: state_dir.join("daemon.pid"),
            version_path: state_dir.join("daemon.version"),
            log_path: state_dir.join("daemon.log"),
            store_dir: state_dir.join("store"),
            logs_dir: state_dir.join("logs"),
            progress_dir: state_dir.join("progress"),
            audit_log_path: state_dir.join("audit").join("cleanup-audit.log"),
            legacy_dir: state_dir.join("legacy_registry"),
            state_dir,
        })
    }
}

type ProductionIteration = IterationEngine<SystemClock, NixProbe>;

/// Selects between the real subprocess oracle and the deterministic
/// mock at startup, per the `AFK_MOCK_ORACLE` environment input (§6).
/// A runtime enum rather than a second generic parameter on
/// [`ScheduleEngine`], since the choice is made once, from an
/// environment variable, not per call.
pub(crate) enum ProductionOracle {
    Real(CachingOracleClient<SubprocessOracleClient>),
    Mock(MockOracleClient),
}

#[async_trait]
impl OracleClient for ProductionOracle {
    async fn parse_cron(&self, input: &str, reference_time_iso: &str) -> Result<afk_adapters::CronPlan, afk_adapters::OracleError> {
        match self {
            ProductionOracle::Real(o) => o.parse_cron(input, reference_time_iso).await,
            ProductionOracle::Mock(o) => o.parse_cron(input, reference_time_iso).await,
        }
    }

    async fn analyze_complexity(&self, task: &str) -> Result<afk_adapters::ComplexityPlan, afk_adapters::OracleError> {
        match self {
            ProductionOracle::Real(o) => o.analyze_complexity(task).await,
            ProductionOracle::Mock(o) => o.analyze_complexity(task).await,
        }
    }

    async fn is_available(&self) -> bool {
        match self {
            ProductionOracle::Real(o) => o.is_available().await,
            ProductionOracle::Mock(o) => o.is_available().await,
        }
    }
}

/// Satisfies [`JobSubmitter`] for the Schedule Engine by routing through
/// the Lifecycle Manager and the Iteration Engine exactly as a direct
/// `submit` request would, except the caller never awaits the run.
pub(crate) struct DaemonSubmitter {
    lifecycle: Arc<LifecycleManager<SystemClock>>,
    iteration: Arc<ProductionIteration>,
    working_dir: PathBuf,
}

#[async_trait]
impl JobSubmitter for DaemonSubmitter {
    async fn submit(&self, command: &str) -> Result<SessionId, SupervisorError> {
        let (iterations, _model) = self.iteration.plan(command).await;
        let session = self
            .lifecycle
            .create(command, self.working_dir.clone(), iterations)
            .map_err(|e| SupervisorError::WorkerSpawnFailed(e.to_string()))?;

        let engine = Arc::clone(&self.iteration);
        let id = session.id.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run(id).await {
                tracing::error!(error = %e, "scheduled session run ended in a store error");
            }
        });
        Ok(session.id)
    }
}

/// The running supervisor: every component from §4, held by the
/// listener and the background maintenance tasks spawned in `main`.
pub struct Supervisor {
    pub config: Config,
    pub store: Arc<SessionStore>,
    pub lifecycle: Arc<LifecycleManager<SystemClock>>,
    pub iteration: Arc<ProductionIteration>,
    pub cleanup: Arc<CleanupEngine<SystemClock>>,
    pub schedule: Arc<ScheduleEngine<ProductionOracle, DaemonSubmitter, SystemClock>>,
    pub start_time: Instant,
}

impl Supervisor {
    /// Opens the store, wires every engine, reconciles state left over
    /// from a previous run, and re-arms persisted schedules. Does not
    /// bind the socket; that happens last, in `main`, once this
    /// succeeds.
    pub fn start(config: Config) -> Result<Self, LifecycleError> {
        for dir in [&config.store_dir, &config.logs_dir, &config.progress_dir, &config.legacy_dir] {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(parent) = config.audit_log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Arc::new(SessionStore::open(&config.store_dir)?);
        let clock = SystemClock;
        let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&store), clock));

        let progress = Arc::new(ProgressTracker::new(config.progress_dir.clone(), clock));
        let logs = Arc::new(LogManager::new(config.logs_dir.clone(), clock));
        let monitor = Arc::new(ProcessMonitor::new(NixProbe, "afk-worker"));
        let breaker = Arc::new(CircuitBreaker::new(clock));
        let spawner: Arc<dyn afk_adapters::WorkerSpawner> = Arc::new(CommandWorkerSpawner);

        let shared_oracle = Arc::new(if env::mock_oracle_enabled() {
            ProductionOracle::Mock(MockOracleClient)
        } else {
            ProductionOracle::Real(CachingOracleClient::new(SubprocessOracleClient::new("afk-oracle", Vec::new()), clock))
        });
        let oracle: Arc<dyn OracleClient> = shared_oracle.clone();
        let schedule_oracle = shared_oracle;

        let iteration_config = IterationEngineConfig {
            worker: WorkerCommand { program: "afk-worker".to_string(), args: Vec::new() },
            ..Default::default()
        };

        let iteration = Arc::new(IterationEngine::new(
            Arc::clone(&store),
            progress,
            logs,
            monitor,
            breaker,
            spawner,
            oracle,
            clock,
            iteration_config,
        ));

        let submitter = Arc::new(DaemonSubmitter {
            lifecycle: Arc::clone(&lifecycle),
            iteration: Arc::clone(&iteration),
            working_dir: config.state_dir.clone(),
        });
        let schedule = Arc::new(ScheduleEngine::new(Arc::clone(&store), schedule_oracle, submitter, clock));

        let cleanup = Arc::new(
            CleanupEngine::new(Arc::clone(&store), config.logs_dir.clone(), config.audit_log_path.clone(), RetentionPolicy::default(), clock)
                .with_legacy_dir(config.legacy_dir.clone()),
        );

        match iteration.recover() {
            Ok(resumed) if !resumed.is_empty() => tracing::info!(count = resumed.len(), "reattached sessions after restart"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "session recovery failed"),
        }
        schedule.restore()?;

        Ok(Self { config, store, lifecycle, iteration, cleanup, schedule, start_time: Instant::now() })
    }

    /// Submits a task directly (§6 `submit`): plans iterations via the
    /// Oracle Gateway/heuristic fallback unless the caller pinned a
    /// count, creates the session, and spawns its run in the
    /// background. Returns as soon as the session exists.
    pub async fn submit(&self, task: &str, working_dir: PathBuf, iterations_planned: Option<u32>) -> Result<Session, LifecycleError> {
        let planned = match iterations_planned {
            Some(n) => n,
            None => self.iteration.plan(task).await.0,
        };
        let session = self.lifecycle.create(task, working_dir, planned)?;

        let engine = Arc::clone(&self.iteration);
        let id = session.id.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run(id).await {
                tracing::error!(error = %e, "session run ended in a store error");
            }
        });
        Ok(session)
    }

    pub fn stop(&self, id: &SessionId) {
        self.iteration.cancel(id);
    }

    /// Flushes the WAL and shuts down every background timer. Called
    /// once, on the way out of `main`.
    pub fn shutdown(&self) {
        self.schedule.shutdown();
        if let Err(e) = self.store.flush() {
            tracing::warn!(error = %e, "failed to flush store during shutdown");
        }
    }
}
