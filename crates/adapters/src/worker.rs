// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker process spawning (§4.F point 3.b). `WorkerSpawner` is the seam the
//! Iteration Engine drives sessions through; it is not tied to any specific
//! worker binary. `CommandWorkerSpawner` shells out via `tokio::process`,
//! mirroring `subprocess::run_with_timeout`'s timeout-wrapped `Command` use
//! but for a long-lived, streamed child rather than a one-shot `output()`.

use afk_core::SessionId;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::warn;

/// Bounded channel capacity for streamed output lines. A worker that writes
/// faster than the log drains buffers up to this many lines, then the
/// oldest-unread line is dropped with a warning rather than stalling the
/// child (§5 backpressure).
const LINE_BUFFER: usize = 4096;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no such worker executable: {0}")]
    NoSuchExecutable(String),
    #[error("spawn failed: {0}")]
    Io(#[from] std::io::Error),
}

/// What to spawn, for one iteration of one session.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub session_id: SessionId,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// A live worker child plus the line streams reading its stdout/stderr.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: u32,
    pub stdout_lines: mpsc::Receiver<String>,
    pub stderr_lines: mpsc::Receiver<String>,
    child: Child,
}

impl SpawnedChild {
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Splits into disjoint mutable borrows of the line streams and the
    /// child handle, so callers can race them (e.g. in `tokio::select!`)
    /// without holding an exclusive borrow of the whole `SpawnedChild`.
    pub fn split_mut(
        &mut self,
    ) -> (&mut mpsc::Receiver<String>, &mut mpsc::Receiver<String>, &mut Child) {
        (&mut self.stdout_lines, &mut self.stderr_lines, &mut self.child)
    }

    /// Best-effort graceful-then-forced kill; tolerates a child that already
    /// exited (§4.D: all kill paths treat "already dead" as success).
    pub async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Spawns the external worker process for one iteration.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    async fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedChild, SpawnError>;
}

/// Production spawner: a real `tokio::process::Command` child with piped
/// stdout/stderr forwarded line-by-line onto bounded channels.
#[derive(Debug, Clone, Default)]
pub struct CommandWorkerSpawner;

#[async_trait]
impl WorkerSpawner for CommandWorkerSpawner {
    async fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedChild, SpawnError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SpawnError::NoSuchExecutable(spec.program.clone())
            } else {
                SpawnError::Io(e)
            }
        })?;

        let pid = child.id().ok_or_else(|| {
            SpawnError::Io(std::io::Error::other("child exited before its pid could be read"))
        })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let (stdout_tx, stdout_lines) = mpsc::channel(LINE_BUFFER);
        let (stderr_tx, stderr_lines) = mpsc::channel(LINE_BUFFER);
        spawn_line_forwarder(stdout, stdout_tx, "stdout");
        spawn_line_forwarder(stderr, stderr_tx, "stderr");

        Ok(SpawnedChild { pid, stdout_lines, stderr_lines, child })
    }
}

fn spawn_line_forwarder(reader: impl tokio::io::AsyncRead + Unpin + Send + 'static, tx: mpsc::Sender<String>, stream: &'static str) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.try_send(line).is_err() {
                        warn!(stream, "worker output buffer full, dropping line");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(stream, error = %e, "error reading worker output");
                    break;
                }
            }
        }
    });
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    /// Canned reply for `FakeWorkerSpawner`: either a successful spawn whose
    /// lines/exit are scripted, or an injected spawn failure.
    #[derive(Clone)]
    pub struct ScriptedSpawn {
        pub stdout: Vec<String>,
        pub stderr: Vec<String>,
        pub exit_code: i32,
        pub pid: u32,
    }

    #[derive(Default)]
    pub struct FakeWorkerSpawner {
        scripts: Mutex<Vec<ScriptedSpawn>>,
        errors: Mutex<Vec<SpawnError>>,
        spawned: Mutex<Vec<SpawnSpec>>,
    }

    impl FakeWorkerSpawner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Scripts are consumed in FIFO order, one per `spawn()` call.
        pub fn push_script(&self, script: ScriptedSpawn) {
            self.scripts.lock().push(script);
        }

        /// Queues a `spawn()` failure, consumed (FIFO, ahead of any scripted
        /// success) before scripts are checked.
        pub fn push_error(&self, error: SpawnError) {
            self.errors.lock().push(error);
        }

        pub fn spawned_specs(&self) -> Vec<SpawnSpec> {
            self.spawned.lock().clone()
        }
    }

    #[async_trait]
    impl WorkerSpawner for FakeWorkerSpawner {
        async fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedChild, SpawnError> {
            self.spawned.lock().push(spec.clone());
            {
                let mut errors = self.errors.lock();
                if !errors.is_empty() {
                    return Err(errors.remove(0));
                }
            }
            let script = {
                let mut scripts = self.scripts.lock();
                if scripts.is_empty() {
                    None
                } else {
                    Some(scripts.remove(0))
                }
            };
            let Some(script) = script else {
                return Err(SpawnError::Io(std::io::Error::other("no scripted spawn available")));
            };

            // Use `/bin/sh -c exit N` as the real underlying child so
            // `SpawnedChild::wait`/`kill` operate on a genuine process; the
            // stdout/stderr seen by callers is the scripted text, not the
            // shell's own (empty) output.
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(format!("exit {}", script.exit_code)).stdout(Stdio::null()).stderr(Stdio::null());
            let child = cmd.spawn()?;

            let (stdout_tx, stdout_lines) = mpsc::channel(LINE_BUFFER);
            let (stderr_tx, stderr_lines) = mpsc::channel(LINE_BUFFER);
            for line in script.stdout {
                let _ = stdout_tx.try_send(line);
            }
            for line in script.stderr {
                let _ = stderr_tx.try_send(line);
            }
            drop(stdout_tx);
            drop(stderr_tx);

            Ok(SpawnedChild { pid: script.pid, stdout_lines, stderr_lines, child })
        }
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
