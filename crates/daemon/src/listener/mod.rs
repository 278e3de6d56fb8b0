// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Listener task for socket I/O. Accepts connections without blocking
//! the rest of the daemon; each connection is one request/response
//! cycle against the Observable supervisor API (§6).

use std::sync::Arc;
use std::time::Instant;

use afk_core::{ScheduleId, SessionId};
use afk_engine::CreateOptions;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::protocol::{self, LifecycleStats, Request, Response, ScheduleSummary, DEFAULT_TIMEOUT};
use crate::supervisor::Supervisor;

/// Shared daemon context every connection's request handler reads from.
pub struct ListenCtx {
    pub supervisor: Arc<Supervisor>,
    pub start_time: Instant,
    pub shutdown: Arc<Notify>,
}

pub struct Listener {
    socket: UnixListener,
    ctx: Arc<ListenCtx>,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
}

impl Listener {
    pub fn new(socket: UnixListener, ctx: Arc<ListenCtx>) -> Self {
        Self { socket, ctx }
    }

    /// Accepts connections until the process exits. Each connection gets
    /// its own task so one slow or misbehaving client can't stall the
    /// rest.
    pub async fn run(self) {
        loop {
            match self.socket.accept().await {
                Ok((stream, _addr)) => {
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, ctx).await {
                            debug!(error = %e, "connection ended with an error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection, listener stopping");
                    return;
                }
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, ctx: Arc<ListenCtx>) -> Result<(), ConnectionError> {
    let request = protocol::read_request(&mut stream, DEFAULT_TIMEOUT).await?;
    let response = handle_request(request, &ctx).await;
    protocol::write_response(&mut stream, &response, DEFAULT_TIMEOUT).await?;
    Ok(())
}

async fn handle_request(request: Request, ctx: &ListenCtx) -> Response {
    let supervisor = &ctx.supervisor;
    match request {
        Request::Ping => Response::Pong,

        Request::Submit { task, working_dir, iterations_planned } => match supervisor.submit(&task, working_dir, iterations_planned).await {
            Ok(session) => Response::Session(session),
            Err(e) => Response::Error { message: e.to_string() },
        },

        Request::Stop { id } => {
            supervisor.stop(&SessionId::new(id));
            Response::Ack
        }

        // `resume` re-arms a terminal session under a fresh id rather than
        // mutating the old one: terminal statuses are immutable sinks
        // (§8), so there is no legal transition back to `running`.
        Request::Resume { id } => match supervisor.store.get_session(&SessionId::new(id)) {
            Ok(session) => match supervisor.submit(&session.task, session.working_dir.clone(), Some(session.iterations_planned)).await {
                Ok(new_session) => Response::Session(new_session),
                Err(e) => Response::Error { message: e.to_string() },
            },
            Err(e) => Response::Error { message: e.to_string() },
        },

        Request::Get { id } => match supervisor.store.get_session(&SessionId::new(id)) {
            Ok(session) => Response::Session(session),
            Err(e) => Response::Error { message: e.to_string() },
        },

        Request::List { status } => {
            let result = match status {
                Some(status) => supervisor.store.list_sessions_by_status(status),
                None => supervisor.store.list_sessions(),
            };
            match result {
                Ok(sessions) => Response::Sessions(sessions),
                Err(e) => Response::Error { message: e.to_string() },
            }
        }

        Request::Tail { id, lines } => match supervisor.store.get_session(&SessionId::new(id.clone())) {
            Ok(_) => Response::Tail { lines: tail_log(&supervisor.config.logs_dir.join(format!("{id}.log")), lines) },
            Err(e) => Response::Error { message: e.to_string() },
        },

        Request::Stats => match supervisor.lifecycle.stats() {
            Ok(stats) => Response::Stats(LifecycleStats::from(stats)),
            Err(e) => Response::Error { message: e.to_string() },
        },

        Request::Cleanup { dry_run } => Response::CleanupSummary(supervisor.cleanup.sweep(dry_run)),

        Request::ScheduleCreate { description, command, timezone, enabled } => {
            match supervisor.schedule.create(&description, CreateOptions { command, timezone, enabled }).await {
                Ok(schedule) => Response::Schedule(ScheduleSummary::from(&schedule)),
                Err(e) => Response::Error { message: e.to_string() },
            }
        }

        Request::ScheduleList => match supervisor.schedule.list() {
            Ok(schedules) => Response::Schedules(schedules.iter().map(ScheduleSummary::from).collect()),
            Err(e) => Response::Error { message: e.to_string() },
        },

        Request::ScheduleStop { id } => match supervisor.schedule.stop(&ScheduleId::new(id)) {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error { message: e.to_string() },
        },

        Request::ScheduleDelete { id } => match supervisor.schedule.delete(&ScheduleId::new(id)) {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error { message: e.to_string() },
        },

        Request::Shutdown => {
            ctx.shutdown.notify_one();
            Response::Ack
        }
    }
}

/// Returns the last `lines` lines of a log file, or an empty vec if it
/// doesn't exist yet (the worker hasn't produced output, or the log was
/// already rotated away).
fn tail_log(path: &std::path::Path, lines: usize) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(path) else { return Vec::new() };
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
