// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Schedule Engine (§4.H): materializes stored cron jobs into
//! supervisor submissions. One Tokio task per enabled schedule sleeps
//! until its computed `next_run`, fires, recomputes, and loops.

use crate::cron::CronSchedule;
use afk_adapters::OracleClient;
use afk_core::{
    Clock, Schedule, ScheduleId, ScheduleResult, ScheduleType, SessionId, SupervisorError,
    SystemClock,
};
use afk_storage::{SessionStore, StoreError};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Materializes a schedule's `command` into a supervisor submission when
/// the schedule fires. Kept as a seam (rather than a direct dependency
/// on the iteration engine) so the schedule engine can be tested without
/// spinning up a real worker pipeline.
#[async_trait]
pub trait JobSubmitter: Send + Sync + 'static {
    async fn submit(&self, command: &str) -> Result<SessionId, SupervisorError>;
}

pub struct CreateOptions {
    pub command: String,
    pub timezone: String,
    pub enabled: bool,
}

/// Cron-driven materialization of stored jobs (§4.H).
pub struct ScheduleEngine<O: OracleClient, J: JobSubmitter, C: Clock = SystemClock> {
    store: Arc<SessionStore>,
    oracle: Arc<O>,
    submitter: Arc<J>,
    clock: C,
    tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl<O: OracleClient, J: JobSubmitter, C: Clock> ScheduleEngine<O, J, C> {
    pub fn new(store: Arc<SessionStore>, oracle: Arc<O>, submitter: Arc<J>, clock: C) -> Self {
        Self { store, oracle, submitter, clock, tasks: Mutex::new(HashMap::new()) }
    }

    /// Consults the Oracle Gateway for `{cron, type, explanation}`,
    /// validates the result, persists the schedule, and (if enabled)
    /// starts its timer task.
    pub async fn create(&self, natural_language: &str, options: CreateOptions) -> Result<Schedule, StoreError> {
        let reference_iso = iso_now(self.clock.now_ms());
        let plan = self
            .oracle
            .parse_cron(natural_language, &reference_iso)
            .await
            .map_err(|e| SupervisorError::OracleUnavailable(e.to_string()))?;

        CronSchedule::parse(&plan.cron).map_err(|e| SupervisorError::OracleInvalidResponse(e.to_string()))?;

        let id = ScheduleId::new(Uuid::new_v4().to_string());
        let mut schedule =
            Schedule::new(id.clone(), natural_language, &plan.cron, &options.command, &options.timezone, self.clock.now_ms());
        schedule.schedule_type = plan.schedule_type;
        schedule.enabled = options.enabled;

        self.store.create_schedule(schedule.clone())?;
        if options.enabled {
            self.activate(schedule.clone());
        }
        Ok(schedule)
    }

    pub fn list(&self) -> Result<Vec<Schedule>, StoreError> {
        self.store.list_schedules()
    }

    /// Stops a schedule's timer task without deleting it from the store.
    pub fn stop(&self, id: &ScheduleId) -> Result<(), StoreError> {
        self.store.set_schedule_enabled(id, false)?;
        if let Some(task) = self.tasks.lock().remove(id.as_str()) {
            task.abort();
        }
        Ok(())
    }

    pub fn delete(&self, id: &ScheduleId) -> Result<(), StoreError> {
        if let Some(task) = self.tasks.lock().remove(id.as_str()) {
            task.abort();
        }
        match self.store.delete_schedule(id) {
            Ok(()) => Ok(()),
            Err(StoreError::Supervisor(SupervisorError::NotFound(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// On start, load every persisted schedule and activate the enabled
    /// ones, re-deriving `next_run` rather than trusting a stale value.
    pub fn restore(&self) -> Result<(), StoreError> {
        for schedule in self.store.list_schedules()? {
            if schedule.enabled {
                self.activate(schedule);
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }

    fn activate(&self, schedule: Schedule) {
        let Ok(tz) = schedule.timezone.parse::<chrono_tz::Tz>() else {
            warn!(schedule_id = %schedule.id, timezone = %schedule.timezone, "unknown timezone, schedule will not run");
            return;
        };
        let Ok(cron) = CronSchedule::parse(&schedule.cron) else {
            warn!(schedule_id = %schedule.id, cron = %schedule.cron, "unparseable cron, schedule will not run");
            return;
        };

        let store = Arc::clone(&self.store);
        let submitter = Arc::clone(&self.submitter);
        let id = schedule.id.clone();
        let command = schedule.command.clone();
        let once = schedule.schedule_type == ScheduleType::Once;

        let handle = tokio::spawn(async move {
            loop {
                let now_utc = Utc::now();
                let now_tz = now_utc.with_timezone(&tz);
                let Some(next) = cron.next_occurrence(&now_tz) else {
                    warn!(schedule_id = %id, "cron expression has no future occurrence, stopping timer");
                    return;
                };
                let next_utc = next.with_timezone(&Utc);
                let next_ms = next_utc.timestamp_millis().max(0) as u64;
                if store.set_schedule_next_run(&id, Some(next_ms)).is_err() {
                    return;
                }

                let sleep_for = next_utc.signed_duration_since(now_utc).to_std().unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(sleep_for).await;

                let started = std::time::Instant::now();
                let fire_at_ms = Utc::now().timestamp_millis().max(0) as u64;
                let outcome = submitter.submit(&command).await;
                let (result, spawned_session_id) = match &outcome {
                    Ok(session_id) => (
                        ScheduleResult {
                            success: true,
                            output: Some(session_id.to_string()),
                            error: None,
                            duration_ms: started.elapsed().as_millis() as u64,
                        },
                        Some(session_id.clone()),
                    ),
                    Err(e) => {
                        error!(schedule_id = %id, error = %e, "scheduled submission failed");
                        (
                            ScheduleResult {
                                success: false,
                                output: None,
                                error: Some(e.to_string()),
                                duration_ms: started.elapsed().as_millis() as u64,
                            },
                            None,
                        )
                    }
                };
                if store.record_schedule_fired(&id, fire_at_ms, result, spawned_session_id).is_err() {
                    return;
                }
                info!(schedule_id = %id, "schedule fired");

                if once {
                    let _ = store.set_schedule_enabled(&id, false);
                    return;
                }
            }
        });

        self.tasks.lock().insert(schedule.id.to_string(), handle);
    }
}

/// ISO-8601 rendering of the injected clock's current instant, given to
/// the Oracle Gateway as the reference time for relative phrases like
/// "every weekday at 9am".
fn iso_now(now_ms: u64) -> String {
    chrono::DateTime::<Utc>::from_timestamp_millis(now_ms as i64).unwrap_or_else(Utc::now).to_rfc3339()
}

#[cfg(test)]
#[path = "schedule_tests.rs"]
mod tests;
