/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Cron-driven pipeline scheduling.
//!
//! The [`Scheduler`] keeps a persistent catalogue of `(pipeline, cron
//! trigger)` entries under the `scheduler:job:` key prefix of the state
//! store. Each armed entry gets its own timer task that computes the next
//! occurrence from the five-field cron expression in the trigger's
//! timezone (UTC by default), sleeps until then, and fires the executor
//! with a fresh execution id. A firing that arrives while the entry's
//! previous run is still in flight is dropped and logged, never queued.
//!
//! Entries are stored with a full pipeline snapshot so the catalogue
//! survives restart without reloading configuration files. `start`
//! re-arms every enabled persisted entry and a daily housekeeping timer
//! that expires old runs from the ledger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::executor::PipelineExecutor;
use crate::pipeline::{Pipeline, Trigger};
use crate::store::StateStore;

/// Key prefix for persisted scheduler entries.
pub const SCHEDULER_KEY_PREFIX: &str = "scheduler:job:";

fn entry_key(id: Uuid) -> String {
    format!("{SCHEDULER_KEY_PREFIX}{id}")
}

/// Configuration parameters for scheduler behavior.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Runs older than this are expired by housekeeping.
    pub retention_days: u32,
    /// How often housekeeping runs.
    pub housekeeping_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            housekeeping_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A persisted cron-plus-pipeline record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEntry {
    pub id: Uuid,
    /// Full snapshot, so the entry survives restart on its own.
    pub pipeline: Pipeline,
    pub trigger: Trigger,
    pub enabled: bool,
}

/// Best-effort snapshot of scheduler state.
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub running: bool,
    pub entry_count: usize,
    /// Up to five upcoming fires across all enabled entries, soonest first.
    pub next_runs: Vec<UpcomingRun>,
}

#[derive(Debug, Clone)]
pub struct UpcomingRun {
    pub entry_id: Uuid,
    pub pipeline_name: String,
    pub at: DateTime<Utc>,
}

struct SchedulerInner {
    running: bool,
    entries: HashMap<Uuid, SchedulerEntry>,
    timers: HashMap<Uuid, JoinHandle<()>>,
    housekeeping: Option<JoinHandle<()>>,
}

/// Persistent catalogue of recurring triggers.
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    executor: Arc<PipelineExecutor>,
    config: SchedulerConfig,
    inner: Mutex<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: Arc<PipelineExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            inner: Mutex::new(SchedulerInner {
                running: false,
                entries: HashMap::new(),
                timers: HashMap::new(),
                housekeeping: None,
            }),
        }
    }

    /// Create, persist, and (when the scheduler is running) arm an entry.
    ///
    /// Only cron triggers are accepted; the expression and timezone are
    /// validated up front so a bad entry never reaches the catalogue.
    pub async fn schedule_pipeline(
        &self,
        pipeline: &Pipeline,
        trigger: Trigger,
    ) -> Result<Uuid, SchedulerError> {
        let Trigger::Cron {
            expression,
            timezone,
        } = &trigger
        else {
            return Err(SchedulerError::NotCron(trigger.kind().to_string()));
        };
        parse_cron(expression)?;
        parse_timezone(timezone.as_deref())?;

        let entry = SchedulerEntry {
            id: Uuid::new_v4(),
            pipeline: pipeline.clone(),
            trigger,
            enabled: true,
        };

        let encoded = serde_json::to_value(&entry).map_err(crate::error::StateError::from)?;
        self.store.set(&entry_key(entry.id), encoded).await?;

        let mut inner = self.inner.lock().await;
        if inner.running {
            self.arm_entry(&mut inner, &entry);
        }
        info!(
            entry_id = %entry.id,
            pipeline = %entry.pipeline.name(),
            armed = inner.running,
            "pipeline scheduled"
        );
        let entry_id = entry.id;
        inner.entries.insert(entry_id, entry);

        Ok(entry_id)
    }

    /// Stop the timer and remove the entry from memory and from the state
    /// store. Returns whether an entry was removed.
    pub async fn unschedule_pipeline(&self, entry_id: Uuid) -> Result<bool, SchedulerError> {
        let key = entry_key(entry_id);
        let persisted = self.store.get(&key).await?.is_some();
        self.store.delete(&key).await?;

        let mut inner = self.inner.lock().await;
        let known = inner.entries.remove(&entry_id).is_some();
        if let Some(timer) = inner.timers.remove(&entry_id) {
            timer.abort();
        }

        let removed = persisted || known;
        if removed {
            info!(entry_id = %entry_id, "pipeline unscheduled");
        }
        Ok(removed)
    }

    /// Load the persisted catalogue, arm every enabled entry and the
    /// housekeeping timer. Idempotent: a second call warns and returns.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        if inner.running {
            warn!("scheduler already running; start ignored");
            return Ok(());
        }

        for key in self.store.list(SCHEDULER_KEY_PREFIX).await? {
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            let entry: SchedulerEntry = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    // One bad entry must not keep the rest from loading.
                    warn!(key = %key, error = %e, "skipping corrupt scheduler entry");
                    continue;
                }
            };
            if entry.enabled {
                self.arm_entry(&mut inner, &entry);
            }
            inner.entries.insert(entry.id, entry);
        }

        let store = self.store.clone();
        let retention_days = self.config.retention_days;
        let interval = self.config.housekeeping_interval;
        inner.housekeeping = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.cleanup_old_runs(retention_days).await {
                    Ok(deleted) => info!(deleted, retention_days, "expired old pipeline runs"),
                    Err(e) => warn!(error = %e, "run housekeeping failed"),
                }
            }
        }));

        inner.running = true;
        info!(entries = inner.entries.len(), "scheduler started");
        Ok(())
    }

    /// Stop every armed timer and the housekeeping timer.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }
        if let Some(housekeeping) = inner.housekeeping.take() {
            housekeeping.abort();
        }
        inner.running = false;
        info!("scheduler stopped");
    }

    /// Best-effort snapshot of upcoming fire times.
    pub async fn get_status(&self) -> SchedulerStatus {
        let inner = self.inner.lock().await;

        let mut next_runs: Vec<UpcomingRun> = inner
            .entries
            .values()
            .filter(|entry| entry.enabled)
            .filter_map(|entry| match &entry.trigger {
                Trigger::Cron {
                    expression,
                    timezone,
                } => next_occurrence(expression, timezone.as_deref())
                    .ok()
                    .map(|at| UpcomingRun {
                        entry_id: entry.id,
                        pipeline_name: entry.pipeline.name().to_string(),
                        at,
                    }),
                _ => None,
            })
            .collect();
        next_runs.sort_by_key(|r| r.at);
        next_runs.truncate(5);

        SchedulerStatus {
            running: inner.running,
            entry_count: inner.entries.len(),
            next_runs,
        }
    }

    fn arm_entry(&self, inner: &mut SchedulerInner, entry: &SchedulerEntry) {
        if let Some(stale) = inner.timers.remove(&entry.id) {
            stale.abort();
        }
        let handle = tokio::spawn(run_entry_timer(entry.clone(), self.executor.clone()));
        inner.timers.insert(entry.id, handle);
    }
}

/// Timer loop for one armed entry.
async fn run_entry_timer(entry: SchedulerEntry, executor: Arc<PipelineExecutor>) {
    let Trigger::Cron {
        ref expression,
        ref timezone,
    } = entry.trigger
    else {
        return;
    };
    let (cron, tz) = match (parse_cron(expression), parse_timezone(timezone.as_deref())) {
        (Ok(cron), Ok(tz)) => (cron, tz),
        (Err(e), _) | (_, Err(e)) => {
            error!(entry_id = %entry.id, error = %e, "cannot arm scheduler entry");
            return;
        }
    };

    let in_flight = Arc::new(Mutex::new(()));

    loop {
        let now = Utc::now().with_timezone(&tz);
        let next = match cron.find_next_occurrence(&now, false) {
            Ok(next) => next,
            Err(e) => {
                error!(entry_id = %entry.id, error = %e, "no further occurrences; disarming");
                return;
            }
        };
        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        debug!(
            entry_id = %entry.id,
            pipeline = %entry.pipeline.name(),
            at = %next,
            "armed next fire"
        );
        tokio::time::sleep(wait).await;

        match in_flight.clone().try_lock_owned() {
            Ok(guard) => {
                let executor = executor.clone();
                let pipeline = entry.pipeline.clone();
                let trigger = entry.trigger.clone();
                let entry_id = entry.id;
                tokio::spawn(async move {
                    let _in_flight = guard;
                    let execution_id = Uuid::new_v4();
                    info!(
                        entry_id = %entry_id,
                        pipeline = %pipeline.name(),
                        execution_id = %execution_id,
                        "cron fire"
                    );
                    match executor
                        .execute_pipeline_with_trigger(&pipeline, execution_id, trigger)
                        .await
                    {
                        Ok(run) => info!(
                            entry_id = %entry_id,
                            execution_id = %execution_id,
                            status = %run.status,
                            "scheduled run finished"
                        ),
                        Err(e) => error!(
                            entry_id = %entry_id,
                            execution_id = %execution_id,
                            error = %e,
                            "scheduled run could not execute"
                        ),
                    }
                });
            }
            Err(_) => {
                warn!(
                    entry_id = %entry.id,
                    pipeline = %entry.pipeline.name(),
                    "previous firing still running; dropping this fire"
                );
            }
        }
    }
}

/// Parse a five-field cron expression.
pub(crate) fn parse_cron(expression: &str) -> Result<Cron, SchedulerError> {
    if expression.split_whitespace().count() != 5 {
        return Err(SchedulerError::InvalidExpression {
            expression: expression.to_string(),
            message: "expected five whitespace-separated fields".to_string(),
        });
    }
    Cron::new(expression)
        .parse()
        .map_err(|e| SchedulerError::InvalidExpression {
            expression: expression.to_string(),
            message: e.to_string(),
        })
}

/// Resolve the trigger timezone, defaulting to UTC.
pub(crate) fn parse_timezone(timezone: Option<&str>) -> Result<Tz, SchedulerError> {
    match timezone {
        None => Ok(chrono_tz::UTC),
        Some(name) => name
            .parse()
            .map_err(|_| SchedulerError::InvalidTimezone(name.to_string())),
    }
}

/// Next fire time of an expression, in UTC.
pub(crate) fn next_occurrence(
    expression: &str,
    timezone: Option<&str>,
) -> Result<DateTime<Utc>, SchedulerError> {
    let cron = parse_cron(expression)?;
    let tz = parse_timezone(timezone)?;
    let now = Utc::now().with_timezone(&tz);
    cron.find_next_occurrence(&now, false)
        .map(|next| next.with_timezone(&Utc))
        .map_err(|e| SchedulerError::InvalidExpression {
            expression: expression.to_string(),
            message: e.to_string(),
        })
}
