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

//! The pipeline executor.
//!
//! [`PipelineExecutor::execute_pipeline`] runs a validated pipeline to a
//! terminal status. Scheduling is level-by-level topological release: each
//! round computes the ready set (pending tasks whose dependencies are all
//! satisfied), dispatches every ready task concurrently behind a semaphore
//! sized by the pipeline's concurrency bound, waits for the wave to reach
//! terminal states, propagates failures to descendants, and repeats.
//!
//! Task-level failures never escape: they are recorded on the task
//! execution and drive status transitions. Run-level failures (deadlock,
//! pipeline timeout) become the run's error summary, and the run is
//! returned with status `failed`. The executor errors out only when the
//! graph it was handed contains a cycle, which means the validator was
//! bypassed.
//!
//! Per-task deadlines race the plugin invocation with a timer; on expiry
//! the in-flight future is dropped (the cooperative abort) and the attempt
//! is recorded as failed. Retries re-enter the concurrency gate after the
//! configured delay, so a retrying task can never exceed the bucket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ExecutionError, PluginError};
use crate::notifier::{NotificationConfig, NotificationContext, Notifier};
use crate::pipeline::{Pipeline, Task, Trigger};
use crate::plugin::{ExecutionContext, PluginRegistry};
use crate::run::{PipelineRun, PluginResult, RunStatus, TaskExecution, TaskStatus};
use crate::store::StateStore;

/// Lifecycle events the executor emits through the notifier.
pub mod events {
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    pub const PIPELINE_SUCCEEDED: &str = "pipeline.succeeded";
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    pub const PIPELINE_CANCELLED: &str = "pipeline.cancelled";
    pub const TASK_FAILED: &str = "task.failed";
}

/// Configuration parameters for executor behavior.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrency bound applied when a pipeline does not carry its own.
    pub max_concurrent_tasks: usize,

    /// Deadline for a single task attempt when the task declares none.
    pub task_timeout: Duration,

    /// Write the run to the state store after every task transition, not
    /// just on start and completion. Costs a store write per transition
    /// but makes crash-time state visible to readers.
    pub flush_task_transitions: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            task_timeout: Duration::from_secs(300),
            flush_task_transitions: true,
        }
    }
}

/// Dependency-aware, bounded-concurrency task runner.
pub struct PipelineExecutor {
    registry: Arc<PluginRegistry>,
    store: Arc<dyn StateStore>,
    config: ExecutorConfig,
    notifier: Option<(Arc<Notifier>, Vec<NotificationConfig>)>,
    cancellations: RwLock<HashMap<Uuid, Arc<AtomicBool>>>,
}

/// Shared references a dispatched task carries into its worker.
struct TaskWorker {
    pipeline: Arc<Pipeline>,
    execution_id: Uuid,
    registry: Arc<PluginRegistry>,
    store: Arc<dyn StateStore>,
    gate: Arc<Semaphore>,
    cancel_flag: Arc<AtomicBool>,
    default_timeout: Duration,
    previous_results: HashMap<String, PluginResult>,
}

impl PipelineExecutor {
    pub fn new(
        registry: Arc<PluginRegistry>,
        store: Arc<dyn StateStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            notifier: None,
            cancellations: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a notifier and the configurations describing which sinks
    /// receive which lifecycle events.
    pub fn with_notifier(
        mut self,
        notifier: Arc<Notifier>,
        configs: Vec<NotificationConfig>,
    ) -> Self {
        self.notifier = Some((notifier, configs));
        self
    }

    /// Execute a manually initiated run. See
    /// [`execute_pipeline_with_trigger`](Self::execute_pipeline_with_trigger).
    pub async fn execute_pipeline(
        &self,
        pipeline: &Pipeline,
        execution_id: Uuid,
    ) -> Result<PipelineRun, ExecutionError> {
        self.execute_pipeline_with_trigger(pipeline, execution_id, Trigger::Manual)
            .await
    }

    /// Run the pipeline to completion, recording the trigger that
    /// initiated it.
    ///
    /// Always returns a run record with a terminal status for task-level
    /// failures of any kind; `Err` is reserved for a cyclic graph, which
    /// indicates the validator was bypassed.
    pub async fn execute_pipeline_with_trigger(
        &self,
        pipeline: &Pipeline,
        execution_id: Uuid,
        trigger: Trigger,
    ) -> Result<PipelineRun, ExecutionError> {
        let graph = pipeline.graph();
        if let Some(cycle) = graph.find_cycles().into_iter().next() {
            return Err(ExecutionError::CycleAtRuntime { cycle });
        }

        let pipeline = Arc::new(pipeline.clone());
        let mut run = PipelineRun::new(execution_id, &pipeline, trigger);

        // Disabled tasks count as satisfied for their dependents.
        for task in pipeline.tasks() {
            if !task.enabled() {
                if let Some(execution) = run.task_mut(task.id()) {
                    execution.status = TaskStatus::Skipped;
                }
            }
        }

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancellations
            .write()
            .await
            .insert(execution_id, cancel_flag.clone());

        info!(
            pipeline = %pipeline.name(),
            execution_id = %execution_id,
            tasks = pipeline.tasks().len(),
            "pipeline run started"
        );
        self.persist(&run).await;
        self.emit(events::PIPELINE_STARTED, &run, None).await;

        let deadline = (pipeline.timeout_ms() > 0)
            .then(|| tokio::time::Instant::now() + Duration::from_millis(pipeline.timeout_ms()));
        let gate_size = if pipeline.concurrency() > 0 {
            pipeline.concurrency()
        } else {
            self.config.max_concurrent_tasks
        };
        let gate = Arc::new(Semaphore::new(gate_size));

        loop {
            if run.tasks.iter().all(|t| t.status.is_terminal()) {
                break;
            }

            if cancel_flag.load(Ordering::Relaxed) {
                info!(execution_id = %execution_id, "cancellation requested; pruning pending tasks");
                for execution in run.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                    execution.finish(TaskStatus::Cancelled, None);
                }
                run.status = RunStatus::Cancelled;
                break;
            }

            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    let timeout = ExecutionError::PipelineTimeout {
                        timeout_ms: pipeline.timeout_ms(),
                    };
                    error!(execution_id = %execution_id, "{timeout}");
                    for execution in run.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                        execution.finish(
                            TaskStatus::Skipped,
                            Some(PluginResult::fail("pipeline timed out")),
                        );
                    }
                    run.error = Some(timeout.to_string());
                    break;
                }
            }

            let ready: Vec<Task> = pipeline
                .tasks()
                .iter()
                .filter(|task| {
                    run.task(task.id())
                        .map_or(false, |e| e.status == TaskStatus::Pending)
                        && task.depends_on().iter().all(|dep| {
                            run.task(dep).map_or(false, |d| d.status.satisfies_dependents())
                        })
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                // The validator forbids cycles, so landing here means a
                // dependency chain leads through a missing task.
                let stuck: Vec<String> = run
                    .tasks
                    .iter()
                    .filter(|t| !t.status.is_terminal())
                    .map(|t| t.task_id.clone())
                    .collect();
                let deadlock = ExecutionError::Deadlock {
                    tasks: stuck.clone(),
                };
                error!(execution_id = %execution_id, "{deadlock}");
                for task_id in &stuck {
                    if let Some(execution) = run.task_mut(task_id) {
                        execution.finish(
                            TaskStatus::Skipped,
                            Some(PluginResult::fail("unsatisfiable dependencies")),
                        );
                    }
                }
                run.error = Some(deadlock.to_string());
                break;
            }

            let previous_results: HashMap<String, PluginResult> = run
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Success)
                .filter_map(|t| t.result.clone().map(|r| (t.task_id.clone(), r)))
                .collect();

            let mut wave: Vec<(String, JoinHandle<TaskExecution>)> =
                Vec::with_capacity(ready.len());
            for task in ready {
                let Some(execution) = run.task(task.id()).cloned() else {
                    continue;
                };
                let worker = TaskWorker {
                    pipeline: pipeline.clone(),
                    execution_id,
                    registry: self.registry.clone(),
                    store: self.store.clone(),
                    gate: gate.clone(),
                    cancel_flag: cancel_flag.clone(),
                    default_timeout: self.config.task_timeout,
                    previous_results: previous_results.clone(),
                };
                let task_id = task.id().to_string();
                wave.push((task_id, tokio::spawn(run_task(worker, task, execution))));
            }

            for (task_id, handle) in wave {
                let finished = match handle.await {
                    Ok(finished) => finished,
                    Err(join_error) => {
                        let join = ExecutionError::Join(join_error.to_string());
                        error!(task = %task_id, error = %join, "task aborted");
                        let mut aborted = match run.task(&task_id).cloned() {
                            Some(e) => e,
                            None => TaskExecution::new(&task_id, &task_id),
                        };
                        aborted.finish(TaskStatus::Failed, Some(PluginResult::fail(join.to_string())));
                        aborted
                    }
                };

                let failed = finished.status == TaskStatus::Failed;
                if let Some(slot) = run.task_mut(&task_id) {
                    *slot = finished;
                }
                if self.config.flush_task_transitions {
                    self.persist(&run).await;
                }

                if failed {
                    self.emit(events::TASK_FAILED, &run, Some(&task_id)).await;
                    for descendant in graph.descendants(&task_id) {
                        if let Some(execution) = run.task_mut(&descendant) {
                            if execution.status == TaskStatus::Pending {
                                debug!(
                                    task = %descendant,
                                    ancestor = %task_id,
                                    "skipping descendant of failed task"
                                );
                                execution.finish(
                                    TaskStatus::Skipped,
                                    Some(PluginResult::fail(format!(
                                        "skipped because ancestor '{task_id}' failed"
                                    ))),
                                );
                            }
                        }
                    }
                }
            }
        }

        run.resolve_status();
        self.persist(&run).await;
        self.cancellations.write().await.remove(&execution_id);

        info!(
            pipeline = %pipeline.name(),
            execution_id = %execution_id,
            status = %run.status,
            "pipeline run finished"
        );
        let event = match run.status {
            RunStatus::Success | RunStatus::PartialSuccess => events::PIPELINE_SUCCEEDED,
            RunStatus::Cancelled => events::PIPELINE_CANCELLED,
            _ => events::PIPELINE_FAILED,
        };
        self.emit(event, &run, None).await;

        Ok(run)
    }

    /// Request cancellation of a running execution.
    ///
    /// The executor stops dispatching ready tasks, lets currently running
    /// tasks finish, and marks the run `cancelled`. Returns whether the
    /// execution id was known.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> bool {
        match self.cancellations.read().await.get(&execution_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                info!(execution_id = %execution_id, "cancellation signalled");
                true
            }
            None => false,
        }
    }

    /// Write the run, retrying a failed store operation once.
    async fn persist(&self, run: &PipelineRun) {
        if let Err(first) = self.store.save_pipeline_run(run).await {
            warn!(execution_id = %run.id, error = %first, "state store write failed; retrying once");
            if let Err(second) = self.store.save_pipeline_run(run).await {
                error!(
                    execution_id = %run.id,
                    error = %second,
                    "state store write failed after retry; run record may be stale"
                );
            }
        }
    }

    async fn emit(&self, event: &str, run: &PipelineRun, task_id: Option<&str>) {
        let Some((notifier, configs)) = &self.notifier else {
            return;
        };

        let error = match task_id {
            Some(task_id) => run
                .task(task_id)
                .and_then(|t| t.result.as_ref())
                .and_then(|r| r.error.clone()),
            None => run.error.clone(),
        };
        let context = NotificationContext {
            event: event.to_string(),
            pipeline_name: run.pipeline_name.clone(),
            execution_id: run.id,
            task_id: task_id.map(str::to_string),
            error,
            occurred_at: chrono::Utc::now(),
        };

        for config in configs {
            for result in notifier.send(config, &context).await {
                if !result.success {
                    warn!(
                        sink = %result.service,
                        error = result.error.as_deref().unwrap_or(""),
                        "notification sink failed"
                    );
                }
            }
        }
    }
}

/// Run one task to a terminal state, consuming retry attempts as allowed.
///
/// Each attempt acquires one concurrency token before invoking the plugin
/// and releases it on the attempt's terminal transition, including across
/// the retry delay, so waiting and retrying tasks never hold the gate.
async fn run_task(worker: TaskWorker, task: Task, mut execution: TaskExecution) -> TaskExecution {
    let allowed_attempts = task.retry().map(|r| r.attempts.max(1)).unwrap_or(1);

    loop {
        if worker.cancel_flag.load(Ordering::Relaxed) && execution.attempts == 0 {
            execution.finish(TaskStatus::Cancelled, None);
            return execution;
        }

        let permit = match worker.gate.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                execution.finish(
                    TaskStatus::Failed,
                    Some(PluginResult::fail("concurrency gate closed")),
                );
                return execution;
            }
        };

        execution.start_attempt();
        debug!(
            task = %task.id(),
            attempt = execution.attempts,
            "task state change: pending -> running"
        );

        let attempt = attempt_task(&worker, &task).await;
        drop(permit);

        let failure = match attempt {
            Ok(result) if result.success => {
                execution.finish(TaskStatus::Success, Some(result));
                info!(
                    task = %task.id(),
                    attempts = execution.attempts,
                    "task completed successfully"
                );
                return execution;
            }
            Ok(mut result) => {
                if result.error.is_none() {
                    result.error = Some("plugin reported failure".to_string());
                }
                result
            }
            Err(error) => PluginResult::fail(error.to_string()),
        };

        if execution.attempts < allowed_attempts && !worker.cancel_flag.load(Ordering::Relaxed) {
            let delay = task.retry().map(|r| r.delay()).unwrap_or_default();
            warn!(
                task = %task.id(),
                attempt = execution.attempts,
                error = failure.error.as_deref().unwrap_or(""),
                delay_ms = delay.as_millis() as u64,
                "task failed; scheduling retry"
            );
            execution.reset_for_retry();
            tokio::time::sleep(delay).await;
            if worker.cancel_flag.load(Ordering::Relaxed) {
                execution.finish(TaskStatus::Failed, Some(failure));
                return execution;
            }
            continue;
        }

        error!(
            task = %task.id(),
            error = failure.error.as_deref().unwrap_or(""),
            "task failed"
        );
        execution.finish(TaskStatus::Failed, Some(failure));
        return execution;
    }
}

/// One attempt: resolve the plugin, build the context, invoke under the
/// deadline. Deadline expiry drops the in-flight future.
async fn attempt_task(worker: &TaskWorker, task: &Task) -> Result<PluginResult, ExecutionError> {
    let plugin = worker
        .registry
        .resolve(task.plugin())
        .ok_or_else(|| PluginError::Unknown(task.plugin().to_string()))?;

    let context = ExecutionContext::new(
        worker.pipeline.clone(),
        task.clone(),
        worker.execution_id,
        worker.store.clone(),
        worker.previous_results.clone(),
    );

    let timeout = task.timeout().unwrap_or(worker.default_timeout);
    match tokio::time::timeout(timeout, plugin.execute(task.config(), &context)).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(plugin_error)) => Err(plugin_error.into()),
        Err(_) => Err(ExecutionError::TaskTimeout {
            task: task.id().to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
