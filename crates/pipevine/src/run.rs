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

//! Runtime records for pipeline executions.
//!
//! A [`PipelineRun`] is one execution instance of a pipeline: created by the
//! executor, owned by it until a terminal status is reached, and persisted
//! to the state store on start and completion (and optionally after every
//! task transition). [`TaskExecution`]s live inside their run and never
//! exist independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::{Pipeline, Trigger};

/// Status of a single task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the task can make no further progress.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    /// Whether a dependent may start once this is the dependency's status.
    /// Skipped tasks (disabled, or pruned by cancellation) satisfy their
    /// dependents the same way successes do.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Skipped)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a whole pipeline run.
///
/// `PartialSuccess` is part of the persisted vocabulary so that readers of
/// foreign ledgers can decode it, but the executor's completion rules never
/// assign it: a run with successes and skips is `Success`, and any failed
/// task makes the run `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
    PartialSuccess,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::PartialSuccess => "partial_success",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "partial_success" => Ok(RunStatus::PartialSuccess),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome a plugin reports for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl PluginResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            metadata: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Mutable record of one task within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub task_name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PluginResult>,
}

impl TaskExecution {
    pub fn new(task_id: &str, task_name: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            task_name: task_name.to_string(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            attempts: 0,
            result: None,
        }
    }

    /// Begin an attempt.
    pub fn start_attempt(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    pub fn finish(&mut self, status: TaskStatus, result: Option<PluginResult>) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        if result.is_some() {
            self.result = result;
        }
    }

    /// Put the execution back on the ready path after a failed attempt.
    /// Timestamps and the attempt's result are cleared; the attempt counter
    /// is not.
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.result = None;
    }
}

/// Mutable record of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskExecution>,
    /// The trigger that actually initiated this run.
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineRun {
    /// Create a running record with one pending execution per pipeline task.
    pub fn new(id: Uuid, pipeline: &Pipeline, trigger: Trigger) -> Self {
        Self {
            id,
            pipeline_name: pipeline.name().to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            tasks: pipeline
                .tasks()
                .iter()
                .map(|t| TaskExecution::new(t.id(), t.name()))
                .collect(),
            trigger,
            error: None,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskExecution> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    /// Derive the terminal status from the task records.
    ///
    /// Any failed task fails the run; a run whose every task was skipped
    /// was effectively cancelled; successes mixed with skips still count as
    /// success. A run-level error summary forces `Failed` regardless.
    pub fn resolve_status(&mut self) {
        if self.status == RunStatus::Cancelled {
            // Caller-initiated cancellation already decided the outcome.
        } else if self.error.is_some() || self.tasks.iter().any(|t| t.status == TaskStatus::Failed)
        {
            self.status = RunStatus::Failed;
        } else if !self.tasks.is_empty()
            && self.tasks.iter().all(|t| t.status == TaskStatus::Skipped)
        {
            self.status = RunStatus::Cancelled;
        } else {
            self.status = RunStatus::Success;
        }
        self.completed_at = Some(Utc::now());
    }
}
