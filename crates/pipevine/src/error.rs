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

//! Error types for pipevine.
//!
//! The taxonomy follows the recovery path of each failure class:
//!
//! - [`ValidationError`]: raised by the parser/validator and the pipeline
//!   builder; surfaced to the caller, who decides whether to run anyway.
//! - [`PluginError`]: registration rejections and per-plugin failures;
//!   recorded on the affected task execution, never fatal to the crate.
//! - [`ExecutionError`]: executor-level failures. Task-level instances are
//!   recorded on task executions; run-level instances (deadlock, runtime
//!   cycle) become the run's error summary.
//! - [`StateError`]: state store failures. Operations issued by the
//!   executor are retried once and otherwise logged.
//! - [`SchedulerError`]: trigger and catalogue failures in the scheduler.

use thiserror::Error;

/// Errors produced while validating pipeline declarations.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The configuration text could not be parsed at all.
    #[error("configuration '{label}' is not readable: {message}")]
    Unreadable { label: String, message: String },

    /// Strict-mode parse with a non-empty error list.
    #[error("pipeline validation failed: {}", errors.join("; "))]
    Invalid { errors: Vec<String> },

    /// A task id appears more than once in the same pipeline.
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),

    /// A `depends_on` entry names a task that does not exist.
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    MissingDependency { task: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// More than one task has neither dependencies nor dependents.
    #[error("pipeline has multiple disconnected entry tasks: {}", roots.join(", "))]
    MultipleRoots { roots: Vec<String> },

    /// A required pipeline field is missing or empty.
    #[error("pipeline field '{0}' must be a non-empty string")]
    MissingField(&'static str),
}

/// Errors produced by the plugin registry and by plugins themselves.
#[derive(Error, Debug)]
pub enum PluginError {
    /// The registration was rejected (empty name or version).
    #[error("plugin registration rejected: {0}")]
    InvalidRegistration(String),

    /// No plugin is registered under the given name.
    #[error("unknown plugin: {0}")]
    Unknown(String),

    /// The plugin raised an error while executing.
    #[error("plugin '{plugin}' failed: {message}")]
    Failed { plugin: String, message: String },
}

/// Errors produced by the pipeline executor.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// A task exceeded its deadline. The in-flight plugin call is dropped.
    #[error("task '{task}' timed out after {timeout_ms} ms")]
    TaskTimeout { task: String, timeout_ms: u64 },

    /// The whole run exceeded the pipeline-level timeout.
    #[error("pipeline timed out after {timeout_ms} ms")]
    PipelineTimeout { timeout_ms: u64 },

    /// The ready set is empty while non-terminal tasks remain.
    #[error("execution deadlocked; stuck tasks: {}", tasks.join(", "))]
    Deadlock { tasks: Vec<String> },

    /// The graph handed to the executor contains a cycle, which means the
    /// validator was bypassed.
    #[error("cycle detected at execution time: {}", cycle.join(" -> "))]
    CycleAtRuntime { cycle: Vec<String> },

    /// A dispatched task aborted without reporting a result.
    #[error("task join failed: {0}")]
    Join(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Errors produced by the state store backends.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization failure: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("database query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("connection pool failure: {0}")]
    Pool(String),

    #[error("database migrations failed: {0}")]
    Migration(String),

    /// A persisted record could not be decoded back into its domain type.
    #[error("persisted record is corrupt: {0}")]
    Corrupt(String),

    /// The key is reserved for the store's own layout.
    #[error("key '{0}' is reserved")]
    ReservedKey(String),
}

/// Errors produced by the cron scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Only cron triggers can be scheduled.
    #[error("only cron triggers can be scheduled; got '{0}'")]
    NotCron(String),

    /// The cron expression failed five-field parsing.
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidExpression { expression: String, message: String },

    /// The trigger names a timezone the tz database does not know.
    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),

    #[error(transparent)]
    State(#[from] StateError),
}
