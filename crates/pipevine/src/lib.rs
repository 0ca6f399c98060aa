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

//! # Pipevine
//!
//! Pipevine is an embeddable pipeline orchestrator. It turns untrusted
//! configuration into validated task DAGs, runs them with bounded
//! concurrency, per-task timeouts and retries, persists a full run
//! ledger, and optionally re-runs pipelines on cron schedules.
//!
//! ## Core Components
//!
//! - [`parser::parse_pipeline`]: configuration text (JSON or YAML) into a
//!   validated [`Pipeline`] plus warnings and errors
//! - [`Pipeline`] / [`PipelineBuilder`]: the immutable declaration of work
//! - [`PluginRegistry`]: name to execute-capability mapping
//! - [`PipelineExecutor`]: dependency-aware, bounded-concurrency runner
//!   producing a persisted [`PipelineRun`]
//! - [`Scheduler`]: persistent catalogue of cron triggers firing the
//!   executor
//! - [`StateStore`]: the persistence contract, with file
//!   ([`FileStore`]) and SQLite ([`SqliteStore`]) backends
//! - [`Notifier`]: lifecycle event dispatch to side-effect-only sinks
//!
//! Dependencies are threaded explicitly: the executor takes its registry
//! and store at construction, the scheduler takes its store and executor.
//! There are no process-global registries.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pipevine::{
//!     ExecutionContext, ExecutorConfig, FileStore, Pipeline, PipelineExecutor, Plugin,
//!     PluginConfig, PluginError, PluginResult, PluginRegistry, Task,
//! };
//!
//! struct Noop;
//!
//! #[async_trait::async_trait]
//! impl Plugin for Noop {
//!     fn name(&self) -> &str {
//!         "noop"
//!     }
//!
//!     fn version(&self) -> &str {
//!         "1.0.0"
//!     }
//!
//!     async fn execute(
//!         &self,
//!         _config: &PluginConfig,
//!         context: &ExecutionContext,
//!     ) -> Result<PluginResult, PluginError> {
//!         context.logger().info("nothing to do");
//!         Ok(PluginResult::ok(serde_json::json!({"ok": true})))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::builder("demo")
//!         .version("1.0.0")
//!         .add_task(Task::new("only", "noop"))?
//!         .build()?;
//!
//!     let mut registry = PluginRegistry::new();
//!     registry.register(Arc::new(Noop))?;
//!
//!     let store = Arc::new(FileStore::new("pipevine.json"));
//!     let executor =
//!         PipelineExecutor::new(Arc::new(registry), store, ExecutorConfig::default());
//!
//!     let run = executor
//!         .execute_pipeline(&pipeline, uuid::Uuid::new_v4())
//!         .await?;
//!     println!("run finished: {}", run.status);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod executor;
pub mod graph;
pub mod logging;
pub mod notifier;
pub mod parser;
pub mod pipeline;
pub mod plugin;
pub mod run;
pub mod scheduler;
pub mod store;

pub use error::{ExecutionError, PluginError, SchedulerError, StateError, ValidationError};
pub use executor::{events, ExecutorConfig, PipelineExecutor};
pub use logging::{init as init_logging, LogConfig, LogFormat};
pub use notifier::{
    LogSink, NotificationConfig, NotificationContext, NotificationSink, Notifier, SinkResult,
};
pub use parser::{parse_pipeline, ParseOptions, ParseOutcome};
pub use pipeline::{
    Pipeline, PipelineBuilder, PluginConfig, RetryPolicy, Task, Trigger, DEFAULT_CONCURRENCY,
};
pub use plugin::{ExecutionContext, Plugin, PluginCheck, PluginRegistry, ScopedLogger};
pub use run::{PipelineRun, PluginResult, RunStatus, TaskExecution, TaskStatus};
pub use scheduler::{
    Scheduler, SchedulerConfig, SchedulerEntry, SchedulerStatus, UpcomingRun,
    SCHEDULER_KEY_PREFIX,
};
pub use store::{FileStore, SqliteStore, StateStore, DEFAULT_RUN_QUERY_LIMIT};
