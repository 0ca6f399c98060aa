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

//! Persistence for the run ledger and scheduler catalogue.
//!
//! Two interchangeable backends expose the identical [`StateStore`]
//! contract:
//!
//! - [`FileStore`]: one JSON document, every operation serialized by an
//!   in-process lock around load-mutate-rewrite. Linear scans.
//! - [`SqliteStore`]: a Diesel-backed embedded database with `kv`, `runs`
//!   and `tasks` tables, cascade deletion of task rows, and an index on
//!   `(pipeline_name, started_at)`.
//!
//! Both persist timestamps as RFC3339 strings and opaque plugin output and
//! metadata as JSON-encoded blobs. `save_pipeline_run` is atomic at the
//! run level: a reader observing a run's new status never observes stale
//! task rows.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::StateError;
use crate::run::PipelineRun;

mod file;
mod sqlite;

pub use file::FileStore;
pub use sqlite::SqliteStore;

/// Runs returned by [`StateStore::get_pipeline_runs`] when the caller does
/// not bound the query.
pub const DEFAULT_RUN_QUERY_LIMIT: usize = 100;

/// The persistence contract shared by both backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a generic key/value entry.
    async fn get(&self, key: &str) -> Result<Option<Value>, StateError>;

    /// Upsert a generic key/value entry.
    async fn set(&self, key: &str, value: Value) -> Result<(), StateError>;

    /// Remove an entry by key. Absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), StateError>;

    /// All keys beginning with the given prefix, in ascending order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StateError>;

    /// Upsert the run and every task execution it owns, atomically at the
    /// run level.
    async fn save_pipeline_run(&self, run: &PipelineRun) -> Result<(), StateError>;

    /// Reconstruct a run with all of its task executions.
    async fn get_pipeline_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StateError>;

    /// Runs for a pipeline, newest first by start time, bounded by `limit`
    /// (default [`DEFAULT_RUN_QUERY_LIMIT`]).
    async fn get_pipeline_runs(
        &self,
        pipeline_name: &str,
        limit: Option<usize>,
    ) -> Result<Vec<PipelineRun>, StateError>;

    /// Delete runs started more than `retention_days` ago, cascading to
    /// their task records. Returns the number of runs deleted.
    async fn cleanup_old_runs(&self, retention_days: u32) -> Result<u64, StateError>;
}
