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

//! Relational backend on embedded SQLite via Diesel.
//!
//! Connections come from a deadpool pool sized at one (SQLite works best
//! with a single writer); embedded migrations run when the store is
//! opened. Foreign keys are switched on so task rows cascade with their
//! run, though deletes still remove task rows explicitly inside the same
//! transaction.

mod models;
mod schema;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use deadpool_diesel::sqlite::{Manager, Pool};
use deadpool_diesel::Runtime;
use diesel::prelude::*;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use self::models::{fmt_ts, rows_to_run, run_to_row, task_to_row, KvRow, NewTaskRow, RunRow, TaskRow};
use self::schema::{kv, runs, tasks};
use super::{StateStore, DEFAULT_RUN_QUERY_LIMIT};
use crate::error::StateError;
use crate::run::PipelineRun;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const RUNS_KEY: &str = "pipeline_runs";

/// SQLite-backed state store.
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    /// Open (creating if necessary) the database at the given path and run
    /// pending migrations.
    pub async fn new(database_path: &str) -> Result<Self, StateError> {
        let manager = Manager::new(database_path, Runtime::Tokio1);
        let pool = Pool::builder(manager)
            .max_size(1)
            .build()
            .map_err(|e| StateError::Pool(e.to_string()))?;

        let conn = pool
            .get()
            .await
            .map_err(|e| StateError::Pool(e.to_string()))?;
        conn.interact(|conn| {
            diesel::sql_query("PRAGMA foreign_keys = ON")
                .execute(conn)
                .map_err(StateError::from)?;
            conn.run_pending_migrations(MIGRATIONS)
                .map(|_| ())
                .map_err(|e| StateError::Migration(e.to_string()))
        })
        .await
        .map_err(|e| StateError::Pool(e.to_string()))??;

        info!(path = database_path, "sqlite state store ready");
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_diesel::sqlite::Connection, StateError> {
        self.pool
            .get()
            .await
            .map_err(|e| StateError::Pool(e.to_string()))
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        if key == RUNS_KEY {
            return Ok(None);
        }
        let conn = self.conn().await?;
        let key = key.to_string();

        let text: Option<String> = conn
            .interact(move |conn| {
                kv::table
                    .find(key)
                    .select(kv::value)
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StateError::Pool(e.to_string()))??;

        text.as_deref()
            .map(|s| serde_json::from_str(s).map_err(|e| StateError::Corrupt(e.to_string())))
            .transpose()
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StateError> {
        if key == RUNS_KEY {
            return Err(StateError::ReservedKey(key.to_string()));
        }
        let conn = self.conn().await?;
        let row = KvRow {
            key: key.to_string(),
            value: serde_json::to_string(&value)?,
            updated_at: fmt_ts(&Utc::now()),
        };

        conn.interact(move |conn| {
            diesel::replace_into(kv::table).values(&row).execute(conn)
        })
        .await
        .map_err(|e| StateError::Pool(e.to_string()))??;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        if key == RUNS_KEY {
            return Err(StateError::ReservedKey(key.to_string()));
        }
        let conn = self.conn().await?;
        let key = key.to_string();

        conn.interact(move |conn| diesel::delete(kv::table.find(key)).execute(conn))
            .await
            .map_err(|e| StateError::Pool(e.to_string()))??;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StateError> {
        let conn = self.conn().await?;
        let prefix = prefix.to_string();

        let keys: Vec<String> = conn
            .interact(move |conn| {
                let keys: Vec<String> = kv::table
                    .select(kv::key)
                    .filter(kv::key.ge(prefix.clone()))
                    .order(kv::key.asc())
                    .load(conn)?;
                Ok::<_, diesel::result::Error>(
                    keys.into_iter()
                        .take_while(|k| k.starts_with(&prefix))
                        .collect(),
                )
            })
            .await
            .map_err(|e| StateError::Pool(e.to_string()))??;
        Ok(keys)
    }

    async fn save_pipeline_run(&self, run: &PipelineRun) -> Result<(), StateError> {
        let run_row = run_to_row(run)?;
        let task_rows: Vec<NewTaskRow> = run
            .tasks
            .iter()
            .map(|t| task_to_row(&run.id, t))
            .collect::<Result<_, _>>()?;
        let run_id = run.id.to_string();

        let conn = self.conn().await?;
        conn.interact(move |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::replace_into(runs::table)
                    .values(&run_row)
                    .execute(conn)?;
                diesel::delete(tasks::table.filter(tasks::run_id.eq(&run_id))).execute(conn)?;
                if !task_rows.is_empty() {
                    diesel::insert_into(tasks::table)
                        .values(&task_rows)
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| StateError::Pool(e.to_string()))??;
        Ok(())
    }

    async fn get_pipeline_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StateError> {
        let conn = self.conn().await?;
        let id_text = id.to_string();

        let rows: Option<(RunRow, Vec<TaskRow>)> = conn
            .interact(move |conn| {
                let run_row: Option<RunRow> = runs::table
                    .find(&id_text)
                    .select(RunRow::as_select())
                    .first(conn)
                    .optional()?;
                match run_row {
                    None => Ok::<_, diesel::result::Error>(None),
                    Some(run_row) => {
                        let task_rows = tasks::table
                            .filter(tasks::run_id.eq(&id_text))
                            .order(tasks::id.asc())
                            .select(TaskRow::as_select())
                            .load(conn)?;
                        Ok(Some((run_row, task_rows)))
                    }
                }
            })
            .await
            .map_err(|e| StateError::Pool(e.to_string()))??;

        rows.map(|(run_row, task_rows)| rows_to_run(run_row, task_rows))
            .transpose()
    }

    async fn get_pipeline_runs(
        &self,
        pipeline_name: &str,
        limit: Option<usize>,
    ) -> Result<Vec<PipelineRun>, StateError> {
        let conn = self.conn().await?;
        let pipeline_name = pipeline_name.to_string();
        let limit = limit.unwrap_or(DEFAULT_RUN_QUERY_LIMIT) as i64;

        let rows: Vec<(RunRow, Vec<TaskRow>)> = conn
            .interact(move |conn| {
                let run_rows: Vec<RunRow> = runs::table
                    .filter(runs::pipeline_name.eq(&pipeline_name))
                    .order(runs::started_at.desc())
                    .limit(limit)
                    .select(RunRow::as_select())
                    .load(conn)?;

                let mut out = Vec::with_capacity(run_rows.len());
                for run_row in run_rows {
                    let task_rows = tasks::table
                        .filter(tasks::run_id.eq(&run_row.id))
                        .order(tasks::id.asc())
                        .select(TaskRow::as_select())
                        .load(conn)?;
                    out.push((run_row, task_rows));
                }
                Ok::<_, diesel::result::Error>(out)
            })
            .await
            .map_err(|e| StateError::Pool(e.to_string()))??;

        rows.into_iter()
            .map(|(run_row, task_rows)| rows_to_run(run_row, task_rows))
            .collect()
    }

    async fn cleanup_old_runs(&self, retention_days: u32) -> Result<u64, StateError> {
        let cutoff = fmt_ts(&(Utc::now() - Duration::days(i64::from(retention_days))));

        let conn = self.conn().await?;
        let deleted: usize = conn
            .interact(move |conn| {
                conn.transaction::<_, diesel::result::Error, _>(|conn| {
                    let stale: Vec<String> = runs::table
                        .filter(runs::started_at.lt(&cutoff))
                        .select(runs::id)
                        .load(conn)?;
                    if stale.is_empty() {
                        return Ok(0);
                    }
                    diesel::delete(tasks::table.filter(tasks::run_id.eq_any(&stale)))
                        .execute(conn)?;
                    diesel::delete(runs::table.filter(runs::id.eq_any(&stale))).execute(conn)
                })
            })
            .await
            .map_err(|e| StateError::Pool(e.to_string()))??;

        Ok(deleted as u64)
    }
}
