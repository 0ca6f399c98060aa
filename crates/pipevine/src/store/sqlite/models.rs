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

//! SQLite row models and domain conversions.
//!
//! Identifiers are stored as TEXT, timestamps as fixed-precision RFC3339
//! TEXT (which also makes them ordering-safe in SQL), and opaque plugin
//! output and metadata as JSON-encoded TEXT. Conversions to and from the
//! domain types live here so the query code stays purely relational.

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use super::schema::{kv, runs, tasks};
use crate::error::StateError;
use crate::pipeline::Trigger;
use crate::run::{PipelineRun, PluginResult, TaskExecution, TaskStatus};

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = kv)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct KvRow {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RunRow {
    pub id: String,
    pub pipeline_name: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub trigger_type: String,
    pub trigger_config: String,
    pub error_text: Option<String>,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = tasks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TaskRow {
    pub id: i32,
    pub run_id: String,
    pub task_id: String,
    pub task_name: String,
    pub status: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub attempts: i32,
    pub result_output: Option<String>,
    pub result_error: Option<String>,
    pub result_metadata: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tasks)]
pub struct NewTaskRow {
    pub run_id: String,
    pub task_id: String,
    pub task_name: String,
    pub status: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub attempts: i32,
    pub result_output: Option<String>,
    pub result_error: Option<String>,
    pub result_metadata: Option<String>,
}

/// Fixed-precision RFC3339, sortable as TEXT.
pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, StateError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: &Option<String>) -> Result<Option<DateTime<Utc>>, StateError> {
    s.as_deref().map(parse_ts).transpose()
}

fn encode_opt_json(value: &Option<Value>) -> Result<Option<String>, StateError> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(StateError::from))
        .transpose()
}

fn decode_opt_json(text: &Option<String>) -> Result<Option<Value>, StateError> {
    text.as_deref()
        .map(|s| serde_json::from_str(s).map_err(|e| StateError::Corrupt(format!("bad JSON blob: {e}"))))
        .transpose()
}

pub fn run_to_row(run: &PipelineRun) -> Result<RunRow, StateError> {
    Ok(RunRow {
        id: run.id.to_string(),
        pipeline_name: run.pipeline_name.clone(),
        status: run.status.as_str().to_string(),
        started_at: fmt_ts(&run.started_at),
        completed_at: run.completed_at.as_ref().map(fmt_ts),
        trigger_type: run.trigger.kind().to_string(),
        trigger_config: serde_json::to_string(&run.trigger.config_json())?,
        error_text: run.error.clone(),
    })
}

pub fn task_to_row(run_id: &Uuid, execution: &TaskExecution) -> Result<NewTaskRow, StateError> {
    let (output, error, metadata) = match &execution.result {
        Some(result) => (
            encode_opt_json(&result.output)?,
            result.error.clone(),
            encode_opt_json(&result.metadata)?,
        ),
        None => (None, None, None),
    };

    Ok(NewTaskRow {
        run_id: run_id.to_string(),
        task_id: execution.task_id.clone(),
        task_name: execution.task_name.clone(),
        status: execution.status.as_str().to_string(),
        started_at: execution.started_at.as_ref().map(fmt_ts),
        completed_at: execution.completed_at.as_ref().map(fmt_ts),
        attempts: execution.attempts as i32,
        result_output: output,
        result_error: error,
        result_metadata: metadata,
    })
}

pub fn rows_to_run(row: RunRow, task_rows: Vec<TaskRow>) -> Result<PipelineRun, StateError> {
    let id = Uuid::parse_str(&row.id)
        .map_err(|e| StateError::Corrupt(format!("bad run id '{}': {e}", row.id)))?;

    let trigger_config: Value = serde_json::from_str(&row.trigger_config)
        .map_err(|e| StateError::Corrupt(format!("bad trigger config: {e}")))?;
    let trigger = Trigger::from_parts(&row.trigger_type, &trigger_config).ok_or_else(|| {
        StateError::Corrupt(format!("bad trigger type '{}'", row.trigger_type))
    })?;

    let status = row
        .status
        .parse()
        .map_err(StateError::Corrupt)?;

    let mut tasks = Vec::with_capacity(task_rows.len());
    for task_row in task_rows {
        tasks.push(row_to_task(task_row)?);
    }

    Ok(PipelineRun {
        id,
        pipeline_name: row.pipeline_name,
        status,
        started_at: parse_ts(&row.started_at)?,
        completed_at: parse_opt_ts(&row.completed_at)?,
        tasks,
        trigger,
        error: row.error_text,
    })
}

fn row_to_task(row: TaskRow) -> Result<TaskExecution, StateError> {
    let status: TaskStatus = row.status.parse().map_err(StateError::Corrupt)?;

    let output = decode_opt_json(&row.result_output)?;
    let metadata = decode_opt_json(&row.result_metadata)?;
    let result = if output.is_some() || row.result_error.is_some() || metadata.is_some() {
        Some(PluginResult {
            success: status == TaskStatus::Success,
            output,
            error: row.result_error,
            metadata,
        })
    } else {
        None
    };

    Ok(TaskExecution {
        task_id: row.task_id,
        task_name: row.task_name,
        status,
        started_at: parse_opt_ts(&row.started_at)?,
        completed_at: parse_opt_ts(&row.completed_at)?,
        attempts: row.attempts as u32,
        result,
    })
}
