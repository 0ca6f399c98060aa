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

//! Contract tests run against both state store backends.

use std::sync::Arc;

use chrono::{Duration, Utc};
use pipevine::{
    Pipeline, PipelineRun, PluginResult, RunStatus, SqliteStore, StateError, StateStore, Task,
    TaskStatus, Trigger,
};
use uuid::Uuid;

use crate::fixtures::temp_file_store;

async fn temp_sqlite_store() -> (Arc<SqliteStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.sqlite3");
    let store = SqliteStore::new(path.to_str().unwrap()).await.unwrap();
    (Arc::new(store), dir)
}

fn sample_run(pipeline_name: &str) -> PipelineRun {
    let pipeline = Pipeline::builder(pipeline_name)
        .version("1.0.0")
        .add_task(Task::new("fetch", "http"))
        .unwrap()
        .add_task(Task::new("load", "warehouse").with_depends_on(["fetch"]))
        .unwrap()
        .build()
        .unwrap();

    let mut run = PipelineRun::new(Uuid::new_v4(), &pipeline, Trigger::Manual);
    {
        let fetch = run.task_mut("fetch").unwrap();
        fetch.start_attempt();
        fetch.finish(
            TaskStatus::Success,
            Some(
                PluginResult::ok(serde_json::json!({"rows": 42}))
                    .with_metadata(serde_json::json!({"source": "api"})),
            ),
        );
    }
    {
        let load = run.task_mut("load").unwrap();
        load.start_attempt();
        load.finish(TaskStatus::Failed, Some(PluginResult::fail("disk full")));
    }
    run.resolve_status();
    run
}

async fn check_kv_contract(store: &dyn StateStore) {
    assert_eq!(store.get("missing").await.unwrap(), None);

    store
        .set("scheduler:job:alpha", serde_json::json!({"n": 1}))
        .await
        .unwrap();
    store
        .set("scheduler:job:beta", serde_json::json!({"n": 2}))
        .await
        .unwrap();
    store
        .set("unrelated", serde_json::json!("value"))
        .await
        .unwrap();

    assert_eq!(
        store.get("scheduler:job:alpha").await.unwrap(),
        Some(serde_json::json!({"n": 1}))
    );

    // Upsert overwrites.
    store
        .set("scheduler:job:alpha", serde_json::json!({"n": 3}))
        .await
        .unwrap();
    assert_eq!(
        store.get("scheduler:job:alpha").await.unwrap(),
        Some(serde_json::json!({"n": 3}))
    );

    assert_eq!(
        store.list("scheduler:job:").await.unwrap(),
        vec!["scheduler:job:alpha", "scheduler:job:beta"]
    );

    store.delete("scheduler:job:alpha").await.unwrap();
    assert_eq!(store.get("scheduler:job:alpha").await.unwrap(), None);
    // Deleting an absent key is not an error.
    store.delete("scheduler:job:alpha").await.unwrap();

    assert!(matches!(
        store.set("pipeline_runs", serde_json::json!([])).await,
        Err(StateError::ReservedKey(_))
    ));
}

async fn check_run_round_trip(store: &dyn StateStore) {
    let run = sample_run("round-trip");
    store.save_pipeline_run(&run).await.unwrap();

    let loaded = store.get_pipeline_run(run.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, run.id);
    assert_eq!(loaded.pipeline_name, run.pipeline_name);
    assert_eq!(loaded.status, RunStatus::Failed);
    assert_eq!(loaded.trigger, Trigger::Manual);
    assert_eq!(loaded.tasks.len(), 2);

    let fetch = loaded.task("fetch").unwrap();
    assert_eq!(fetch.status, TaskStatus::Success);
    assert_eq!(fetch.attempts, 1);
    let result = fetch.result.as_ref().unwrap();
    assert!(result.success);
    assert_eq!(result.output, Some(serde_json::json!({"rows": 42})));
    assert_eq!(result.metadata, Some(serde_json::json!({"source": "api"})));

    let load = loaded.task("load").unwrap();
    assert_eq!(load.status, TaskStatus::Failed);
    assert_eq!(load.result.as_ref().unwrap().error.as_deref(), Some("disk full"));

    // Timestamps survive the string encoding to the microsecond.
    assert_eq!(
        loaded.started_at.timestamp_micros(),
        run.started_at.timestamp_micros()
    );

    // Upsert: a second save must not duplicate the run or its tasks.
    store.save_pipeline_run(&run).await.unwrap();
    let reloaded = store.get_pipeline_run(run.id).await.unwrap().unwrap();
    assert_eq!(reloaded.tasks.len(), 2);

    assert!(store
        .get_pipeline_run(Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}

async fn check_run_queries(store: &dyn StateStore) {
    let mut runs = Vec::new();
    for age_hours in [3i64, 2, 1] {
        let mut run = sample_run("queried");
        run.started_at = Utc::now() - Duration::hours(age_hours);
        store.save_pipeline_run(&run).await.unwrap();
        runs.push(run);
    }
    let other = sample_run("other-pipeline");
    store.save_pipeline_run(&other).await.unwrap();

    let newest_first = store.get_pipeline_runs("queried", None).await.unwrap();
    assert_eq!(newest_first.len(), 3);
    assert_eq!(newest_first[0].id, runs[2].id);
    assert_eq!(newest_first[2].id, runs[0].id);

    let limited = store.get_pipeline_runs("queried", Some(2)).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].id, runs[2].id);

    assert!(store
        .get_pipeline_runs("nonexistent", None)
        .await
        .unwrap()
        .is_empty());
}

async fn check_cleanup(store: &dyn StateStore) {
    let mut stale = sample_run("cleanup");
    stale.started_at = Utc::now() - Duration::days(40);
    store.save_pipeline_run(&stale).await.unwrap();

    let fresh = sample_run("cleanup");
    store.save_pipeline_run(&fresh).await.unwrap();

    let deleted = store.cleanup_old_runs(30).await.unwrap();
    assert_eq!(deleted, 1);

    assert!(store.get_pipeline_run(stale.id).await.unwrap().is_none());
    assert!(store.get_pipeline_run(fresh.id).await.unwrap().is_some());

    // Nothing left to expire.
    assert_eq!(store.cleanup_old_runs(30).await.unwrap(), 0);
}

#[tokio::test]
async fn test_file_store_kv_contract() {
    let (store, _dir) = temp_file_store();
    check_kv_contract(store.as_ref()).await;
}

#[tokio::test]
async fn test_file_store_run_round_trip() {
    let (store, _dir) = temp_file_store();
    check_run_round_trip(store.as_ref()).await;
}

#[tokio::test]
async fn test_file_store_run_queries() {
    let (store, _dir) = temp_file_store();
    check_run_queries(store.as_ref()).await;
}

#[tokio::test]
async fn test_file_store_cleanup() {
    let (store, _dir) = temp_file_store();
    check_cleanup(store.as_ref()).await;
}

#[tokio::test]
async fn test_sqlite_store_kv_contract() {
    let (store, _dir) = temp_sqlite_store().await;
    check_kv_contract(store.as_ref()).await;
}

#[tokio::test]
async fn test_sqlite_store_run_round_trip() {
    let (store, _dir) = temp_sqlite_store().await;
    check_run_round_trip(store.as_ref()).await;
}

#[tokio::test]
async fn test_sqlite_store_run_queries() {
    let (store, _dir) = temp_sqlite_store().await;
    check_run_queries(store.as_ref()).await;
}

#[tokio::test]
async fn test_sqlite_store_cleanup() {
    let (store, _dir) = temp_sqlite_store().await;
    check_cleanup(store.as_ref()).await;
}

#[tokio::test]
async fn test_sqlite_store_reopens_existing_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.sqlite3");

    let run = sample_run("durable");
    {
        let store = SqliteStore::new(path.to_str().unwrap()).await.unwrap();
        store.save_pipeline_run(&run).await.unwrap();
    }

    // Reopening runs migrations idempotently and finds the old data.
    let store = SqliteStore::new(path.to_str().unwrap()).await.unwrap();
    let loaded = store.get_pipeline_run(run.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, run.id);
}

#[tokio::test]
async fn test_file_store_starts_empty_without_file() {
    let (store, _dir) = temp_file_store();
    assert!(store.list("").await.unwrap().is_empty());
    assert!(store.get_pipeline_runs("anything", None).await.unwrap().is_empty());
    assert_eq!(store.cleanup_old_runs(30).await.unwrap(), 0);
}
