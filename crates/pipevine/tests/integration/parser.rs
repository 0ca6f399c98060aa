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

//! End-to-end: configuration document through the validator and executor.

use pipevine::{parse_pipeline, ParseOptions, RunStatus, TaskStatus};
use uuid::Uuid;

use crate::fixtures::{base_registry, temp_file_store, test_executor};

#[tokio::test]
async fn test_yaml_config_parses_and_executes() {
    let yaml = r#"
pipeline:
  name: etl
  version: "1.0.0"
  description: three-step demo
  concurrency: 2
  tasks:
    - id: fetch
      name: Fetch
      plugin: ok
      config: {}
    - id: transform
      name: Transform
      plugin: ok
      config: {}
      dependsOn: [fetch]
    - id: load
      name: Load
      plugin: ok
      config: {}
      dependsOn: [transform]
  triggers:
    - type: cron
      config:
        expression: "0 6 * * *"
"#;

    let outcome = parse_pipeline(yaml, "etl.yaml", &ParseOptions::default()).unwrap();
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    let pipeline = outcome.pipeline.unwrap();
    assert_eq!(pipeline.triggers().len(), 1);

    let (store, _dir) = temp_file_store();
    let executor = test_executor(base_registry(), store);
    let run = executor
        .execute_pipeline(&pipeline, Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert!(run
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Success));
}

#[tokio::test]
async fn test_cyclic_config_is_rejected_before_execution() {
    let json = r#"{
      "pipeline": {
        "name": "cyclic",
        "version": "1.0.0",
        "tasks": [
          {"id": "a", "plugin": "ok", "config": {}, "dependsOn": ["b"]},
          {"id": "b", "plugin": "ok", "config": {}, "dependsOn": ["a"]}
        ]
      }
    }"#;

    let outcome = parse_pipeline(json, "cyclic.json", &ParseOptions::default()).unwrap();
    let cycle_error = outcome
        .errors
        .iter()
        .find(|e| e.contains("cyclic dependency"))
        .expect("cycle not reported");
    assert!(cycle_error.contains('a') && cycle_error.contains('b'));

    // The caller gates on the error list; the executor is never invoked.
    assert!(outcome.pipeline.is_some());
}

#[tokio::test]
async fn test_config_with_disabled_task_runs_dependents() {
    let json = r#"{
      "pipeline": {
        "name": "partly-off",
        "version": "1.0.0",
        "tasks": [
          {"id": "off", "plugin": "boom", "config": {}, "enabled": false},
          {"id": "on", "plugin": "ok", "config": {}, "dependsOn": ["off"]}
        ]
      }
    }"#;

    let outcome = parse_pipeline(json, "partly-off.json", &ParseOptions::default()).unwrap();
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);

    let (store, _dir) = temp_file_store();
    let executor = test_executor(base_registry(), store);
    let run = executor
        .execute_pipeline(&outcome.pipeline.unwrap(), Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.task("off").unwrap().status, TaskStatus::Skipped);
    assert_eq!(run.task("on").unwrap().status, TaskStatus::Success);
}
