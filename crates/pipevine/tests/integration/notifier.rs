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

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pipevine::{
    events, NotificationConfig, NotificationContext, NotificationSink, Notifier, Pipeline,
    PluginConfig, RunStatus, Task,
};
use uuid::Uuid;

use crate::fixtures::{base_registry, temp_file_store, test_executor};

/// Collects every event it is handed.
struct EventRecorder {
    events: Mutex<Vec<NotificationContext>>,
}

impl EventRecorder {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    fn event_names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.event.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for EventRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn notify(
        &self,
        _settings: &PluginConfig,
        context: &NotificationContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.events.lock().unwrap().push(context.clone());
        Ok(())
    }
}

fn recorder_config(on: &[&str]) -> NotificationConfig {
    NotificationConfig {
        sink_type: "recorder".to_string(),
        on: on.iter().map(|s| s.to_string()).collect(),
        settings: PluginConfig::new(),
    }
}

#[tokio::test]
async fn test_executor_emits_lifecycle_events() {
    let (store, _dir) = temp_file_store();
    let recorder = Arc::new(EventRecorder::new());

    let mut notifier = Notifier::new();
    notifier.register(recorder.clone());

    let pipeline = Pipeline::builder("observed")
        .version("1.0.0")
        .add_task(Task::new("a", "ok"))
        .unwrap()
        .add_task(Task::new("b", "boom").with_depends_on(["a"]))
        .unwrap()
        .build()
        .unwrap();

    let executor = test_executor(base_registry(), store)
        .with_notifier(
            Arc::new(notifier),
            vec![recorder_config(&[
                events::PIPELINE_STARTED,
                events::PIPELINE_FAILED,
                events::TASK_FAILED,
            ])],
        );

    let run = executor
        .execute_pipeline(&pipeline, Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let names = recorder.event_names();
    assert_eq!(
        names,
        vec![
            events::PIPELINE_STARTED,
            events::TASK_FAILED,
            events::PIPELINE_FAILED,
        ]
    );

    let recorded = recorder.events.lock().unwrap();
    let task_failed = recorded.iter().find(|c| c.event == events::TASK_FAILED).unwrap();
    assert_eq!(task_failed.task_id.as_deref(), Some("b"));
    assert_eq!(task_failed.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_unsubscribed_events_are_not_delivered() {
    let (store, _dir) = temp_file_store();
    let recorder = Arc::new(EventRecorder::new());

    let mut notifier = Notifier::new();
    notifier.register(recorder.clone());

    let pipeline = Pipeline::builder("quiet")
        .version("1.0.0")
        .add_task(Task::new("a", "ok"))
        .unwrap()
        .build()
        .unwrap();

    let executor = test_executor(base_registry(), store)
        .with_notifier(Arc::new(notifier), vec![recorder_config(&[events::PIPELINE_FAILED])]);

    let run = executor
        .execute_pipeline(&pipeline, Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert!(recorder.event_names().is_empty());
}
