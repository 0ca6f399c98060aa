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

//! Lifecycle event notification.
//!
//! The [`Notifier`] holds a collection of named [`NotificationSink`]s.
//! [`Notifier::send`] dispatches one event to the sink a configuration
//! names, skipping silently when the event is not in the configuration's
//! `on` list. Sinks are side-effect-only: their failures are reported in
//! the returned results and never affect pipeline status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::PluginConfig;

/// Selects a sink and the events it should receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Name of the registered sink.
    #[serde(rename = "type")]
    pub sink_type: String,
    /// Events this configuration subscribes to (e.g. `pipeline.failed`).
    pub on: Vec<String>,
    /// Sink-specific settings, passed through verbatim.
    #[serde(default)]
    pub settings: PluginConfig,
}

/// One pipeline or task lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationContext {
    pub event: String,
    pub pipeline_name: String,
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Outcome of one sink dispatch.
#[derive(Debug, Clone)]
pub struct SinkResult {
    pub success: bool,
    pub service: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A delivery target for lifecycle events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(
        &self,
        settings: &PluginConfig,
        context: &NotificationContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Named sink registry.
#[derive(Default)]
pub struct Notifier {
    sinks: HashMap<String, Arc<dyn NotificationSink>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            sinks: HashMap::new(),
        }
    }

    /// A notifier with the built-in `log` sink already registered.
    pub fn with_builtins() -> Self {
        let mut notifier = Self::new();
        notifier.register(Arc::new(LogSink));
        notifier
    }

    /// Register a sink under its own name; a repeated name replaces the
    /// earlier registration.
    pub fn register(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.insert(sink.name().to_string(), sink);
    }

    /// Dispatch one event according to a configuration.
    ///
    /// Events outside `config.on` are skipped silently; an unknown sink
    /// type logs a warning and produces no results.
    pub async fn send(
        &self,
        config: &NotificationConfig,
        context: &NotificationContext,
    ) -> Vec<SinkResult> {
        if !config.on.iter().any(|event| event == &context.event) {
            return Vec::new();
        }

        let Some(sink) = self.sinks.get(&config.sink_type) else {
            warn!(sink = %config.sink_type, "unknown notification sink type");
            return Vec::new();
        };

        let started = Instant::now();
        let outcome = sink.notify(&config.settings, context).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        vec![match outcome {
            Ok(()) => SinkResult {
                success: true,
                service: config.sink_type.clone(),
                error: None,
                duration_ms,
            },
            Err(e) => SinkResult {
                success: false,
                service: config.sink_type.clone(),
                error: Some(e.to_string()),
                duration_ms,
            },
        }]
    }

    pub fn sink_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sinks.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Built-in sink that reports events through the tracing pipeline.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(
        &self,
        _settings: &PluginConfig,
        context: &NotificationContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            event = %context.event,
            pipeline = %context.pipeline_name,
            execution_id = %context.execution_id,
            task = context.task_id.as_deref().unwrap_or(""),
            error = context.error.as_deref().unwrap_or(""),
            "pipeline event"
        );
        Ok(())
    }
}
