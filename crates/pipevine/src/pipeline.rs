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

//! The validated pipeline declaration.
//!
//! A [`Pipeline`] is the immutable description of work: a named, versioned
//! collection of [`Task`]s forming a directed acyclic graph, plus the
//! triggers that may initiate it. Instances come from two places, the
//! configuration parser ([`crate::parser::parse_pipeline`]) and the
//! programmatic [`PipelineBuilder`], and both enforce the same structural
//! invariants: unique task ids, resolvable dependencies, no cycles, and at
//! most one disconnected entry task.
//!
//! Task declaration order is preserved but carries no scheduling meaning;
//! execution order is derived from the dependency graph at run time.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::graph::DependencyGraph;

/// Default concurrency bound applied when a declaration does not set one.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Opaque task configuration handed verbatim to the plugin.
pub type PluginConfig = serde_json::Map<String, Value>;

/// A validated, immutable pipeline declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    name: String,
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    tasks: Vec<Task>,
    #[serde(default)]
    triggers: Vec<Trigger>,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
    /// Run-level deadline in milliseconds; 0 means unbounded.
    #[serde(default)]
    timeout_ms: u64,
    #[serde(default)]
    env: HashMap<String, String>,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Pipeline {
    /// Create a builder for programmatic construction.
    pub fn builder(name: &str) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        name: String,
        version: String,
        description: Option<String>,
        tasks: Vec<Task>,
        triggers: Vec<Trigger>,
        concurrency: usize,
        timeout_ms: u64,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            name,
            version,
            description,
            tasks,
            triggers,
            concurrency,
            timeout_ms,
            env,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Tasks in declaration order. This is not the execution order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Look up a task by id.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id() == id)
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Concurrency bound for one run of this pipeline.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run-level deadline in milliseconds; 0 means unbounded.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Build the dependency graph over this pipeline's tasks.
    pub(crate) fn graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for task in &self.tasks {
            graph.add_node(task.id().to_string());
            for dep in task.depends_on() {
                graph.add_edge(task.id().to_string(), dep.clone());
            }
        }
        graph
    }

    /// Tasks grouped into waves that can run in parallel.
    ///
    /// Every task in a level depends only on tasks in earlier levels. Fails
    /// with [`ValidationError::CyclicDependency`] on an unvalidated cyclic
    /// declaration (e.g. one deserialized from an untrusted snapshot).
    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>, ValidationError> {
        let graph = self.graph();
        graph.execution_levels().ok_or_else(|| {
            let cycle = graph.find_cycles().into_iter().next().unwrap_or_default();
            ValidationError::CyclicDependency { cycle }
        })
    }
}

/// A single unit of work within a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: String,
    name: String,
    plugin: String,
    #[serde(default)]
    config: PluginConfig,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryPolicy>,
    /// Per-task deadline in milliseconds; absent means the executor default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Task {
    /// Create a task naming the plugin that executes it. The display name
    /// defaults to the id.
    pub fn new(id: &str, plugin: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            plugin: plugin.to_string(),
            config: PluginConfig::new(),
            depends_on: Vec::new(),
            retry: None,
            timeout_ms: None,
            enabled: true,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_config(mut self, config: PluginConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

/// Retry policy for a task.
///
/// `attempts` is the total number of attempts the task may consume, not the
/// number of retries after the first failure. A policy with `attempts == 1`
/// is equivalent to no policy at all; the validator drops `attempts == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay_ms: u64) -> Self {
        Self { attempts, delay_ms }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// The event kind that may initiate a pipeline run.
///
/// All three variants are accepted by the parser and stored on the
/// pipeline; only cron triggers are honored by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trigger {
    Cron {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    Webhook {
        path: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    Manual,
}

impl Trigger {
    /// The tag persisted in run records and the relational backend.
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Cron { .. } => "cron",
            Trigger::Webhook { .. } => "webhook",
            Trigger::Manual => "manual",
        }
    }

    /// The variant's fields as a JSON object, without the tag.
    pub fn config_json(&self) -> Value {
        match self {
            Trigger::Cron {
                expression,
                timezone,
            } => {
                let mut map = serde_json::Map::new();
                map.insert("expression".into(), Value::String(expression.clone()));
                if let Some(tz) = timezone {
                    map.insert("timezone".into(), Value::String(tz.clone()));
                }
                Value::Object(map)
            }
            Trigger::Webhook {
                path,
                method,
                secret,
            } => {
                let mut map = serde_json::Map::new();
                map.insert("path".into(), Value::String(path.clone()));
                map.insert("method".into(), Value::String(method.clone()));
                if let Some(secret) = secret {
                    map.insert("secret".into(), Value::String(secret.clone()));
                }
                Value::Object(map)
            }
            Trigger::Manual => Value::Object(serde_json::Map::new()),
        }
    }

    /// Rebuild a trigger from its persisted `(kind, config)` parts.
    pub fn from_parts(kind: &str, config: &Value) -> Option<Trigger> {
        let get = |field: &str| {
            config
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        match kind {
            "cron" => Some(Trigger::Cron {
                expression: get("expression")?,
                timezone: get("timezone"),
            }),
            "webhook" => Some(Trigger::Webhook {
                path: get("path")?,
                method: get("method").unwrap_or_else(|| "POST".to_string()),
                secret: get("secret"),
            }),
            "manual" => Some(Trigger::Manual),
            _ => None,
        }
    }
}

/// Fluent constructor for pipelines assembled in code rather than parsed
/// from configuration. `build` enforces the same structural invariants as
/// the parser.
#[derive(Debug)]
pub struct PipelineBuilder {
    name: String,
    version: String,
    description: Option<String>,
    tasks: Vec<Task>,
    triggers: Vec<Trigger>,
    concurrency: usize,
    timeout_ms: u64,
    env: HashMap<String, String>,
}

impl PipelineBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: String::new(),
            description: None,
            tasks: Vec::new(),
            triggers: Vec::new(),
            concurrency: DEFAULT_CONCURRENCY,
            timeout_ms: 0,
            env: HashMap::new(),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Add a task, rejecting duplicate ids immediately.
    pub fn add_task(mut self, task: Task) -> Result<Self, ValidationError> {
        if self.tasks.iter().any(|t| t.id() == task.id()) {
            return Err(ValidationError::DuplicateTask(task.id().to_string()));
        }
        self.tasks.push(task);
        Ok(self)
    }

    pub fn add_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Validate the declaration and freeze it into a [`Pipeline`].
    pub fn build(self) -> Result<Pipeline, ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if self.version.is_empty() {
            return Err(ValidationError::MissingField("version"));
        }

        let pipeline = Pipeline::from_parts(
            self.name,
            self.version,
            self.description,
            self.tasks,
            self.triggers,
            self.concurrency,
            self.timeout_ms,
            self.env,
        );

        for task in pipeline.tasks() {
            for dep in task.depends_on() {
                if pipeline.task(dep).is_none() {
                    return Err(ValidationError::MissingDependency {
                        task: task.id().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let graph = pipeline.graph();
        if let Some(cycle) = graph.find_cycles().into_iter().next() {
            return Err(ValidationError::CyclicDependency { cycle });
        }

        let isolated = graph.isolated();
        if isolated.len() > 1 {
            return Err(ValidationError::MultipleRoots { roots: isolated });
        }

        Ok(pipeline)
    }
}
