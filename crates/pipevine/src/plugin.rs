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

//! The plugin capability and its registry.
//!
//! A plugin is the unit of work a task names: anything implementing
//! [`Plugin`], which means a name, a version, an async `execute`, and an
//! optional configuration pre-flight. The [`PluginRegistry`] maps names to
//! capabilities; it is populated at startup and read-only during
//! execution, so the executor can share it freely across concurrent
//! tasks.
//!
//! Plugins receive their task's opaque configuration verbatim plus an
//! [`ExecutionContext`] scoped to the single task attempt: read snapshots
//! of the pipeline and task, the run id, a level-tagged logger, a state
//! store handle, the results of successfully completed upstream tasks,
//! and the pipeline's environment variables.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::PluginError;
use crate::pipeline::{Pipeline, PluginConfig, Task};
use crate::run::PluginResult;
use crate::store::StateStore;

/// Outcome of a plugin's configuration pre-flight.
#[derive(Debug, Clone)]
pub struct PluginCheck {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl PluginCheck {
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// An execute capability identified by name.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Run one attempt of a task. A returned `Ok` carries the plugin's own
    /// verdict (`PluginResult::success`); `Err` is treated the same as an
    /// unsuccessful result by the executor.
    async fn execute(
        &self,
        config: &PluginConfig,
        context: &ExecutionContext,
    ) -> Result<PluginResult, PluginError>;

    /// Optional configuration pre-flight, run before execution when the
    /// caller asks for it. The default accepts everything.
    fn validate(&self, _config: &PluginConfig) -> PluginCheck {
        PluginCheck::valid()
    }
}

/// Name → capability mapping, populated at startup.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Register a capability under its own name.
    ///
    /// Registrations without a name or version are rejected. A repeated
    /// name replaces the earlier registration.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        if plugin.name().is_empty() {
            return Err(PluginError::InvalidRegistration(
                "plugin name must not be empty".to_string(),
            ));
        }
        if plugin.version().is_empty() {
            return Err(PluginError::InvalidRegistration(format!(
                "plugin '{}' must declare a version",
                plugin.name()
            )));
        }
        self.plugins.insert(plugin.name().to_string(), plugin);
        Ok(())
    }

    /// Register a batch, skipping rejected entries so one bad plugin does
    /// not prevent the others from loading.
    pub fn register_all<I>(&mut self, plugins: I)
    where
        I: IntoIterator<Item = Arc<dyn Plugin>>,
    {
        for plugin in plugins {
            let name = plugin.name().to_string();
            if let Err(e) = self.register(plugin) {
                tracing::warn!(plugin = %name, error = %e, "skipping plugin registration");
            }
        }
    }

    /// Resolve a capability by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    /// Delegate configuration pre-flight to the named plugin. An unknown
    /// name is itself a failed check.
    pub fn validate(&self, name: &str, config: &PluginConfig) -> PluginCheck {
        match self.resolve(name) {
            Some(plugin) => plugin.validate(config),
            None => PluginCheck::invalid(vec![format!("unknown plugin: {name}")]),
        }
    }

    /// Pre-flight a whole pipeline: resolve every enabled task's plugin
    /// and run its configuration check. Returns one message per problem.
    pub fn validate_pipeline(&self, pipeline: &Pipeline) -> Vec<String> {
        let mut problems = Vec::new();
        for task in pipeline.tasks().iter().filter(|t| t.enabled()) {
            match self.resolve(task.plugin()) {
                None => problems.push(format!(
                    "task '{}' names unknown plugin '{}'",
                    task.id(),
                    task.plugin()
                )),
                Some(plugin) => {
                    let check = plugin.validate(task.config());
                    if !check.valid {
                        for error in check.errors {
                            problems.push(format!("task '{}': {error}", task.id()));
                        }
                    }
                }
            }
        }
        problems
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Everything the executor exposes to a plugin for one task attempt.
///
/// Contexts are built per attempt and never shared between tasks.
pub struct ExecutionContext {
    pipeline: Arc<Pipeline>,
    task: Task,
    execution_id: Uuid,
    state: Arc<dyn StateStore>,
    previous_results: HashMap<String, PluginResult>,
    variables: HashMap<String, String>,
}

impl ExecutionContext {
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        task: Task,
        execution_id: Uuid,
        state: Arc<dyn StateStore>,
        previous_results: HashMap<String, PluginResult>,
    ) -> Self {
        let variables = pipeline.env().clone();
        Self {
            pipeline,
            task,
            execution_id,
            state,
            previous_results,
            variables,
        }
    }

    /// Read snapshot of the pipeline under execution.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Read snapshot of the task being attempted.
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Handle to the state store backing the run ledger.
    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    /// Results of upstream tasks that reached `success`, keyed by task id.
    pub fn previous_results(&self) -> &HashMap<String, PluginResult> {
        &self.previous_results
    }

    /// The pipeline's environment variables.
    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// A logger scoped to this task attempt.
    pub fn logger(&self) -> ScopedLogger<'_> {
        ScopedLogger { context: self }
    }
}

/// Four-level logger tagging every record with the run and task identity.
pub struct ScopedLogger<'a> {
    context: &'a ExecutionContext,
}

impl ScopedLogger<'_> {
    pub fn debug(&self, message: &str) {
        tracing::debug!(
            pipeline = %self.context.pipeline.name(),
            task = %self.context.task.id(),
            execution_id = %self.context.execution_id,
            "{message}"
        );
    }

    pub fn info(&self, message: &str) {
        tracing::info!(
            pipeline = %self.context.pipeline.name(),
            task = %self.context.task.id(),
            execution_id = %self.context.execution_id,
            "{message}"
        );
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(
            pipeline = %self.context.pipeline.name(),
            task = %self.context.task.id(),
            execution_id = %self.context.execution_id,
            "{message}"
        );
    }

    pub fn error(&self, message: &str) {
        tracing::error!(
            pipeline = %self.context.pipeline.name(),
            task = %self.context.task.id(),
            execution_id = %self.context.execution_id,
            "{message}"
        );
    }
}
