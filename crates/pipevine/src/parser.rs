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

//! Configuration parsing and validation.
//!
//! [`parse_pipeline`] turns an untrusted configuration document into a
//! normalized [`Pipeline`] plus a full diagnostic report. The rules run in
//! a fixed order: document shape, required pipeline fields, optional field
//! coercion, per-task validation, trigger validation, and finally the DAG
//! structure checks (dependency resolution, cycle detection, disconnected
//! entry tasks).
//!
//! Malformed optional fields degrade to their defaults with a warning;
//! structural problems append to the error list but still yield a
//! normalized pipeline where one can be formed, so a caller may inspect
//! the diagnostics and elect to run anyway. The function returns `Err`
//! only for unreadable input, or in strict mode when any error (or
//! warning, which strict mode promotes) was recorded.
//!
//! Documents may be JSON or YAML; JSON is detected by a leading `{` after
//! trimming.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::ValidationError;
use crate::pipeline::{
    Pipeline, PluginConfig, RetryPolicy, Task, Trigger, DEFAULT_CONCURRENCY,
};

/// Parser behavior switches.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Promote warnings to errors and refuse to return a diagnosed pipeline.
    pub strict: bool,
}

/// The parse result: a normalized pipeline (when one could be formed) and
/// everything the validator had to say about the document.
#[derive(Debug)]
pub struct ParseOutcome {
    pub pipeline: Option<Pipeline>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

const WEBHOOK_METHODS: [&str; 3] = ["GET", "POST", "PUT"];

/// Parse and validate a configuration document.
///
/// `label` names the source in diagnostics (a path, a URL, `"<inline>"`).
pub fn parse_pipeline(
    input: &str,
    label: &str,
    options: &ParseOptions,
) -> Result<ParseOutcome, ValidationError> {
    let root = read_document(input, label)?;

    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    let pipeline = match root.get("pipeline").and_then(Value::as_object) {
        Some(section) => Some(validate_pipeline_section(
            section,
            &mut warnings,
            &mut errors,
        )),
        None => {
            errors.push("document must contain a 'pipeline' mapping".to_string());
            None
        }
    };

    if options.strict {
        errors.extend(warnings.drain(..));
        if !errors.is_empty() {
            return Err(ValidationError::Invalid { errors });
        }
    }

    Ok(ParseOutcome {
        pipeline,
        warnings,
        errors,
    })
}

fn read_document(input: &str, label: &str) -> Result<Value, ValidationError> {
    let looks_like_json = input.trim_start().starts_with('{');
    let parsed: Result<Value, String> = if looks_like_json {
        serde_json::from_str(input).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(input).map_err(|e| e.to_string())
    };

    match parsed {
        Ok(Value::Object(map)) => Ok(Value::Object(map)),
        Ok(_) => Err(ValidationError::Unreadable {
            label: label.to_string(),
            message: "top level must be a mapping".to_string(),
        }),
        Err(message) => Err(ValidationError::Unreadable {
            label: label.to_string(),
            message,
        }),
    }
}

fn validate_pipeline_section(
    section: &serde_json::Map<String, Value>,
    warnings: &mut Vec<String>,
    errors: &mut Vec<String>,
) -> Pipeline {
    // Required fields.
    let name = require_string(section, "name", errors);
    let version = require_string(section, "version", errors);

    let task_entries: &[Value] = match section.get("tasks") {
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            errors.push("pipeline 'tasks' must be an array".to_string());
            &[]
        }
        None => {
            errors.push("pipeline 'tasks' must be an array".to_string());
            &[]
        }
    };

    // Optional fields degrade to defaults with a warning.
    let description = match section.get("description") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            warnings.push("pipeline 'description' must be a string; ignoring".to_string());
            None
        }
    };

    let concurrency = match section.get("concurrency") {
        None => DEFAULT_CONCURRENCY,
        Some(value) => match value.as_u64() {
            Some(n) if n > 0 => n as usize,
            _ => {
                warnings.push(format!(
                    "pipeline 'concurrency' must be a positive integer; using default {DEFAULT_CONCURRENCY}"
                ));
                DEFAULT_CONCURRENCY
            }
        },
    };

    let timeout_ms = match section.get("timeout") {
        None => 0,
        Some(value) => match value.as_u64() {
            Some(n) => n,
            None => {
                warnings.push(
                    "pipeline 'timeout' must be a non-negative number of milliseconds; ignoring"
                        .to_string(),
                );
                0
            }
        },
    };

    let env = match section.get("env") {
        None => HashMap::new(),
        Some(Value::Object(map)) => {
            let mut env = HashMap::new();
            for (key, value) in map {
                match value {
                    Value::String(s) => {
                        env.insert(key.clone(), s.clone());
                    }
                    _ => warnings.push(format!(
                        "pipeline env '{key}' must be a string; ignoring"
                    )),
                }
            }
            env
        }
        Some(_) => {
            warnings.push("pipeline 'env' must be a mapping; ignoring".to_string());
            HashMap::new()
        }
    };

    let tasks = validate_tasks(task_entries, warnings, errors);
    if tasks.is_empty() && errors.is_empty() {
        warnings.push("pipeline declares no tasks".to_string());
    }

    let triggers = validate_triggers(section.get("triggers"), warnings, errors);

    validate_dag(&tasks, errors);

    Pipeline::from_parts(
        name,
        version,
        description,
        tasks,
        triggers,
        concurrency,
        timeout_ms,
        env,
    )
}

fn require_string(
    section: &serde_json::Map<String, Value>,
    field: &str,
    errors: &mut Vec<String>,
) -> String {
    match section.get(field).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            errors.push(format!("pipeline '{field}' must be a non-empty string"));
            String::new()
        }
    }
}

fn validate_tasks(
    entries: &[Value],
    warnings: &mut Vec<String>,
    errors: &mut Vec<String>,
) -> Vec<Task> {
    let mut tasks: Vec<Task> = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        let Some(map) = entry.as_object() else {
            errors.push(format!("task[{index}] must be a mapping"));
            continue;
        };

        let Some(id) = non_empty_string(map.get("id")) else {
            errors.push(format!("task[{index}]: 'id' must be a non-empty string"));
            continue;
        };

        let Some(plugin) = non_empty_string(map.get("plugin")) else {
            errors.push(format!(
                "task '{id}': 'plugin' must be a non-empty string"
            ));
            continue;
        };

        if tasks.iter().any(|t| t.id() == id) {
            errors.push(format!("duplicate task id '{id}'"));
            continue;
        }

        let name = match non_empty_string(map.get("name")) {
            Some(name) => name,
            None => {
                warnings.push(format!(
                    "task '{id}': missing display name; falling back to id"
                ));
                id.clone()
            }
        };

        let config = match map.get("config") {
            Some(Value::Object(config)) => config.clone(),
            _ => {
                warnings.push(format!(
                    "task '{id}': 'config' missing or not a mapping; using empty config"
                ));
                PluginConfig::new()
            }
        };

        let depends_on = match map.get("dependsOn").or_else(|| map.get("depends_on")) {
            None => Vec::new(),
            Some(Value::Array(deps)) => {
                let mut out = Vec::new();
                for (dep_index, dep) in deps.iter().enumerate() {
                    match dep.as_str() {
                        Some(s) if !s.is_empty() => out.push(s.to_string()),
                        _ => errors.push(format!(
                            "task '{id}': dependsOn[{dep_index}] must be a task id"
                        )),
                    }
                }
                out
            }
            Some(_) => {
                errors.push(format!(
                    "task '{id}': 'dependsOn' must be an array of task ids"
                ));
                Vec::new()
            }
        };

        let retry = validate_retry(&id, map.get("retry"), warnings);

        let timeout_ms = match map.get("timeout") {
            None => None,
            Some(value) => match value.as_u64() {
                Some(n) if n > 0 => Some(n),
                _ => {
                    warnings.push(format!(
                        "task '{id}': 'timeout' must be a positive number of milliseconds; ignoring"
                    ));
                    None
                }
            },
        };

        // Only the literal `false` disables a task.
        let enabled = !matches!(map.get("enabled"), Some(Value::Bool(false)));

        let mut task = Task::new(&id, &plugin)
            .with_name(&name)
            .with_config(config)
            .with_depends_on(depends_on);
        if let Some(retry) = retry {
            task = task.with_retry(retry);
        }
        if let Some(timeout_ms) = timeout_ms {
            task = task.with_timeout_ms(timeout_ms);
        }
        if !enabled {
            task = task.disabled();
        }
        tasks.push(task);
    }

    tasks
}

fn validate_retry(
    task_id: &str,
    value: Option<&Value>,
    warnings: &mut Vec<String>,
) -> Option<RetryPolicy> {
    let map = match value {
        None => return None,
        Some(Value::Object(map)) => map,
        Some(_) => {
            warnings.push(format!(
                "task '{task_id}': 'retry' must be a mapping; ignoring"
            ));
            return None;
        }
    };

    let attempts = map
        .get("attempts")
        .and_then(Value::as_f64)
        .map(|n| n.floor().max(0.0) as u32)
        .unwrap_or(0);

    // A zero-attempt policy is no policy.
    if attempts == 0 {
        return None;
    }

    let delay_ms = map
        .get("delay")
        .or_else(|| map.get("delayMs"))
        .and_then(Value::as_f64)
        .map(|n| n.max(0.0) as u64)
        .unwrap_or(1000);

    Some(RetryPolicy::new(attempts, delay_ms))
}

fn validate_triggers(
    value: Option<&Value>,
    warnings: &mut Vec<String>,
    errors: &mut Vec<String>,
) -> Vec<Trigger> {
    let entries = match value {
        None => return Vec::new(),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            warnings.push("pipeline 'triggers' must be an array; ignoring".to_string());
            return Vec::new();
        }
    };

    let mut triggers = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        let kind = entry.get("type").and_then(Value::as_str);
        let config = entry.get("config").and_then(Value::as_object);
        let (Some(kind), Some(config)) = (kind, config) else {
            warnings.push(format!(
                "trigger[{index}] must have a string 'type' and a mapping 'config'; ignoring"
            ));
            continue;
        };

        match kind {
            "cron" => {
                let Some(expression) = non_empty_string(config.get("expression")) else {
                    errors.push(format!(
                        "trigger[{index}]: cron trigger requires an 'expression'"
                    ));
                    continue;
                };
                if expression.split_whitespace().count() != 5 {
                    warnings.push(format!(
                        "trigger[{index}]: cron expression '{expression}' does not have five fields"
                    ));
                }
                let timezone = match config.get("timezone") {
                    None => None,
                    Some(Value::String(tz)) => Some(tz.clone()),
                    Some(_) => {
                        warnings.push(format!(
                            "trigger[{index}]: 'timezone' must be a string; ignoring"
                        ));
                        None
                    }
                };
                triggers.push(Trigger::Cron {
                    expression,
                    timezone,
                });
            }
            "webhook" => {
                let Some(path) = non_empty_string(config.get("path")) else {
                    errors.push(format!(
                        "trigger[{index}]: webhook trigger requires a 'path'"
                    ));
                    continue;
                };
                let method = match config.get("method") {
                    None => "POST".to_string(),
                    Some(value) => {
                        let method = value
                            .as_str()
                            .map(|m| m.to_ascii_uppercase())
                            .unwrap_or_default();
                        if !WEBHOOK_METHODS.contains(&method.as_str()) {
                            warnings.push(format!(
                                "trigger[{index}]: webhook method '{method}' is not one of GET, POST, PUT"
                            ));
                        }
                        method
                    }
                };
                let secret = match config.get("secret") {
                    None => None,
                    Some(Value::String(secret)) => Some(secret.clone()),
                    Some(_) => {
                        warnings.push(format!(
                            "trigger[{index}]: 'secret' must be a string; ignoring"
                        ));
                        None
                    }
                };
                triggers.push(Trigger::Webhook {
                    path,
                    method,
                    secret,
                });
            }
            "manual" => triggers.push(Trigger::Manual),
            other => {
                warnings.push(format!(
                    "trigger[{index}]: unknown trigger type '{other}'; ignoring"
                ));
            }
        }
    }

    triggers
}

fn validate_dag(tasks: &[Task], errors: &mut Vec<String>) {
    let mut graph = crate::graph::DependencyGraph::new();
    for task in tasks {
        graph.add_node(task.id().to_string());
    }

    for task in tasks {
        for dep in task.depends_on() {
            if !graph.contains(dep) {
                errors.push(format!(
                    "task '{}' depends on unknown task '{dep}'",
                    task.id()
                ));
            } else {
                graph.add_edge(task.id().to_string(), dep.clone());
            }
        }
    }

    for cycle in graph.find_cycles() {
        errors.push(format!("cyclic dependency: {}", cycle.join(" -> ")));
    }

    let isolated = graph.isolated();
    if isolated.len() > 1 {
        errors.push(format!(
            "pipeline has multiple disconnected entry tasks: {}",
            isolated.join(", ")
        ));
    }
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    match value.and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Some(s.to_string()),
        _ => None,
    }
}
