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

//! Single-document JSON backend.
//!
//! The document is a top-level mapping. Generic key/value entries live as
//! top-level keys (scheduler entries under `scheduler:job:<id>`); the
//! reserved `pipeline_runs` key holds the run ledger as an array. Every
//! operation loads the document, mutates it, and rewrites the file; an
//! in-process mutex serializes concurrent mutators.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::{StateStore, DEFAULT_RUN_QUERY_LIMIT};
use crate::error::StateError;
use crate::run::PipelineRun;

const RUNS_KEY: &str = "pipeline_runs";

/// File-backed state store.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Open a store at the given path. The file is created on first write.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Map<String, Value>, StateError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes)? {
                Value::Object(map) => Ok(map),
                _ => Err(StateError::Corrupt(format!(
                    "{} is not a JSON mapping",
                    self.path.display()
                ))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, document: &Map<String, Value>) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&Value::Object(document.clone()))?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    fn runs(document: &Map<String, Value>) -> Vec<Value> {
        match document.get(RUNS_KEY) {
            Some(Value::Array(runs)) => runs.clone(),
            _ => Vec::new(),
        }
    }

    fn decode_run(value: &Value) -> Option<PipelineRun> {
        match serde_json::from_value(value.clone()) {
            Ok(run) => Some(run),
            Err(e) => {
                warn!(error = %e, "skipping undecodable run record");
                None
            }
        }
    }

    fn run_started_at(value: &Value) -> Option<DateTime<Utc>> {
        value
            .get("started_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        if key == RUNS_KEY {
            return Ok(None);
        }
        let _guard = self.lock.lock().await;
        let document = self.load().await?;
        Ok(document.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StateError> {
        if key == RUNS_KEY {
            return Err(StateError::ReservedKey(key.to_string()));
        }
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        document.insert(key.to_string(), value);
        self.persist(&document).await
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        if key == RUNS_KEY {
            return Err(StateError::ReservedKey(key.to_string()));
        }
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        if document.remove(key).is_some() {
            self.persist(&document).await?;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StateError> {
        let _guard = self.lock.lock().await;
        let document = self.load().await?;
        let mut keys: Vec<String> = document
            .keys()
            .filter(|k| *k != RUNS_KEY && k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn save_pipeline_run(&self, run: &PipelineRun) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        let mut runs = Self::runs(&document);

        let encoded = serde_json::to_value(run)?;
        let id = run.id.to_string();
        match runs
            .iter_mut()
            .find(|r| r.get("id").and_then(Value::as_str) == Some(id.as_str()))
        {
            Some(existing) => *existing = encoded,
            None => runs.push(encoded),
        }

        document.insert(RUNS_KEY.to_string(), Value::Array(runs));
        self.persist(&document).await
    }

    async fn get_pipeline_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StateError> {
        let _guard = self.lock.lock().await;
        let document = self.load().await?;
        let id = id.to_string();

        for value in Self::runs(&document) {
            if value.get("id").and_then(Value::as_str) == Some(id.as_str()) {
                return serde_json::from_value(value)
                    .map(Some)
                    .map_err(|e| StateError::Corrupt(format!("run {id}: {e}")));
            }
        }
        Ok(None)
    }

    async fn get_pipeline_runs(
        &self,
        pipeline_name: &str,
        limit: Option<usize>,
    ) -> Result<Vec<PipelineRun>, StateError> {
        let _guard = self.lock.lock().await;
        let document = self.load().await?;

        let mut matching: Vec<Value> = Self::runs(&document)
            .into_iter()
            .filter(|r| r.get("pipeline_name").and_then(Value::as_str) == Some(pipeline_name))
            .collect();
        matching.sort_by_key(|r| std::cmp::Reverse(Self::run_started_at(r)));

        Ok(matching
            .iter()
            .take(limit.unwrap_or(DEFAULT_RUN_QUERY_LIMIT))
            .filter_map(Self::decode_run)
            .collect())
    }

    async fn cleanup_old_runs(&self, retention_days: u32) -> Result<u64, StateError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));

        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        let runs = Self::runs(&document);

        let before = runs.len();
        let kept: Vec<Value> = runs
            .into_iter()
            .filter(|r| match Self::run_started_at(r) {
                Some(started_at) => started_at >= cutoff,
                // Keep records we cannot date rather than silently losing them.
                None => true,
            })
            .collect();
        let deleted = (before - kept.len()) as u64;

        if deleted > 0 {
            document.insert(RUNS_KEY.to_string(), Value::Array(kept));
            self.persist(&document).await?;
        }
        Ok(deleted)
    }
}
