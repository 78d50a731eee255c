//! AI conversational memory seam.
//!
//! Interactions are recorded during the run and persisted once, after the
//! store commit. [`InMemoryMemoryManager`] keeps a bounded short-term window
//! per AI profile and a persisted log whose text has been scrubbed of
//! secret values.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::ast::AiDecl;
use crate::boundary::scrub_secrets;
use crate::eval::value::{State, Value};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MemoryError {
    #[error("Memory recall failed: {0}")]
    Recall(String),

    #[error("Memory persistence failed: {0}")]
    Persist(String),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

#[async_trait]
pub trait MemoryManager: Send + Sync {
    /// Memory context handed to the provider alongside the user input.
    async fn recall_context(&self, profile: &AiDecl, input: &str, state: &State)
    -> MemoryResult<Value>;

    async fn record_interaction(
        &self,
        profile: &AiDecl,
        state: &State,
        input: &str,
        output: &str,
        tool_events: &[Value],
    ) -> MemoryResult<()>;

    /// Flush recorded interactions. Called once per run, after commit.
    async fn persist(
        &self,
        project_root: Option<&Path>,
        app_path: Option<&Path>,
        secret_values: &[String],
    ) -> MemoryResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub profile: String,
    pub input: String,
    pub output: String,
    pub tool_events: usize,
    pub timestamp: DateTime<Utc>,
}

impl MemoryItem {
    fn to_value(&self) -> Value {
        Value::map([
            ("input", Value::from(self.input.clone())),
            ("output", Value::from(self.output.clone())),
        ])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_max_short_term")]
    pub max_short_term: usize,

    /// File, relative to the project root, the persisted log is written to.
    #[serde(default)]
    pub persist_file: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_short_term: default_max_short_term(),
            persist_file: None,
        }
    }
}

fn default_max_short_term() -> usize {
    10
}

#[derive(Clone, Default)]
pub struct InMemoryMemoryManager {
    config: MemoryConfig,
    short_term: Arc<RwLock<HashMap<String, VecDeque<MemoryItem>>>>,
    pending: Arc<RwLock<Vec<MemoryItem>>>,
    persisted: Arc<RwLock<Vec<MemoryItem>>>,
}

impl InMemoryMemoryManager {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub async fn persisted(&self) -> Vec<MemoryItem> {
        self.persisted.read().await.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.read().await.len()
    }
}

#[async_trait]
impl MemoryManager for InMemoryMemoryManager {
    #[tracing::instrument(skip(self, profile, _state), level = "debug")]
    async fn recall_context(
        &self,
        profile: &AiDecl,
        input: &str,
        _state: &State,
    ) -> MemoryResult<Value> {
        if !profile.memory {
            return Ok(Value::Null);
        }
        let short_term = self.short_term.read().await;
        let items = short_term
            .get(&profile.name)
            .map(|items| items.iter().map(MemoryItem::to_value).collect())
            .unwrap_or_default();
        Ok(Value::map([("short_term", Value::List(items))]))
    }

    async fn record_interaction(
        &self,
        profile: &AiDecl,
        _state: &State,
        input: &str,
        output: &str,
        tool_events: &[Value],
    ) -> MemoryResult<()> {
        let item = MemoryItem {
            profile: profile.name.clone(),
            input: input.to_string(),
            output: output.to_string(),
            tool_events: tool_events.len(),
            timestamp: Utc::now(),
        };
        if profile.memory {
            let mut short_term = self.short_term.write().await;
            let window = short_term.entry(profile.name.clone()).or_default();
            window.push_back(item.clone());
            while window.len() > self.config.max_short_term {
                window.pop_front();
            }
        }
        self.pending.write().await.push(item);
        Ok(())
    }

    async fn persist(
        &self,
        project_root: Option<&Path>,
        _app_path: Option<&Path>,
        secret_values: &[String],
    ) -> MemoryResult<()> {
        let drained: Vec<MemoryItem> = self
            .pending
            .write()
            .await
            .drain(..)
            .map(|item| MemoryItem {
                input: scrub_secrets(&item.input, secret_values),
                output: scrub_secrets(&item.output, secret_values),
                ..item
            })
            .collect();
        debug!(count = drained.len(), "persisting memory items");

        let mut persisted = self.persisted.write().await;
        persisted.extend(drained);

        if let (Some(root), Some(file)) = (project_root, &self.config.persist_file) {
            let path = root.join(file);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| MemoryError::Persist(e.to_string()))?;
            }
            let body = serde_json::to_vec_pretty(&*persisted)
                .map_err(|e| MemoryError::Persist(e.to_string()))?;
            tokio::fs::write(&path, body)
                .await
                .map_err(|e| MemoryError::Persist(e.to_string()))?;
        }
        Ok(())
    }
}
