//! AI provider and tool registry seams.
//!
//! The engine asks an [`AiProvider`] for one turn at a time. A turn either
//! yields the final text output or requests a tool call, which the engine
//! executes through the [`ToolRegistry`] and feeds back on the next turn.

pub mod scripted;
pub mod tools;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eval::value::Value;

pub use scripted::ScriptedProvider;
pub use tools::FnToolRegistry;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider misconfigured: {0}")]
    Misconfigured(String),

    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Tool '{name}' failed: {message}")]
    ToolFailed { name: String, message: String },
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// One provider turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_input: String,
    pub tools: Vec<String>,
    pub memory: Value,
    pub tool_results: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AiResponse {
    Output(String),
    ToolCall { name: String, args: Value },
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn ask(&self, request: AiRequest) -> ProviderResult<AiResponse>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn execute_tool(&self, name: &str, args: &Value) -> ProviderResult<Value>;

    fn has_tool(&self, name: &str) -> bool;
}
