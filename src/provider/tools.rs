use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{ProviderError, ProviderResult, ToolRegistry};
use crate::eval::value::Value;

type ToolFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Tool registry backed by plain closures.
#[derive(Clone, Default)]
pub struct FnToolRegistry {
    tools: Arc<DashMap<String, ToolFn>>,
}

impl FnToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(self, name: impl Into<String>, tool: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.tools.insert(name.into(), Arc::new(tool));
        self
    }
}

#[async_trait]
impl ToolRegistry for FnToolRegistry {
    async fn execute_tool(&self, name: &str, args: &Value) -> ProviderResult<Value> {
        let tool = self
            .tools
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProviderError::UnknownTool(name.to_string()))?;
        tool(args).map_err(|message| ProviderError::ToolFailed {
            name: name.to_string(),
            message,
        })
    }

    fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}
