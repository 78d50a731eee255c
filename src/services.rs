//! Collaborators a run talks to, bundled as shared trait-object handles.

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::config::EngineConfig;
use crate::memory::{InMemoryMemoryManager, MemoryManager};
use crate::provider::{AiProvider, FnToolRegistry, ScriptedProvider, ToolRegistry};
use crate::sandbox::SandboxRunner;
use crate::store::{InMemoryStore, Store};

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub ai: Arc<dyn AiProvider>,
    pub tools: Arc<dyn ToolRegistry>,
    pub memory: Arc<dyn MemoryManager>,
    pub sandbox: Option<Arc<dyn SandboxRunner>>,
    pub audit: Arc<AuditLog>,
}

impl Services {
    /// Every collaborator backed by its in-process implementation.
    pub fn in_memory() -> Self {
        Self::in_memory_with(&EngineConfig::default())
    }

    /// In-process collaborators, with memory configured from `config.memory`.
    pub fn in_memory_with(config: &EngineConfig) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            ai: Arc::new(ScriptedProvider::new()),
            tools: Arc::new(FnToolRegistry::new()),
            memory: Arc::new(InMemoryMemoryManager::new(config.memory.clone())),
            sandbox: None,
            audit: Arc::new(AuditLog::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    pub fn with_ai(mut self, ai: Arc<dyn AiProvider>) -> Self {
        self.ai = ai;
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryManager>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = audit;
        self
    }
}
