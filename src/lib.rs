//! # flowrun: flow execution engine
//!
//! Runs named flows of a compiled application against a persistent, typed
//! state tree. A flow run may call AI providers and tools, sub-pipelines,
//! and a record store; every run is wrapped in one store transaction and
//! leaves an append-only trace even when it fails partway through.
//!
//! ## Layers
//!
//! - Compiled program model ([`ast`]): flows, records, AI profiles, functions, jobs.
//! - Interpreter ([`eval`]): expression evaluation, statements, record
//!   operations, agents, parallel branches, declarative and AI-pattern flows.
//! - Guards ([`guard`]): `requires` rules evaluated before a flow or a mutation.
//! - Pipelines ([`pipeline`]): the closed set of ingestion, retrieval and answer.
//! - Coordinator ([`runtime`]): transaction, persistence and failure recovery.
//! - Error contract ([`boundary`]): classification and message scrubbing.
//!
//! ## Collaborators
//!
//! Store, memory, AI provider, tool registry, document index and sandbox
//! runner are traits bundled in [`services::Services`]. In-process
//! implementations back every one of them, so a run needs no external
//! service.
//!
//! ```text
//! RunRequest → FlowRunner::run_flow → guard → begin → body → jobs → audit → save → commit → memory
//! ```

pub mod ast;
pub mod audit;
pub mod boundary;
pub mod config;
pub mod error;
pub mod eval;
pub mod guard;
pub mod jobs;
pub mod memory;
pub mod pipeline;
pub mod provider;
pub mod runtime;
pub mod sandbox;
pub mod services;
pub mod store;
pub mod trace;

// Re-exports
pub use error::*;
pub use eval::evaluator::{EvalError, EvalResult};
pub use eval::value::{Record, State, Value};
pub use runtime::{ExecutionResult, FlowRunner, RunOutcome, RunRequest, RunStatus, RuntimeError};
pub use services::Services;

#[cfg(test)]
mod tests {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    #[ctor::ctor]
    fn init_tests() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");
    }
}
