use std::collections::BTreeMap;
use std::time::Duration;

use strum::IntoStaticStr;
use thiserror::Error;
use tracing::debug;

use super::context::ExecutionContext;
use super::declarative::DeclarativeRunner;
use super::patterns::PatternRunner;
use super::statement::{ControlFlow, StatementEvaluator, StatementResult};
use super::value::Value;
use crate::ast::FlowKind;
use crate::boundary::Boundary;
use crate::guard::GuardCategory;
use crate::memory::MemoryError;
use crate::provider::ProviderError;
use crate::store::StoreError;
use crate::trace::{StepStatus, TraceEvent};

/// Errors raised while evaluating a flow.
///
/// The variant name in snake case is the stable `kind` reported to callers.
#[derive(Error, Debug, Clone, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum EvalError {
    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("Missing attribute '{attribute}' on '{base}'")]
    MissingAttribute { base: String, attribute: String },

    #[error("Unknown state path 'state.{path}': {fault}")]
    UnknownStatePath { path: String, fault: String },

    #[error("{context} expects {expected}, got {found}")]
    TypeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Cannot assign to constant '{0}'")]
    ConstantReassignment(String),

    #[error("Cannot set '{0}' before it is declared with let")]
    UndeclaredVariable(String),

    #[error("{subject} access is not permitted ({reason})")]
    GuardDenied {
        subject: String,
        category: GuardCategory,
        reason: String,
    },

    #[error("Unknown pipeline '{0}'")]
    UnknownPipeline(String),

    #[error("Pipeline '{pipeline}' requires the '{capability}' capability")]
    CapabilityMissing {
        pipeline: String,
        capability: String,
    },

    #[error("Pipeline '{pipeline}' contract violation: {message}")]
    Contract { pipeline: String, message: String },

    #[error("Pipeline '{pipeline}' failed at step '{step}': {message}")]
    Pipeline {
        pipeline: String,
        step: String,
        message: String,
    },

    #[error("Unknown record '{0}'")]
    UnknownRecord(String),

    #[error("Record '{record}' is invalid: {message}")]
    Validation { record: String, message: String },

    #[error("Unknown {kind} '{name}'")]
    UnknownDeclaration { kind: &'static str, name: String },

    #[error("Duplicate argument '{0}'")]
    DuplicateArgument(String),

    #[error("Agent call limit exceeded in flow (limit {limit})")]
    AgentCallLimitExceeded { limit: usize },

    #[error("Parallel limit exceeded: {requested} requested, limit {limit}")]
    ParallelLimitExceeded { requested: usize, limit: usize },

    #[error("Parallel tasks cannot change {0}")]
    ParallelMutation(&'static str),

    #[error("Loop exceeded {0} iterations")]
    LoopLimitExceeded(usize),

    #[error("{0} is not supported")]
    NotSupported(String),

    #[error("Store {action} failed: {source}")]
    Store { action: String, source: StoreError },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Sandbox execution failed: {0}")]
    Sandbox(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Application(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EvalResult<T> = Result<T, EvalError>;

impl EvalError {
    pub fn store(action: impl Into<String>, source: StoreError) -> Self {
        EvalError::Store {
            action: action.into(),
            source,
        }
    }

    pub fn type_mismatch(context: impl Into<String>, expected: &str, found: &Value) -> Self {
        EvalError::TypeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            found: found.type_name().to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// The layer this error is attributed to.
    pub fn boundary(&self) -> Boundary {
        match self {
            EvalError::Store { .. } => Boundary::Store,
            EvalError::Memory(_) => Boundary::Memory,
            EvalError::GuardDenied {
                category: GuardCategory::Authentication | GuardCategory::Permission,
                ..
            } => Boundary::Authentication,
            EvalError::Validation { .. } | EvalError::Contract { .. } => Boundary::Data,
            EvalError::Internal(_) => Boundary::Internal,
            _ => Boundary::Engine,
        }
    }

    /// Whether a user `try` block may recover from this error.
    ///
    /// Transactional and resource-limit failures always reach the coordinator.
    pub fn is_catchable(&self) -> bool {
        !matches!(
            self,
            EvalError::Store { .. }
                | EvalError::Memory(_)
                | EvalError::AgentCallLimitExceeded { .. }
                | EvalError::ParallelLimitExceeded { .. }
                | EvalError::LoopLimitExceeded(_)
                | EvalError::Internal(_)
        )
    }

    /// Value bound to a `catch` variable.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("kind".to_string(), Value::from(self.kind()));
        map.insert("message".to_string(), Value::from(self.to_string()));
        Value::Map(map)
    }
}

/// Runs a flow body with the runner its kind calls for.
#[derive(Default)]
pub struct Evaluator {
    statement_evaluator: StatementEvaluator,
    declarative_runner: DeclarativeRunner,
    pattern_runner: PatternRunner,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute the flow body. A `return` is the normal completion path.
    #[tracing::instrument(skip(self, context), fields(flow = %context.flow.name), level = "debug")]
    pub async fn run_body(&self, context: &mut ExecutionContext) -> EvalResult<Value> {
        let flow = context.flow.clone();
        match &flow.kind {
            FlowKind::Statements(body) => {
                match self.statement_evaluator.eval_block(body, context).await? {
                    StatementResult::Control(ControlFlow::Return(value)) => {
                        context.last_value = value;
                    }
                    StatementResult::Value(_) => {}
                }
            }
            FlowKind::Declarative(steps) => {
                self.declarative_runner.run(steps, context).await?;
            }
            FlowKind::AiPattern(spec) => {
                self.pattern_runner.run(spec, context).await?;
            }
            FlowKind::Sandboxed => {
                self.run_sandboxed(context).await?;
            }
        }
        Ok(context.last_value.clone())
    }

    async fn run_sandboxed(&self, context: &mut ExecutionContext) -> EvalResult<()> {
        let runner = context.services.sandbox.clone().ok_or_else(|| {
            EvalError::NotSupported("Sandboxed flow without a sandbox runner".to_string())
        })?;
        let input = context.local("input").cloned().unwrap_or_default();
        let payload = Value::map([
            ("input", input),
            ("state", Value::Map(context.state().clone())),
            ("identity", context.identity().clone()),
        ]);
        let result = runner.run(&context.flow.name, payload).await;
        if !result.ok {
            let message = result
                .error
                .map(|failure| failure.message)
                .unwrap_or_else(|| "Sandbox execution failed.".to_string());
            return Err(EvalError::Sandbox(message));
        }
        context.record_step("sandbox", format!("ran in {}", result.runner));
        context.last_value = result.result;
        Ok(())
    }

    /// Run queued jobs that are due on the logical clock, in enqueue order.
    pub async fn run_due_jobs(&self, context: &mut ExecutionContext) -> EvalResult<()> {
        let limit = context.config.limits.max_loop_iterations;
        let mut ran = 0usize;
        loop {
            let due = context.jobs.take_due();
            if due.is_empty() {
                return Ok(());
            }
            for queued in due {
                ran += 1;
                if ran > limit {
                    return Err(EvalError::LoopLimitExceeded(limit));
                }
                let job = context.program.jobs.get(&queued.job).cloned().ok_or_else(|| {
                    EvalError::UnknownDeclaration {
                        kind: "job",
                        name: queued.job.clone(),
                    }
                })?;
                debug!(job = %job.name, "running job");
                let mut locals = context.locals().clone();
                locals.insert("input".to_string(), queued.input);
                let saved = context.swap_locals(locals);
                let result = self.statement_evaluator.eval_block(&job.body, context).await;
                context.swap_locals(saved);
                let status = if result.is_ok() {
                    StepStatus::Ok
                } else {
                    StepStatus::Error
                };
                context.trace(TraceEvent::JobRun {
                    job: job.name.clone(),
                    status,
                });
                result?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_snake_case_variant_name() {
        assert_eq!(
            EvalError::UnknownVariable("x".to_string()).kind(),
            "unknown_variable"
        );
        assert_eq!(
            EvalError::AgentCallLimitExceeded { limit: 5 }.kind(),
            "agent_call_limit_exceeded"
        );
    }

    #[test]
    fn test_boundaries_follow_raising_layer() {
        assert_eq!(
            EvalError::store("commit", StoreError::NoTransaction).boundary(),
            Boundary::Store
        );
        assert_eq!(
            EvalError::Memory(MemoryError::Persist("x".to_string())).boundary(),
            Boundary::Memory
        );
        assert_eq!(
            EvalError::Validation {
                record: "Order".to_string(),
                message: "x".to_string()
            }
            .boundary(),
            Boundary::Data
        );
        assert_eq!(
            EvalError::NotSupported("x".to_string()).boundary(),
            Boundary::Engine
        );
    }

    #[test]
    fn test_transactional_errors_are_not_catchable() {
        assert!(!EvalError::store("save", StoreError::NoTransaction).is_catchable());
        assert!(!EvalError::AgentCallLimitExceeded { limit: 5 }.is_catchable());
        assert!(EvalError::Application("boom".to_string()).is_catchable());
    }
}
