//! Flow run coordinator.
//!
//! [`FlowRunner::run_flow`] wraps one flow run in the store transaction:
//!
//! ```text
//! NotStarted → StoreBegun → BodyExecuted → StateSaved → Committed → MemoryPersisted → Done
//! ```
//!
//! Any failure before the commit rolls the store back. Memory is persisted
//! after the commit, so a memory failure leaves the committed store in
//! place and is reported as `committed_memory_persist_failed`.
//!
//! Whatever happens, the run ends with a `flow_end` trace and a
//! [`RunOutcome`] recording which phases were attempted, succeeded and
//! failed.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::ast::{Flow, Program};
use crate::audit::{StateDiff, sha256_hex};
use crate::boundary::{
    Boundary, ErrorCategory, ErrorClassifier, ErrorLocation, ErrorPack, ScrubContext,
};
use crate::config::EngineConfig;
use crate::eval::context::{ContextSeed, ExecutionContext, LogEntry, Metrics};
use crate::eval::evaluator::{EvalError, EvalResult, Evaluator};
use crate::eval::value::{State, Value};
use crate::guard::{AuthContext, GuardEnforcer};
use crate::services::Services;
use crate::trace::{ExecutionStep, TraceEvent};

pub const RUN_OUTCOME_FILE: &str = "run_outcome.json";
pub const EXECUTION_STEPS_FILE: &str = "execution_steps.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Ok,
    Failed,
    CommittedMemoryPersistFailed,
}

/// What a run attempted and how each phase ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub flow_name: String,
    pub status: RunStatus,
    pub state_loaded_from_store: bool,
    pub store_begin_attempted: bool,
    pub store_begin_failed: bool,
    pub store_began: bool,
    pub body_attempted: bool,
    pub body_executed: bool,
    pub body_failed: bool,
    pub store_committed: bool,
    pub store_commit_failed: bool,
    pub store_rolled_back: bool,
    pub store_rollback_failed: bool,
    pub state_save_attempted: bool,
    pub state_save_succeeded: bool,
    pub state_save_failed: bool,
    pub memory_persist_attempted: bool,
    pub memory_persist_succeeded: bool,
    pub memory_persist_failed: bool,
    pub error_escaped: bool,
}

impl RunOutcome {
    fn new(flow_name: &str) -> Self {
        let seed = format!("{}:{}:{}", flow_name, Utc::now().to_rfc3339(), Uuid::new_v4());
        Self {
            run_id: format!("run-{}", &sha256_hex(seed.as_bytes())[..16]),
            flow_name: flow_name.to_string(),
            ..Self::default()
        }
    }

    fn finish(&mut self, failed: bool) {
        self.error_escaped = failed;
        self.status = match (failed, self.store_committed && self.memory_persist_failed) {
            (false, _) => RunStatus::Ok,
            (true, true) => RunStatus::CommittedMemoryPersistFailed,
            (true, false) => RunStatus::Failed,
        };
    }
}

/// Classified failure of a flow run, with the diagnostics gathered up to it.
#[derive(Debug, Error)]
#[error("{} error ({}): {}", .pack.boundary, .pack.kind, .pack.message)]
pub struct RuntimeError {
    pub pack: ErrorPack,
    #[source]
    pub cause: EvalError,
    pub traces: Vec<TraceEvent>,
    pub execution_steps: Vec<ExecutionStep>,
    pub outcome: RunOutcome,
}

impl RuntimeError {
    pub fn boundary(&self) -> Boundary {
        self.pack.boundary
    }

    pub fn kind(&self) -> &str {
        &self.pack.kind
    }

    pub fn error_id(&self) -> &str {
        &self.pack.error_id
    }

    /// Status the serving layer answers with.
    pub fn http_status(&self) -> u16 {
        match (&self.cause, self.pack.boundary) {
            (_, Boundary::Authentication) if self.pack.category == ErrorCategory::ActionDenied => {
                403
            }
            (_, Boundary::Authentication) => 401,
            (EvalError::GuardDenied { .. } | EvalError::CapabilityMissing { .. }, _) => 403,
            (_, Boundary::Data) => 400,
            (_, Boundary::Store | Boundary::Memory) => 503,
            (EvalError::Timeout(_), _) => 504,
            (
                EvalError::AgentCallLimitExceeded { .. }
                | EvalError::ParallelLimitExceeded { .. }
                | EvalError::LoopLimitExceeded(_),
                _,
            ) => 429,
            (
                EvalError::UnknownPipeline(_)
                | EvalError::UnknownDeclaration { .. }
                | EvalError::NotSupported(_),
                _,
            ) => 400,
            _ => 500,
        }
    }
}

/// Successful run results.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub state: State,
    pub last_value: Value,
    pub traces: Vec<TraceEvent>,
    pub execution_steps: Vec<ExecutionStep>,
    pub yield_messages: Vec<Value>,
    pub runtime_theme: Option<String>,
    pub logs: Vec<LogEntry>,
    pub metrics: Metrics,
    pub outcome: RunOutcome,
}

pub struct RunRequest {
    pub flow: Arc<Flow>,
    pub program: Arc<Program>,
    /// Starting state. When absent, the state persisted in the store is used.
    pub initial_state: Option<State>,
    pub input: Value,
    pub identity: Value,
    pub auth: AuthContext,
    pub session: Option<Value>,
}

impl RunRequest {
    pub fn new(flow: impl Into<Arc<Flow>>, program: impl Into<Arc<Program>>) -> Self {
        Self {
            flow: flow.into(),
            program: program.into(),
            initial_state: None,
            input: Value::Null,
            identity: Value::Null,
            auth: AuthContext::anonymous(),
            session: None,
        }
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Authenticated identity.
    pub fn with_identity(mut self, identity: Value) -> Self {
        self.identity = identity;
        self.auth = AuthContext::authenticated();
        self
    }

    pub fn with_auth(mut self, auth: AuthContext) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_session(mut self, session: Value) -> Self {
        self.session = Some(session);
        self
    }
}

pub struct FlowRunner {
    services: Services,
    config: Arc<EngineConfig>,
    evaluator: Evaluator,
    guard: GuardEnforcer,
}

impl FlowRunner {
    pub fn new(services: Services, config: EngineConfig) -> Self {
        Self {
            services,
            config: Arc::new(config),
            evaluator: Evaluator::default(),
            guard: GuardEnforcer::new(),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[tracing::instrument(skip(self, request), fields(flow = %request.flow.name), level = "debug")]
    pub async fn run_flow(&self, request: RunRequest) -> Result<ExecutionResult, RuntimeError> {
        let mut outcome = RunOutcome::new(&request.flow.name);
        let load_from_store = request.initial_state.is_none();
        let mut context = ExecutionContext::new(ContextSeed {
            flow: request.flow,
            program: request.program,
            config: self.config.clone(),
            services: self.services.clone(),
            state: request.initial_state.unwrap_or_default(),
            input: request.input,
            identity: request.identity,
            auth: request.auth,
            session: request.session,
        });

        let result = self
            .execute(&mut context, &mut outcome, load_from_store)
            .await;
        let failure = match result {
            Ok(()) => None,
            Err(err) => Some(self.recover(&mut context, &mut outcome, err).await),
        };

        context.flush_pending_tool_traces();
        let flow_name = context.flow.name.clone();
        context.trace(TraceEvent::FlowEnd {
            flow_name,
            ok: failure.is_none(),
        });
        outcome.finish(failure.is_some());
        self.write_artifacts(&outcome, context.steps()).await;
        debug!(run_id = %outcome.run_id, status = %outcome.status, "run finished");

        let parts = context.into_parts();
        match failure {
            None => Ok(ExecutionResult {
                state: parts.state,
                last_value: parts.last_value,
                traces: parts.traces,
                execution_steps: parts.steps,
                yield_messages: parts.yield_messages,
                runtime_theme: parts.runtime_theme,
                logs: parts.logs,
                metrics: parts.metrics,
                outcome,
            }),
            Some((pack, cause)) => Err(RuntimeError {
                pack,
                cause,
                traces: parts.traces,
                execution_steps: parts.steps,
                outcome,
            }),
        }
    }

    async fn execute(
        &self,
        context: &mut ExecutionContext,
        outcome: &mut RunOutcome,
        load_from_store: bool,
    ) -> EvalResult<()> {
        let store = self.services.store.clone();
        let flow = context.flow.clone();

        if load_from_store {
            let loaded = store
                .load_state()
                .await
                .map_err(|e| EvalError::store("load_state", e))?;
            if let Some(state) = loaded {
                *context.state_mut() = state;
                outcome.state_loaded_from_store = true;
            }
        }

        if let Some(requires) = flow.requires.as_ref().filter(|r| !r.mentions_mutation()) {
            let subject = format!("flow \"{}\"", flow.name);
            self.guard.enforce(context, requires, &subject).await?;
        }
        context.trace(TraceEvent::FlowStart {
            flow_name: flow.name.clone(),
        });
        let before = flow.audited.then(|| context.state().clone());

        outcome.store_begin_attempted = true;
        if let Err(e) = store.begin().await {
            outcome.store_begin_failed = true;
            return Err(EvalError::store("begin", e));
        }
        outcome.store_began = true;
        debug!("store transaction begun");

        outcome.body_attempted = true;
        let body = match self.evaluator.run_body(context).await {
            Ok(_) => self.evaluator.run_due_jobs(context).await,
            Err(err) => Err(err),
        };
        if let Err(err) = body {
            outcome.body_failed = true;
            return Err(err);
        }
        outcome.body_executed = true;

        if let Some(before) = before {
            let diff = StateDiff::between(&before, context.state());
            let actor = serde_json::Value::from(context.identity());
            let entry = self
                .services
                .audit
                .append(&flow.name, actor, diff, context.record_changes().to_vec())
                .await;
            context.trace(TraceEvent::AuditEntry {
                entry_id: entry.entry_id,
                hash: entry.hash,
            });
        }

        outcome.state_save_attempted = true;
        if let Err(e) = store.save_state(context.state()).await {
            outcome.state_save_failed = true;
            return Err(EvalError::store("save_state", e));
        }
        outcome.state_save_succeeded = true;

        if let Err(e) = store.commit().await {
            outcome.store_commit_failed = true;
            return Err(EvalError::store("commit", e));
        }
        outcome.store_committed = true;
        debug!("store transaction committed");

        outcome.memory_persist_attempted = true;
        let secrets = context.secret_values();
        let persisted = self
            .services
            .memory
            .persist(
                self.config.project_root.as_deref(),
                self.config.app_path.as_deref(),
                &secrets,
            )
            .await;
        if let Err(e) = persisted {
            outcome.memory_persist_failed = true;
            return Err(e.into());
        }
        outcome.memory_persist_succeeded = true;
        Ok(())
    }

    /// Roll back if needed, then classify and trace the failure.
    async fn recover(
        &self,
        context: &mut ExecutionContext,
        outcome: &mut RunOutcome,
        err: EvalError,
    ) -> (ErrorPack, EvalError) {
        if outcome.store_began && !outcome.store_committed {
            match self.services.store.rollback().await {
                Ok(()) => outcome.store_rolled_back = true,
                Err(rollback_err) => {
                    outcome.store_rollback_failed = true;
                    warn!(error = %rollback_err, "rollback failed");
                }
            }
        }

        let flow_name = context.flow.name.clone();
        let location = match &context.current {
            Some(current) => ErrorLocation {
                flow_name,
                statement_kind: Some(current.kind.to_string()),
                statement_index: Some(current.index),
                line: Some(current.span.line),
                column: Some(current.span.column),
            },
            None => ErrorLocation {
                flow_name,
                statement_kind: None,
                statement_index: None,
                line: None,
                column: None,
            },
        };
        let secrets = context.secret_values();
        let scrub = ScrubContext {
            project_root: self.config.project_root.as_deref(),
            secret_values: &secrets,
        };
        let pack = ErrorClassifier::classify(&err, Some(location), &scrub);
        context.trace(TraceEvent::RuntimeError {
            error_id: pack.error_id.clone(),
            boundary: pack.boundary.to_string(),
            kind: pack.kind.clone(),
        });
        error!(
            error_id = %pack.error_id,
            boundary = %pack.boundary,
            kind = %pack.kind,
            message = %pack.message,
            "flow run failed"
        );
        (pack, err)
    }

    async fn write_artifacts(&self, outcome: &RunOutcome, steps: &[ExecutionStep]) {
        let Some(dir) = self.config.artifacts_path() else {
            return;
        };
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(error = %e, "could not create artifacts directory");
            return;
        }
        let files = [
            (RUN_OUTCOME_FILE, serde_json::to_vec_pretty(outcome)),
            (EXECUTION_STEPS_FILE, serde_json::to_vec_pretty(steps)),
        ];
        for (name, encoded) in files {
            let bytes = match encoded {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(file = name, error = %e, "could not encode artifact");
                    continue;
                }
            };
            if let Err(e) = tokio::fs::write(dir.join(name), bytes).await {
                warn!(file = name, error = %e, "could not write artifact");
            }
        }
    }
}
