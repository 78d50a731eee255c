//! Per-run execution context.
//!
//! One [`ExecutionContext`] exists per flow run and is owned by that run
//! alone. State and locals are written only through the statement
//! interpreter; diagnostics (`traces`, execution steps) are append-only.
//!
//! Parallel branches run on [`ExecutionContext::fork`] copies. A fork shares
//! nothing mutable with its parent except the agent-call counter, so the
//! per-run agent cap holds across concurrent branches.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::evaluator::{EvalError, EvalResult};
use super::value::{Record, State, Value};
use crate::ast::{Flow, LogLevel, MetricOperation, Program, Span};
use crate::config::EngineConfig;
use crate::guard::AuthContext;
use crate::jobs::JobQueue;
use crate::services::Services;
use crate::trace::{ExecutionStep, RecordAction, StepRecorder, TraceEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Flow,
    Parallel,
    Function,
}

/// The statement currently executing, used to locate errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentStatement {
    pub kind: &'static str,
    pub index: usize,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordChange {
    pub action: RecordAction,
    pub record: String,
    pub id: Value,
    pub values: Record,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub fields: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub counters: BTreeMap<String, f64>,
    pub timings: BTreeMap<String, Vec<f64>>,
    #[serde(skip)]
    journal: Vec<(MetricOperation, String, f64)>,
}

impl Metrics {
    pub fn apply(&mut self, op: MetricOperation, name: &str, value: f64) {
        match op {
            MetricOperation::Increment | MetricOperation::Add => {
                *self.counters.entry(name.to_string()).or_insert(0.0) += value;
            }
            MetricOperation::Set => {
                self.counters.insert(name.to_string(), value);
            }
            MetricOperation::Record => {
                self.timings.entry(name.to_string()).or_default().push(value);
            }
        }
        self.journal.push((op, name.to_string(), value));
    }

    fn replay(&mut self, other: Metrics) {
        for (op, name, value) in other.journal {
            self.apply(op, &name, value);
        }
    }
}

/// Diagnostics a forked branch hands back to its parent.
#[derive(Debug, Default)]
pub struct BranchDiagnostics {
    traces: Vec<TraceEvent>,
    steps: Vec<ExecutionStep>,
    logs: Vec<LogEntry>,
    metrics: Metrics,
    yield_messages: Vec<Value>,
    record_changes: Vec<RecordChange>,
}

pub struct ExecutionContext {
    pub flow: Arc<Flow>,
    pub program: Arc<Program>,
    pub config: Arc<EngineConfig>,
    pub services: Services,
    state: State,
    locals: BTreeMap<String, Value>,
    constants: HashSet<String>,
    identity: Value,
    auth: AuthContext,
    traces: Vec<TraceEvent>,
    steps: StepRecorder,
    record_changes: Vec<RecordChange>,
    pub last_value: Value,
    agent_calls: Arc<AtomicUsize>,
    mode: ExecutionMode,
    pub current: Option<CurrentStatement>,
    yield_messages: Vec<Value>,
    runtime_theme: Option<String>,
    pub jobs: JobQueue,
    logs: Vec<LogEntry>,
    metrics: Metrics,
    pending_tool_traces: Vec<TraceEvent>,
}

/// Everything needed to seed a context.
pub struct ContextSeed {
    pub flow: Arc<Flow>,
    pub program: Arc<Program>,
    pub config: Arc<EngineConfig>,
    pub services: Services,
    pub state: State,
    pub input: Value,
    pub identity: Value,
    pub auth: AuthContext,
    pub session: Option<Value>,
}

impl ExecutionContext {
    pub fn new(seed: ContextSeed) -> Self {
        let mut locals = BTreeMap::new();
        locals.insert("input".to_string(), seed.input);
        let secrets = seed
            .config
            .secrets
            .names()
            .into_iter()
            .filter_map(|name| {
                let value = seed.config.secrets.get(&name)?.to_string();
                Some((name, Value::Text(value)))
            })
            .collect::<BTreeMap<_, _>>();
        locals.insert("secrets".to_string(), Value::Map(secrets));
        if let Some(session) = seed.session {
            locals.insert("session".to_string(), session);
        }
        Self {
            flow: seed.flow,
            program: seed.program,
            config: seed.config,
            services: seed.services,
            state: seed.state,
            locals,
            constants: HashSet::new(),
            identity: seed.identity,
            auth: seed.auth,
            traces: Vec::new(),
            steps: StepRecorder::default(),
            record_changes: Vec::new(),
            last_value: Value::Null,
            agent_calls: Arc::new(AtomicUsize::new(0)),
            mode: ExecutionMode::Flow,
            current: None,
            yield_messages: Vec::new(),
            runtime_theme: None,
            jobs: JobQueue::default(),
            logs: Vec::new(),
            metrics: Metrics::default(),
            pending_tool_traces: Vec::new(),
        }
    }

    /// Isolated copy for a parallel branch or function call.
    pub fn fork(&self, mode: ExecutionMode) -> Self {
        Self {
            flow: self.flow.clone(),
            program: self.program.clone(),
            config: self.config.clone(),
            services: self.services.clone(),
            state: self.state.clone(),
            locals: self.locals.clone(),
            constants: self.constants.clone(),
            identity: self.identity.clone(),
            auth: self.auth.clone(),
            traces: Vec::new(),
            steps: StepRecorder::default(),
            record_changes: Vec::new(),
            last_value: Value::Null,
            agent_calls: self.agent_calls.clone(),
            mode,
            current: self.current.clone(),
            yield_messages: Vec::new(),
            runtime_theme: self.runtime_theme.clone(),
            jobs: JobQueue::default(),
            logs: Vec::new(),
            metrics: Metrics::default(),
            pending_tool_traces: Vec::new(),
        }
    }

    /// Hand a finished fork's diagnostics back to the parent.
    pub fn into_diagnostics(mut self) -> BranchDiagnostics {
        self.flush_pending_tool_traces();
        BranchDiagnostics {
            traces: self.traces,
            steps: self.steps.into_steps(),
            logs: self.logs,
            metrics: self.metrics,
            yield_messages: self.yield_messages,
            record_changes: self.record_changes,
        }
    }

    pub fn absorb(&mut self, diagnostics: BranchDiagnostics) {
        self.traces.extend(diagnostics.traces);
        self.steps.absorb(diagnostics.steps);
        self.logs.extend(diagnostics.logs);
        self.metrics.replay(diagnostics.metrics);
        self.yield_messages.extend(diagnostics.yield_messages);
        self.record_changes.extend(diagnostics.record_changes);
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn identity(&self) -> &Value {
        &self.identity
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }

    pub fn has_local(&self, name: &str) -> bool {
        self.locals.contains_key(name)
    }

    pub fn is_constant(&self, name: &str) -> bool {
        self.constants.contains(name)
    }

    /// Bind a name, creating it if needed. Constants cannot be rebound.
    pub(crate) fn bind_local(&mut self, name: &str, value: Value) -> EvalResult<()> {
        if self.constants.contains(name) {
            return Err(EvalError::ConstantReassignment(name.to_string()));
        }
        self.locals.insert(name.to_string(), value);
        Ok(())
    }

    /// Bind a scoped name (a loop or lambda binder), returning what it shadowed.
    pub(crate) fn shadow_local(&mut self, name: &str, value: Value) -> EvalResult<Option<Value>> {
        if self.constants.contains(name) {
            return Err(EvalError::ConstantReassignment(name.to_string()));
        }
        Ok(self.locals.insert(name.to_string(), value))
    }

    pub(crate) fn restore_local(&mut self, name: &str, previous: Option<Value>) {
        match previous {
            Some(value) => {
                self.locals.insert(name.to_string(), value);
            }
            None => {
                self.locals.remove(name);
            }
        }
    }

    pub(crate) fn declare_constant(&mut self, name: &str) {
        self.constants.insert(name.to_string());
    }

    /// Replace the locals wholesale, returning the previous set.
    pub(crate) fn swap_locals(&mut self, locals: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        std::mem::replace(&mut self.locals, locals)
    }

    pub(crate) fn locals(&self) -> &BTreeMap<String, Value> {
        &self.locals
    }

    pub fn traces(&self) -> &[TraceEvent] {
        &self.traces
    }

    pub fn trace(&mut self, event: TraceEvent) {
        debug!(event = event.type_name(), "trace");
        self.traces.push(event);
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        self.steps.steps()
    }

    pub fn record_step(&mut self, kind: &str, what: impl Into<String>) {
        let span = self.current.as_ref().map(|c| c.span);
        self.steps.record(kind, what, None, Value::Null, span);
    }

    pub fn record_step_with(
        &mut self,
        kind: &str,
        what: impl Into<String>,
        because: Option<String>,
        data: Value,
    ) {
        let span = self.current.as_ref().map(|c| c.span);
        self.steps.record(kind, what, because, data, span);
    }

    pub fn record_changes(&self) -> &[RecordChange] {
        &self.record_changes
    }

    pub(crate) fn push_record_change(&mut self, change: RecordChange) {
        self.record_changes.push(change);
    }

    /// Count one agent or AI call against the per-run cap.
    pub(crate) fn reserve_agent_calls(&self, count: usize) -> EvalResult<()> {
        let limit = self.config.limits.max_agent_calls;
        let reserved = self
            .agent_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let next = current + count;
                (next <= limit).then_some(next)
            });
        match reserved {
            Ok(_) => Ok(()),
            Err(_) => Err(EvalError::AgentCallLimitExceeded { limit }),
        }
    }

    pub fn agent_calls(&self) -> usize {
        self.agent_calls.load(Ordering::SeqCst)
    }

    pub fn yield_messages(&self) -> &[Value] {
        &self.yield_messages
    }

    pub(crate) fn push_yield(&mut self, value: Value) {
        self.yield_messages.push(value);
    }

    pub fn runtime_theme(&self) -> Option<&str> {
        self.runtime_theme.as_deref()
    }

    pub(crate) fn set_runtime_theme(&mut self, theme: String) {
        self.runtime_theme = Some(theme);
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub(crate) fn push_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut Metrics {
        &mut self.metrics
    }

    pub(crate) fn push_pending_tool_trace(&mut self, event: TraceEvent) {
        self.pending_tool_traces.push(event);
    }

    pub fn flush_pending_tool_traces(&mut self) {
        let pending = std::mem::take(&mut self.pending_tool_traces);
        self.traces.extend(pending);
    }

    pub fn secret_values(&self) -> Vec<String> {
        self.config.secrets.values()
    }

    /// Move the run's results out of the context.
    pub(crate) fn into_parts(self) -> ContextParts {
        ContextParts {
            state: self.state,
            last_value: self.last_value,
            traces: self.traces,
            steps: self.steps.into_steps(),
            yield_messages: self.yield_messages,
            runtime_theme: self.runtime_theme,
            logs: self.logs,
            metrics: self.metrics,
        }
    }
}

pub(crate) struct ContextParts {
    pub state: State,
    pub last_value: Value,
    pub traces: Vec<TraceEvent>,
    pub steps: Vec<ExecutionStep>,
    pub yield_messages: Vec<Value>,
    pub runtime_theme: Option<String>,
    pub logs: Vec<LogEntry>,
    pub metrics: Metrics,
}
