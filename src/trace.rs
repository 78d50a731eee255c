//! Diagnostic output of a run: the append-only trace log and the
//! execution-step recorder behind "explain" views.
//!
//! The trace schema is versioned by its `type` tag. New entry types may be
//! added; an existing type never changes the meaning of its fields.

use serde::{Deserialize, Serialize};

use crate::ast::{LogLevel, MergePolicy, MetricOperation, Span};
use crate::eval::value::Value;

pub const TRACE_SCHEMA_VERSION: &str = "trace@1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationOutcome {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    Save,
    Create,
    Update,
    Delete,
}

impl RecordAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordAction::Save => "save",
            RecordAction::Create => "create",
            RecordAction::Update => "update",
            RecordAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Error,
    Skipped,
    Ran,
}

/// One AI provider exchange, including the tool loop it drove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiTrace {
    pub ai_name: String,
    pub agent_name: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub input: String,
    pub output: String,
    pub memory: Value,
    pub tool_calls: Vec<Value>,
    pub tool_results: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    FlowStart {
        flow_name: String,
    },
    FlowEnd {
        flow_name: String,
        ok: bool,
    },
    AuthorizationCheck {
        subject: String,
        outcome: AuthorizationOutcome,
        category: Option<String>,
        reason: Option<String>,
    },
    FlowStep {
        flow_name: String,
        step_id: String,
        step_kind: String,
        ordinal: usize,
        status: StepStatus,
        gate: Option<Value>,
    },
    AiCall(AiTrace),
    ParallelAgents {
        target: String,
        agents: Vec<AiTrace>,
    },
    AgentStepStart {
        agent: String,
        index: usize,
    },
    AgentStepEnd {
        agent: String,
        index: usize,
        status: StepStatus,
    },
    ToolCall {
        name: String,
        args: Value,
        result: Option<Value>,
    },
    ParallelBranch {
        branch: String,
        index: usize,
        status: StepStatus,
        error: Option<String>,
    },
    Merge {
        policy: MergePolicy,
        succeeded: Vec<String>,
        failed: Vec<String>,
    },
    RecordWrite {
        action: RecordAction,
        record: String,
        count: usize,
    },
    PipelineCallStart {
        pipeline: String,
        inputs: Vec<String>,
    },
    PipelineStep {
        pipeline: String,
        step_id: String,
        kind: String,
        status: StepStatus,
        checksum: String,
    },
    PipelineCallEnd {
        pipeline: String,
        status: StepStatus,
        steps: usize,
        error: Option<String>,
    },
    ThemeChange {
        value: String,
    },
    Log {
        level: LogLevel,
        message: String,
        fields: Value,
    },
    Metric {
        op: MetricOperation,
        name: String,
        value: f64,
    },
    JobEnqueued {
        job: String,
        due_at: u64,
    },
    TimeAdvanced {
        amount: u64,
        now: u64,
    },
    JobRun {
        job: String,
        status: StepStatus,
    },
    Yield {
        value: Value,
    },
    AuditEntry {
        entry_id: String,
        hash: String,
    },
    RuntimeError {
        error_id: String,
        boundary: String,
        kind: String,
    },
}

impl TraceEvent {
    /// The serialized `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            TraceEvent::FlowStart { .. } => "flow_start",
            TraceEvent::FlowEnd { .. } => "flow_end",
            TraceEvent::AuthorizationCheck { .. } => "authorization_check",
            TraceEvent::FlowStep { .. } => "flow_step",
            TraceEvent::AiCall(_) => "ai_call",
            TraceEvent::ParallelAgents { .. } => "parallel_agents",
            TraceEvent::AgentStepStart { .. } => "agent_step_start",
            TraceEvent::AgentStepEnd { .. } => "agent_step_end",
            TraceEvent::ToolCall { .. } => "tool_call",
            TraceEvent::ParallelBranch { .. } => "parallel_branch",
            TraceEvent::Merge { .. } => "merge",
            TraceEvent::RecordWrite { .. } => "record_write",
            TraceEvent::PipelineCallStart { .. } => "pipeline_call_start",
            TraceEvent::PipelineStep { .. } => "pipeline_step",
            TraceEvent::PipelineCallEnd { .. } => "pipeline_call_end",
            TraceEvent::ThemeChange { .. } => "theme_change",
            TraceEvent::Log { .. } => "log",
            TraceEvent::Metric { .. } => "metric",
            TraceEvent::JobEnqueued { .. } => "job_enqueued",
            TraceEvent::TimeAdvanced { .. } => "time_advanced",
            TraceEvent::JobRun { .. } => "job_run",
            TraceEvent::Yield { .. } => "yield",
            TraceEvent::AuditEntry { .. } => "audit_entry",
            TraceEvent::RuntimeError { .. } => "runtime_error",
        }
    }
}

/// A single "explain" entry: what the engine did and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    pub kind: String,
    pub what: String,
    pub because: Option<String>,
    pub data: Value,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct StepRecorder {
    steps: Vec<ExecutionStep>,
}

impl StepRecorder {
    pub fn record(
        &mut self,
        kind: &str,
        what: impl Into<String>,
        because: Option<String>,
        data: Value,
        span: Option<Span>,
    ) {
        let id = format!("step:{:04}", self.steps.len() + 1);
        self.steps.push(ExecutionStep {
            id,
            kind: kind.to_string(),
            what: what.into(),
            because,
            data,
            line: span.map(|s| s.line),
            column: span.map(|s| s.column),
        });
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_steps(self) -> Vec<ExecutionStep> {
        self.steps
    }

    /// Append steps produced by a forked context, renumbering them in order.
    pub fn absorb(&mut self, other: Vec<ExecutionStep>) {
        for step in other {
            let id = format!("step:{:04}", self.steps.len() + 1);
            self.steps.push(ExecutionStep { id, ..step });
        }
    }
}
