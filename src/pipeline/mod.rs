//! Sub-pipelines callable from flows.
//!
//! The set is closed: ingestion, retrieval and answer. Each has a typed
//! input/output contract and requires the `uploads` capability. Every step
//! a pipeline runs is traced with a content checksum, whether or not the
//! pipeline succeeds.

mod answer;
pub mod index;
mod ingestion;
mod retrieval;

use std::collections::BTreeMap;
use std::str::FromStr;

use strum::{Display, EnumString};
use tracing::debug;

use crate::ast::{FieldSpec, TypeName};
use crate::audit::sha256_hex;
use crate::eval::context::{ExecutionContext, ExecutionMode};
use crate::eval::evaluator::{EvalError, EvalResult};
use crate::eval::value::Value;
use crate::trace::{StepStatus, TraceEvent};

pub use index::{
    DocumentChunk, DocumentIndex, INDEX_STATE_KEY, INGESTION_STATE_KEY, IndexError, ScoredChunk,
};

pub type PipelineValues = BTreeMap<String, Value>;

pub const UPLOADS_CAPABILITY: &str = "uploads";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineKind {
    Ingestion,
    Retrieval,
    Answer,
}

#[derive(Debug, Clone)]
pub struct PipelineContract {
    pub capability: &'static str,
    pub inputs: Vec<FieldSpec>,
    pub outputs: Vec<FieldSpec>,
}

impl PipelineKind {
    pub fn contract(&self) -> PipelineContract {
        let json_list = || TypeName::List(Box::new(TypeName::Json));
        let (inputs, outputs) = match self {
            PipelineKind::Ingestion => (
                vec![
                    FieldSpec::required("upload_id", TypeName::Text),
                    FieldSpec::required("content", TypeName::Text),
                    FieldSpec::optional("chunk_size", TypeName::Number),
                ],
                vec![
                    FieldSpec::required("report", TypeName::Json),
                    FieldSpec::required("chunk_count", TypeName::Number),
                ],
            ),
            PipelineKind::Retrieval => (
                vec![
                    FieldSpec::required("query", TypeName::Text),
                    FieldSpec::optional("limit", TypeName::Number),
                ],
                vec![FieldSpec::required("results", json_list())],
            ),
            PipelineKind::Answer => (
                vec![
                    FieldSpec::required("query", TypeName::Text),
                    FieldSpec::optional("limit", TypeName::Number),
                    FieldSpec::optional("model", TypeName::Text),
                ],
                vec![
                    FieldSpec::required("answer_text", TypeName::Text),
                    FieldSpec::required("citations", TypeName::List(Box::new(TypeName::Text))),
                    FieldSpec::required("confidence", TypeName::Number),
                ],
            ),
        };
        PipelineContract {
            capability: UPLOADS_CAPABILITY,
            inputs,
            outputs,
        }
    }
}

/// Step trace collected while a pipeline runs.
pub(crate) struct StepLog {
    pipeline: PipelineKind,
    steps: Vec<TraceEvent>,
}

impl StepLog {
    fn new(pipeline: PipelineKind) -> Self {
        Self {
            pipeline,
            steps: Vec::new(),
        }
    }

    fn push(&mut self, kind: &str, status: StepStatus, checksum: String) {
        let step_id = format!("{}.{}.{:03}", self.pipeline, kind, self.steps.len() + 1);
        self.steps.push(TraceEvent::PipelineStep {
            pipeline: self.pipeline.to_string(),
            step_id,
            kind: kind.to_string(),
            status,
            checksum,
        });
    }

    pub(crate) fn ok(&mut self, kind: &str, content: &Value) {
        let checksum = sha256_hex(serde_json::Value::from(content).to_string().as_bytes());
        self.push(kind, StepStatus::Ok, checksum);
    }

    /// Record a failed step and build the error it raises.
    pub(crate) fn fail(&mut self, kind: &str, message: impl Into<String>) -> EvalError {
        let message = message.into();
        self.push(kind, StepStatus::Error, sha256_hex(message.as_bytes()));
        EvalError::Pipeline {
            pipeline: self.pipeline.to_string(),
            step: kind.to_string(),
            message,
        }
    }

    fn len(&self) -> usize {
        self.steps.len()
    }
}

/// Integer argument with a default, rejecting non-positive or fractional values.
pub(crate) fn positive_count(
    pipeline: PipelineKind,
    args: &PipelineValues,
    name: &str,
    default: usize,
) -> EvalResult<usize> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => match value.as_count() {
            Some(count) if count > 0 => Ok(count as usize),
            _ => Err(EvalError::Contract {
                pipeline: pipeline.to_string(),
                message: format!("'{}' must be a positive integer", name),
            }),
        },
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineDispatcher;

impl PipelineDispatcher {
    pub fn new() -> Self {
        Self
    }

    #[tracing::instrument(skip(self, context, args), level = "debug")]
    pub async fn dispatch(
        &self,
        context: &mut ExecutionContext,
        pipeline: &str,
        args: PipelineValues,
    ) -> EvalResult<PipelineValues> {
        if context.mode() == ExecutionMode::Function {
            return Err(EvalError::NotSupported(
                "Functions cannot call pipelines".to_string(),
            ));
        }
        let kind = PipelineKind::from_str(pipeline)
            .map_err(|_| EvalError::UnknownPipeline(pipeline.to_string()))?;
        let contract = kind.contract();
        validate_inputs(kind, &contract, &args)?;
        if !context.flow.capabilities.contains(contract.capability) {
            return Err(EvalError::CapabilityMissing {
                pipeline: kind.to_string(),
                capability: contract.capability.to_string(),
            });
        }

        context.trace(TraceEvent::PipelineCallStart {
            pipeline: kind.to_string(),
            inputs: args.keys().cloned().collect(),
        });
        let mut log = StepLog::new(kind);
        let result = match kind {
            PipelineKind::Ingestion => ingestion::run(&mut log, &args, context).await,
            PipelineKind::Retrieval => retrieval::run(&mut log, &args, context).await,
            PipelineKind::Answer => answer::run(&mut log, &args, context).await,
        }
        .and_then(|outputs| validate_outputs(kind, &contract, outputs));

        let step_count = log.len();
        for step in log.steps {
            context.trace(step);
        }
        let (status, error) = match &result {
            Ok(_) => (StepStatus::Ok, None),
            Err(err) => (StepStatus::Error, Some(err.to_string())),
        };
        debug!(pipeline = %kind, ?status, steps = step_count, "pipeline finished");
        context.trace(TraceEvent::PipelineCallEnd {
            pipeline: kind.to_string(),
            status,
            steps: step_count,
            error,
        });
        context.record_step_with(
            "pipeline_call",
            format!("call pipeline \"{}\"", kind),
            None,
            Value::map([("steps", Value::from(step_count))]),
        );
        result
    }
}

fn validate_inputs(
    kind: PipelineKind,
    contract: &PipelineContract,
    args: &PipelineValues,
) -> EvalResult<()> {
    let violation = |message: String| EvalError::Contract {
        pipeline: kind.to_string(),
        message,
    };
    if let Some(unknown) = args
        .keys()
        .find(|name| !contract.inputs.iter().any(|field| &field.name == *name))
    {
        return Err(violation(format!("unknown input '{}'", unknown)));
    }
    for field in &contract.inputs {
        match args.get(&field.name) {
            None | Some(Value::Null) if field.required => {
                return Err(violation(format!("missing input '{}'", field.name)));
            }
            Some(value) if !matches!(value, Value::Null) && !field.type_name.accepts(value) => {
                return Err(violation(format!(
                    "input '{}' expects {}, got {}",
                    field.name,
                    field.type_name.name(),
                    value.type_name()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_outputs(
    kind: PipelineKind,
    contract: &PipelineContract,
    outputs: PipelineValues,
) -> EvalResult<PipelineValues> {
    for field in &contract.outputs {
        let valid = match outputs.get(&field.name) {
            Some(value) => field.type_name.accepts(value),
            None => !field.required,
        };
        if !valid {
            return Err(EvalError::Contract {
                pipeline: kind.to_string(),
                message: format!("output '{}' does not match {}", field.name, field.type_name.name()),
            });
        }
    }
    Ok(outputs)
}
