//! Runner for declarative flows: an ordered list of input, require, create,
//! update and delete steps.
//!
//! A false `require` step closes the gate; every later step is reported as
//! skipped instead of run.

use super::context::ExecutionContext;
use super::evaluator::{EvalError, EvalResult};
use super::statement::StatementEvaluator;
use super::value::{Record, Value};
use crate::ast::{Expression, FieldSpec, FlowStep};
use crate::trace::{RecordAction, StepStatus, TraceEvent};

#[derive(Default)]
pub struct DeclarativeRunner {
    statements: StatementEvaluator,
}

impl DeclarativeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run(&self, steps: &[FlowStep], context: &mut ExecutionContext) -> EvalResult<()> {
        let flow_name = context.flow.name.clone();
        let mut closed_gate: Option<Value> = None;

        for (index, step) in steps.iter().enumerate() {
            let ordinal = index + 1;
            let step_id = format!("{}.{}.{:03}", flow_name, step.kind_name(), ordinal);
            if let Some(gate) = &closed_gate {
                context.trace(TraceEvent::FlowStep {
                    flow_name: flow_name.clone(),
                    step_id,
                    step_kind: step.kind_name().to_string(),
                    ordinal,
                    status: StepStatus::Skipped,
                    gate: Some(gate.clone()),
                });
                continue;
            }

            let (status, gate) = match self.run_step(step, context).await {
                Ok(gate) => (StepStatus::Ok, gate),
                Err(err) => {
                    context.trace(TraceEvent::FlowStep {
                        flow_name: flow_name.clone(),
                        step_id,
                        step_kind: step.kind_name().to_string(),
                        ordinal,
                        status: StepStatus::Error,
                        gate: None,
                    });
                    return Err(err);
                }
            };
            if let Some(gate) = &gate {
                if gate.as_map().and_then(|g| g.get("allowed")) == Some(&Value::Boolean(false)) {
                    closed_gate = Some(gate.clone());
                }
            }
            context.trace(TraceEvent::FlowStep {
                flow_name: flow_name.clone(),
                step_id,
                step_kind: step.kind_name().to_string(),
                ordinal,
                status,
                gate,
            });
        }
        context.record_step(
            "declarative_flow",
            format!("ran {} steps", steps.len()),
        );
        Ok(())
    }

    /// Run one step, returning the gate it produced, if any.
    async fn run_step(
        &self,
        step: &FlowStep,
        context: &mut ExecutionContext,
    ) -> EvalResult<Option<Value>> {
        match step {
            FlowStep::Input { fields } => {
                validate_input(fields, context)?;
                Ok(None)
            }
            FlowStep::Require { condition } => {
                let allowed = self
                    .statements
                    .eval_condition(condition, "require step", context)
                    .await?;
                Ok(Some(Value::map([("allowed", Value::Boolean(allowed))])))
            }
            FlowStep::Create { record, fields } => {
                let schema = StatementEvaluator::schema(context, record)?;
                let values = self.eval_fields(fields, context).await?;
                let created = self
                    .statements
                    .insert_record(&schema, values, RecordAction::Create, context)
                    .await?;
                context.last_value = Value::Map(created);
                Ok(None)
            }
            FlowStep::Update {
                record,
                predicate,
                updates,
            } => {
                let schema = StatementEvaluator::schema(context, record)?;
                let updated = self
                    .statements
                    .update_records(&schema, predicate, updates, context)
                    .await?;
                context.last_value = Value::from(updated.len());
                Ok(None)
            }
            FlowStep::Delete { record, predicate } => {
                let schema = StatementEvaluator::schema(context, record)?;
                let deleted = self
                    .statements
                    .delete_records(&schema, predicate, context)
                    .await?;
                context.last_value = Value::from(deleted);
                Ok(None)
            }
        }
    }

    async fn eval_fields(
        &self,
        fields: &[(String, Expression)],
        context: &mut ExecutionContext,
    ) -> EvalResult<Record> {
        let mut values = Record::new();
        for (name, expr) in fields {
            let value = self.statements.eval_value(expr, context).await?;
            values.insert(name.clone(), value);
        }
        Ok(values)
    }
}

fn validate_input(fields: &[FieldSpec], context: &ExecutionContext) -> EvalResult<()> {
    let invalid = |message: String| EvalError::Validation {
        record: "input".to_string(),
        message,
    };
    let empty = Record::new();
    let input = match context.local("input") {
        Some(Value::Map(input)) => input,
        Some(Value::Null) | None => &empty,
        Some(other) => {
            return Err(invalid(format!(
                "input must be a map, got {}",
                other.type_name()
            )));
        }
    };
    for field in fields {
        match input.get(&field.name) {
            None | Some(Value::Null) if field.required => {
                return Err(invalid(format!("missing required field '{}'", field.name)));
            }
            Some(value) if !matches!(value, Value::Null) && !field.type_name.accepts(value) => {
                return Err(invalid(format!(
                    "field '{}' expects {}, got {}",
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
