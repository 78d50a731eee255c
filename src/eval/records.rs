//! Record statements: save, create, find, update, delete.
//!
//! Every mutation passes the mutation guard first and is refused inside
//! parallel branches and functions.

use super::context::{ExecutionContext, ExecutionMode, RecordChange};
use super::evaluator::{EvalError, EvalResult};
use super::statement::{StatementEvaluator, StatementResult};
use super::value::{Record, Value};
use crate::ast::{Expression, RecordSchema};
use crate::store::{RECORD_ID_FIELD, Scope};
use crate::trace::{RecordAction, TraceEvent};

impl StatementEvaluator {
    pub(crate) fn schema(context: &ExecutionContext, name: &str) -> EvalResult<RecordSchema> {
        context
            .program
            .records
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownRecord(name.to_string()))
    }

    pub(super) async fn eval_save(
        &self,
        record: &str,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let schema = Self::schema(context, record)?;
        let key = schema.local_name();
        let values = match context.state().get(&key) {
            Some(Value::Map(values)) => values.clone(),
            Some(other) => {
                return Err(EvalError::Validation {
                    record: schema.name.clone(),
                    message: format!("state.{} must be a map, got {}", key, other.type_name()),
                });
            }
            None => {
                return Err(EvalError::UnknownStatePath {
                    path: key,
                    fault: "nothing to save".to_string(),
                });
            }
        };
        let saved = self
            .insert_record(&schema, values, RecordAction::Save, context)
            .await?;
        let saved = Value::Map(saved);
        context.last_value = saved.clone();
        Ok(StatementResult::Value(saved))
    }

    pub(super) async fn eval_create(
        &self,
        record: &str,
        values: &Expression,
        target: &str,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let schema = Self::schema(context, record)?;
        let values = match self.eval_value(values, context).await? {
            Value::Map(values) => values,
            other => return Err(EvalError::type_mismatch("create values", "map", &other)),
        };
        let created = self
            .insert_record(&schema, values, RecordAction::Create, context)
            .await?;
        self.bind_result(target, Value::Map(created), context)
    }

    pub(super) async fn eval_find(
        &self,
        record: &str,
        predicate: &Expression,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let schema = Self::schema(context, record)?;
        let rows = self.matching_records(&schema, predicate, context).await?;
        context.record_step_with(
            "record_find",
            format!("found {} {} records", rows.len(), schema.name),
            None,
            Value::from(rows.len()),
        );
        let results = Value::List(rows.into_iter().map(Value::Map).collect());
        self.bind_result(&format!("{}_results", schema.local_name()), results, context)
    }

    pub(super) async fn eval_update(
        &self,
        record: &str,
        predicate: &Expression,
        updates: &[(String, Expression)],
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let schema = Self::schema(context, record)?;
        let updated = self
            .update_records(&schema, predicate, updates, context)
            .await?;
        let count = Value::from(updated.len());
        context.last_value = count.clone();
        Ok(StatementResult::Value(count))
    }

    pub(super) async fn eval_delete(
        &self,
        record: &str,
        predicate: &Expression,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let schema = Self::schema(context, record)?;
        let deleted = self.delete_records(&schema, predicate, context).await?;
        let count = Value::from(deleted);
        context.last_value = count.clone();
        Ok(StatementResult::Value(count))
    }

    /// Validate and store a new record.
    pub(crate) async fn insert_record(
        &self,
        schema: &RecordSchema,
        values: Record,
        action: RecordAction,
        context: &mut ExecutionContext,
    ) -> EvalResult<Record> {
        self.prepare_mutation(schema, action, context).await?;
        validate(schema, &values)?;
        let scope = Scope::for_schema(schema, context.identity());
        let store = context.services.store.clone();
        let saved = store
            .save(schema, values, &scope)
            .await
            .map_err(|err| EvalError::store(action.as_str(), err))?;

        context.push_record_change(RecordChange {
            action,
            record: schema.name.clone(),
            id: saved.get(RECORD_ID_FIELD).cloned().unwrap_or_default(),
            values: saved.clone(),
        });
        Self::trace_write(action, schema, 1, context);
        Ok(saved)
    }

    /// Rows of `schema` in scope for which `predicate` holds.
    pub(crate) async fn matching_records(
        &self,
        schema: &RecordSchema,
        predicate: &Expression,
        context: &mut ExecutionContext,
    ) -> EvalResult<Vec<Record>> {
        let scope = Scope::for_schema(schema, context.identity());
        let store = context.services.store.clone();
        let rows = store
            .find(schema, &scope)
            .await
            .map_err(|err| EvalError::store("find", err))?;

        let mut matching = Vec::new();
        for row in rows {
            let keep = self.eval_with_row(schema, &row, predicate, context).await?;
            match keep.as_bool() {
                Some(true) => matching.push(row),
                Some(false) => {}
                None => {
                    return Err(EvalError::type_mismatch(
                        format!("{} predicate", schema.name),
                        "boolean",
                        &keep,
                    ));
                }
            }
        }
        Ok(matching)
    }

    pub(crate) async fn update_records(
        &self,
        schema: &RecordSchema,
        predicate: &Expression,
        updates: &[(String, Expression)],
        context: &mut ExecutionContext,
    ) -> EvalResult<Vec<Record>> {
        self.prepare_mutation(schema, RecordAction::Update, context)
            .await?;
        let rows = self.matching_records(schema, predicate, context).await?;
        let scope = Scope::for_schema(schema, context.identity());
        let store = context.services.store.clone();

        let mut updated = Vec::with_capacity(rows.len());
        for row in rows {
            let mut changes = Record::new();
            for (field, expr) in updates {
                let value = self.eval_with_row(schema, &row, expr, context).await?;
                changes.insert(field.clone(), value);
            }
            let mut merged = row.clone();
            merged.extend(changes.clone());
            validate(schema, &merged)?;

            let id = row.get(RECORD_ID_FIELD).cloned().unwrap_or_default();
            let stored = store
                .update(schema, &id, &changes, &scope)
                .await
                .map_err(|err| EvalError::store("update", err))?;
            context.push_record_change(RecordChange {
                action: RecordAction::Update,
                record: schema.name.clone(),
                id,
                values: changes,
            });
            updated.push(stored);
        }
        Self::trace_write(RecordAction::Update, schema, updated.len(), context);
        Ok(updated)
    }

    pub(crate) async fn delete_records(
        &self,
        schema: &RecordSchema,
        predicate: &Expression,
        context: &mut ExecutionContext,
    ) -> EvalResult<usize> {
        self.prepare_mutation(schema, RecordAction::Delete, context)
            .await?;
        let rows = self.matching_records(schema, predicate, context).await?;
        let scope = Scope::for_schema(schema, context.identity());
        let store = context.services.store.clone();

        for row in &rows {
            let id = row.get(RECORD_ID_FIELD).cloned().unwrap_or_default();
            store
                .delete(schema, &id, &scope)
                .await
                .map_err(|err| EvalError::store("delete", err))?;
            context.push_record_change(RecordChange {
                action: RecordAction::Delete,
                record: schema.name.clone(),
                id,
                values: Record::new(),
            });
        }
        Self::trace_write(RecordAction::Delete, schema, rows.len(), context);
        Ok(rows.len())
    }

    async fn prepare_mutation(
        &self,
        schema: &RecordSchema,
        action: RecordAction,
        context: &mut ExecutionContext,
    ) -> EvalResult<()> {
        match context.mode() {
            ExecutionMode::Parallel => return Err(EvalError::ParallelMutation("records")),
            ExecutionMode::Function => {
                return Err(EvalError::NotSupported(
                    "Writing records inside a function".to_string(),
                ));
            }
            ExecutionMode::Flow => {}
        }
        self.guard
            .enforce_mutation(context, action, &schema.name)
            .await
    }

    /// Evaluate `expr` with the row's fields, and the row itself under the
    /// record's local name, in scope. Existing locals win over row fields,
    /// so a field named `input` cannot hide the run input.
    async fn eval_with_row(
        &self,
        schema: &RecordSchema,
        row: &Record,
        expr: &Expression,
        context: &mut ExecutionContext,
    ) -> EvalResult<Value> {
        let mut scoped = context.locals().clone();
        for (field, value) in row {
            scoped
                .entry(field.clone())
                .or_insert_with(|| value.clone());
        }
        scoped.insert(schema.local_name(), Value::Map(row.clone()));
        let saved = context.swap_locals(scoped);
        let result = self.eval_value(expr, context).await;
        context.swap_locals(saved);
        result
    }

    fn trace_write(
        action: RecordAction,
        schema: &RecordSchema,
        count: usize,
        context: &mut ExecutionContext,
    ) {
        context.trace(TraceEvent::RecordWrite {
            action,
            record: schema.name.clone(),
            count,
        });
        context.record_step(
            "record_write",
            format!("{} {} {} record(s)", action.as_str(), count, schema.name),
        );
    }
}

/// Check a record against its schema.
pub(crate) fn validate(schema: &RecordSchema, record: &Record) -> EvalResult<()> {
    let invalid = |message: String| EvalError::Validation {
        record: schema.name.clone(),
        message,
    };
    if let Some(unknown) = record
        .keys()
        .find(|key| key.as_str() != RECORD_ID_FIELD && schema.field(key).is_none())
    {
        return Err(invalid(format!("unknown field '{}'", unknown)));
    }
    for field in &schema.fields {
        match record.get(&field.name) {
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
