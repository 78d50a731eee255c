use std::collections::{BTreeMap, HashSet};

use async_recursion::async_recursion;
use tracing::debug;

use super::agents::tool_error;
use super::context::{ExecutionContext, ExecutionMode};
use super::evaluator::{EvalError, EvalResult};
use super::statement::{ControlFlow, StatementEvaluator, StatementResult};
use super::value::{Value, walk_state};
use crate::ast::{
    Argument, BinaryOperator, ComparisonOperator, Expression, ListOperation, MapOperation,
    TypeName, UnaryOperator,
};
use crate::pipeline::PipelineDispatcher;
use crate::trace::TraceEvent;

/// Evaluates expressions against a context.
///
/// Expressions never write state or locals. They may append diagnostics
/// (tool and pipeline traces, execution steps).
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    #[async_recursion]
    pub async fn eval_expression(
        &self,
        expr: &Expression,
        context: &mut ExecutionContext,
    ) -> EvalResult<Value> {
        match expr {
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Variable(name) => Self::eval_variable(name, context),
            Expression::Attribute { base, path } => Self::eval_attribute(base, path, context),
            Expression::StatePath(path) => walk_state(context.state(), path)
                .cloned()
                .map_err(|fault| EvalError::UnknownStatePath {
                    path: path.join("."),
                    fault: fault.to_string(),
                }),
            Expression::Unary { op, operand } => {
                let value = self.eval_expression(operand, context).await?;
                Self::eval_unary(*op, value)
            }
            Expression::Binary { op, left, right } => {
                self.eval_binary(*op, left, right, context).await
            }
            Expression::Comparison { op, left, right } => {
                let left = self.eval_expression(left, context).await?;
                let right = self.eval_expression(right, context).await?;
                Self::eval_comparison(*op, &left, &right)
            }
            Expression::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expression(item, context).await?);
                }
                Ok(Value::List(values))
            }
            Expression::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval_expression(value, context).await?);
                }
                Ok(Value::Map(map))
            }
            Expression::ListOp {
                op,
                target,
                argument,
            } => {
                self.eval_list_op(*op, target, argument.as_deref(), context)
                    .await
            }
            Expression::MapOp {
                op,
                target,
                key,
                value,
            } => {
                self.eval_map_op(*op, target, key.as_deref(), value.as_deref(), context)
                    .await
            }
            Expression::ListMap {
                target,
                binder,
                body,
            } => {
                let items = self.eval_list(target, "map", context).await?;
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    let previous = context.shadow_local(binder, item)?;
                    let result = self.eval_expression(body, context).await;
                    context.restore_local(binder, previous);
                    mapped.push(result?);
                }
                Ok(Value::List(mapped))
            }
            Expression::ListFilter {
                target,
                binder,
                predicate,
            } => {
                let items = self.eval_list(target, "filter", context).await?;
                let mut kept = Vec::new();
                for item in items {
                    let previous = context.shadow_local(binder, item.clone())?;
                    let result = self.eval_expression(predicate, context).await;
                    context.restore_local(binder, previous);
                    let keep = result?;
                    match keep.as_bool() {
                        Some(true) => kept.push(item),
                        Some(false) => {}
                        None => return Err(EvalError::type_mismatch("filter", "boolean", &keep)),
                    }
                }
                Ok(Value::List(kept))
            }
            Expression::ListReduce {
                target,
                accumulator,
                binder,
                start,
                body,
            } => {
                let items = self.eval_list(target, "reduce", context).await?;
                let mut acc = self.eval_expression(start, context).await?;
                for item in items {
                    let previous_acc = context.shadow_local(accumulator, acc)?;
                    let previous_item = context.shadow_local(binder, item)?;
                    let result = self.eval_expression(body, context).await;
                    context.restore_local(binder, previous_item);
                    context.restore_local(accumulator, previous_acc);
                    acc = result?;
                }
                Ok(acc)
            }
            Expression::ToolCall {
                name,
                arguments,
                returns,
            } => {
                self.eval_tool_call(name, arguments, returns.as_ref(), context)
                    .await
            }
            Expression::FunctionCall { name, arguments } => {
                self.eval_function_call(name, arguments, context).await
            }
            Expression::PipelineCall {
                pipeline,
                arguments,
                outputs,
            } => {
                self.eval_pipeline_call(pipeline, arguments, outputs, context)
                    .await
            }
        }
    }

    fn eval_variable(name: &str, context: &ExecutionContext) -> EvalResult<Value> {
        if let Some(value) = context.local(name) {
            return Ok(value.clone());
        }
        if name == "identity" {
            return Ok(context.identity().clone());
        }
        Err(EvalError::UnknownVariable(name.to_string()))
    }

    fn eval_attribute(base: &str, path: &[String], context: &ExecutionContext) -> EvalResult<Value> {
        let mut current = Self::eval_variable(base, context)?;
        let mut walked = base.to_string();
        for segment in path {
            let next = current
                .as_map()
                .and_then(|map| map.get(segment))
                .cloned()
                .ok_or_else(|| EvalError::MissingAttribute {
                    base: walked.clone(),
                    attribute: segment.clone(),
                })?;
            walked.push('.');
            walked.push_str(segment);
            current = next;
        }
        Ok(current)
    }

    fn eval_unary(op: UnaryOperator, value: Value) -> EvalResult<Value> {
        match op {
            UnaryOperator::Not => value
                .as_bool()
                .map(|b| Value::Boolean(!b))
                .ok_or_else(|| EvalError::type_mismatch("not", "boolean", &value)),
            UnaryOperator::Plus => value
                .as_number()
                .map(Value::Number)
                .ok_or_else(|| EvalError::type_mismatch("unary +", "number", &value)),
            UnaryOperator::Minus => value
                .as_number()
                .map(|n| Value::Number(-n))
                .ok_or_else(|| EvalError::type_mismatch("unary -", "number", &value)),
        }
    }

    async fn eval_binary(
        &self,
        op: BinaryOperator,
        left: &Expression,
        right: &Expression,
        context: &mut ExecutionContext,
    ) -> EvalResult<Value> {
        let left = self.eval_expression(left, context).await?;
        match op {
            BinaryOperator::And | BinaryOperator::Or => {
                let name = if op == BinaryOperator::And { "and" } else { "or" };
                let l = left
                    .as_bool()
                    .ok_or_else(|| EvalError::type_mismatch(name, "boolean", &left))?;
                // short-circuit
                if (op == BinaryOperator::And && !l) || (op == BinaryOperator::Or && l) {
                    return Ok(Value::Boolean(l));
                }
                let right = self.eval_expression(right, context).await?;
                right
                    .as_bool()
                    .map(Value::Boolean)
                    .ok_or_else(|| EvalError::type_mismatch(name, "boolean", &right))
            }
            _ => {
                let right = self.eval_expression(right, context).await?;
                Self::eval_arithmetic(op, left, right)
            }
        }
    }

    fn eval_arithmetic(op: BinaryOperator, left: Value, right: Value) -> EvalResult<Value> {
        if let (BinaryOperator::Add, Value::Text(l), Value::Text(r)) = (op, &left, &right) {
            return Ok(Value::Text(format!("{}{}", l, r)));
        }
        let symbol = match op {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::And | BinaryOperator::Or => {
                return Err(EvalError::Internal("logical operator in arithmetic".to_string()));
            }
        };
        let l = left
            .as_number()
            .ok_or_else(|| EvalError::type_mismatch(symbol, "number", &left))?;
        let r = right
            .as_number()
            .ok_or_else(|| EvalError::type_mismatch(symbol, "number", &right))?;
        let result = match op {
            BinaryOperator::Add => l + r,
            BinaryOperator::Subtract => l - r,
            BinaryOperator::Multiply => l * r,
            _ => {
                if r == 0.0 {
                    return Err(EvalError::DivisionByZero);
                }
                l / r
            }
        };
        Ok(Value::Number(result))
    }

    fn eval_comparison(op: ComparisonOperator, left: &Value, right: &Value) -> EvalResult<Value> {
        let result = match op {
            ComparisonOperator::Eq => left == right,
            ComparisonOperator::Ne => left != right,
            _ => {
                let context = op.to_string();
                let l = left
                    .as_number()
                    .ok_or_else(|| EvalError::type_mismatch(context.clone(), "number", left))?;
                let r = right
                    .as_number()
                    .ok_or_else(|| EvalError::type_mismatch(context, "number", right))?;
                match op {
                    ComparisonOperator::Gt => l > r,
                    ComparisonOperator::Lt => l < r,
                    ComparisonOperator::Gte => l >= r,
                    _ => l <= r,
                }
            }
        };
        Ok(Value::Boolean(result))
    }

    async fn eval_list(
        &self,
        target: &Expression,
        operation: &str,
        context: &mut ExecutionContext,
    ) -> EvalResult<Vec<Value>> {
        match self.eval_expression(target, context).await? {
            Value::List(items) => Ok(items),
            other => Err(EvalError::type_mismatch(operation, "list", &other)),
        }
    }

    async fn eval_list_op(
        &self,
        op: ListOperation,
        target: &Expression,
        argument: Option<&Expression>,
        context: &mut ExecutionContext,
    ) -> EvalResult<Value> {
        let mut items = self.eval_list(target, "list operation", context).await?;
        let argument = match argument {
            Some(expr) => Some(self.eval_expression(expr, context).await?),
            None => None,
        };
        match (op, argument) {
            (ListOperation::Length, _) => Ok(Value::from(items.len())),
            (ListOperation::Get, Some(index)) => {
                let position = index
                    .as_count()
                    .ok_or_else(|| EvalError::type_mismatch("list get", "index", &index))?;
                items.get(position as usize).cloned().ok_or_else(|| {
                    EvalError::Application(format!(
                        "List index {} is out of range (length {})",
                        position,
                        items.len()
                    ))
                })
            }
            (ListOperation::Append, Some(item)) => {
                items.push(item);
                Ok(Value::List(items))
            }
            (ListOperation::Contains, Some(item)) => Ok(Value::Boolean(items.contains(&item))),
            (_, None) => Err(EvalError::Internal(
                "list operation is missing its argument".to_string(),
            )),
        }
    }

    async fn eval_map_op(
        &self,
        op: MapOperation,
        target: &Expression,
        key: Option<&Expression>,
        value: Option<&Expression>,
        context: &mut ExecutionContext,
    ) -> EvalResult<Value> {
        let mut map = match self.eval_expression(target, context).await? {
            Value::Map(map) => map,
            other => return Err(EvalError::type_mismatch("map operation", "map", &other)),
        };
        if op == MapOperation::Keys {
            return Ok(Value::List(map.keys().map(|k| Value::from(k.as_str())).collect()));
        }

        let key = match key {
            Some(expr) => self.eval_expression(expr, context).await?,
            None => {
                return Err(EvalError::Internal(
                    "map operation is missing its key".to_string(),
                ));
            }
        };
        let key = match key {
            Value::Text(key) => key,
            other => return Err(EvalError::type_mismatch("map key", "text", &other)),
        };
        match op {
            MapOperation::Get => map.get(&key).cloned().ok_or(EvalError::MissingAttribute {
                base: "map".to_string(),
                attribute: key,
            }),
            MapOperation::Has => Ok(Value::Boolean(map.contains_key(&key))),
            MapOperation::Set => {
                let value = match value {
                    Some(expr) => self.eval_expression(expr, context).await?,
                    None => Value::Null,
                };
                map.insert(key, value);
                Ok(Value::Map(map))
            }
            MapOperation::Keys => Ok(Value::Null),
        }
    }

    /// Evaluate named arguments in declaration order, rejecting duplicates.
    pub(crate) async fn eval_arguments(
        &self,
        arguments: &[Argument],
        context: &mut ExecutionContext,
    ) -> EvalResult<BTreeMap<String, Value>> {
        let mut seen = HashSet::new();
        let mut values = BTreeMap::new();
        for argument in arguments {
            if !seen.insert(argument.name.as_str()) {
                return Err(EvalError::DuplicateArgument(argument.name.clone()));
            }
            let value = self.eval_expression(&argument.value, context).await?;
            values.insert(argument.name.clone(), value);
        }
        Ok(values)
    }

    async fn eval_tool_call(
        &self,
        name: &str,
        arguments: &[Argument],
        returns: Option<&TypeName>,
        context: &mut ExecutionContext,
    ) -> EvalResult<Value> {
        let args = Value::Map(self.eval_arguments(arguments, context).await?);
        debug!(tool = name, "calling tool");
        let tools = context.services.tools.clone();
        let result = tools
            .execute_tool(name, &args)
            .await
            .map_err(tool_error)?;

        if let Some(expected) = returns {
            if !expected.accepts(&result) {
                return Err(EvalError::type_mismatch(
                    format!("tool '{}' result", name),
                    &expected.name(),
                    &result,
                ));
            }
        }
        context.record_step_with(
            "tool_call",
            format!("called tool {}", name),
            None,
            result.clone(),
        );
        context.trace(TraceEvent::ToolCall {
            name: name.to_string(),
            args,
            result: Some(result.clone()),
        });
        Ok(result)
    }

    /// Run a function body on an isolated fork. Only its return value and
    /// diagnostics flow back to the caller.
    async fn eval_function_call(
        &self,
        name: &str,
        arguments: &[Argument],
        context: &mut ExecutionContext,
    ) -> EvalResult<Value> {
        let function = context.program.functions.get(name).cloned().ok_or_else(|| {
            EvalError::UnknownDeclaration {
                kind: "function",
                name: name.to_string(),
            }
        })?;
        let mut args = self.eval_arguments(arguments, context).await?;

        let mut params = BTreeMap::new();
        for param in &function.params {
            match args.remove(&param.name) {
                Some(value) if param.type_name.accepts(&value) => {
                    params.insert(param.name.clone(), value);
                }
                Some(value) => {
                    return Err(EvalError::type_mismatch(
                        format!("argument '{}' of function '{}'", param.name, name),
                        &param.type_name.name(),
                        &value,
                    ));
                }
                None if param.required => {
                    return Err(EvalError::Application(format!(
                        "Function '{}' is missing argument '{}'",
                        name, param.name
                    )));
                }
                None => {
                    params.insert(param.name.clone(), Value::Null);
                }
            }
        }
        if let Some(extra) = args.keys().next() {
            return Err(EvalError::Application(format!(
                "Function '{}' has no parameter '{}'",
                name, extra
            )));
        }

        let mut call = context.fork(ExecutionMode::Function);
        call.swap_locals(params);
        let outcome = StatementEvaluator::new()
            .eval_block(&function.body, &mut call)
            .await;
        let result = match outcome {
            Ok(StatementResult::Control(ControlFlow::Return(value))) => Ok(value),
            Ok(StatementResult::Value(_)) => Ok(call.last_value.clone()),
            Err(err) => Err(err),
        };
        context.absorb(call.into_diagnostics());
        let result = result?;

        if !function.returns.accepts(&result) {
            return Err(EvalError::type_mismatch(
                format!("return value of function '{}'", name),
                &function.returns.name(),
                &result,
            ));
        }
        context.record_step_with(
            "function_call",
            format!("called function {}", name),
            None,
            result.clone(),
        );
        Ok(result)
    }

    async fn eval_pipeline_call(
        &self,
        pipeline: &str,
        arguments: &[Argument],
        outputs: &[String],
        context: &mut ExecutionContext,
    ) -> EvalResult<Value> {
        let args = self.eval_arguments(arguments, context).await?;
        let mut produced = PipelineDispatcher::new()
            .dispatch(context, pipeline, args)
            .await?;
        match outputs {
            [] => Ok(Value::Map(produced)),
            [single] => produced.remove(single).ok_or_else(|| EvalError::Contract {
                pipeline: pipeline.to_string(),
                message: format!("no output named '{}'", single),
            }),
            many => {
                let mut selected = BTreeMap::new();
                for name in many {
                    let value = produced.remove(name).ok_or_else(|| EvalError::Contract {
                        pipeline: pipeline.to_string(),
                        message: format!("no output named '{}'", name),
                    })?;
                    selected.insert(name.clone(), value);
                }
                Ok(Value::Map(selected))
            }
        }
    }
}
