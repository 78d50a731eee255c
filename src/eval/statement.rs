use async_recursion::async_recursion;
use tracing::{debug, error, info, warn};

use super::context::{CurrentStatement, ExecutionContext, ExecutionMode, LogEntry};
use super::evaluator::{EvalError, EvalResult};
use super::expression::ExpressionEvaluator;
use super::value::{Value, assign_state};
use crate::ast::{
    AssignTarget, Expression, LogLevel, MatchCase, MetricOperation, Statement, StatementKind,
};
use crate::guard::GuardEnforcer;
use crate::trace::TraceEvent;

/// Outcome of one statement.
#[derive(Debug, Clone)]
pub enum StatementResult {
    Value(Value),
    Control(ControlFlow),
}

#[derive(Debug, Clone)]
pub enum ControlFlow {
    /// Ends the flow (or the enclosing function) with a value.
    Return(Value),
}

/// Interpreter for statement bodies.
///
/// Record, agent and parallel statements are implemented in sibling modules
/// as further `impl StatementEvaluator` blocks.
#[derive(Default)]
pub struct StatementEvaluator {
    pub(super) expression_evaluator: ExpressionEvaluator,
    pub(super) guard: GuardEnforcer,
}

impl StatementEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run statements in order, stopping at the first control signal.
    #[async_recursion]
    pub async fn eval_block(
        &self,
        statements: &[Statement],
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let outer = context.current.clone();
        let mut last = Value::Null;
        for (index, statement) in statements.iter().enumerate() {
            context.current = Some(CurrentStatement {
                kind: statement.kind_name(),
                index: index + 1,
                span: statement.span,
            });
            match self.eval_statement(statement, context).await? {
                StatementResult::Value(value) => last = value,
                control => return Ok(control),
            }
        }
        context.current = outer;
        Ok(StatementResult::Value(last))
    }

    #[async_recursion]
    pub async fn eval_statement(
        &self,
        statement: &Statement,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        debug!(kind = statement.kind_name(), line = statement.span.line, "statement");
        match &statement.kind {
            StatementKind::Let {
                name,
                value,
                constant,
            } => self.eval_let(name, value, *constant, context).await,
            StatementKind::Set { target, value } => self.eval_set(target, value, context).await,
            StatementKind::If {
                condition,
                then_body,
                else_body,
            } => self.eval_if(condition, then_body, else_body, context).await,
            StatementKind::Match {
                subject,
                cases,
                otherwise,
            } => {
                self.eval_match(subject, cases, otherwise.as_deref(), context)
                    .await
            }
            StatementKind::TryCatch {
                try_body,
                catch_var,
                catch_body,
            } => {
                self.eval_try_catch(try_body, catch_var, catch_body, context)
                    .await
            }
            StatementKind::Repeat { count, body } => self.eval_repeat(count, body, context).await,
            StatementKind::RepeatWhile { condition, body } => {
                self.eval_repeat_while(condition, body, context).await
            }
            StatementKind::ForEach {
                binder,
                iterable,
                body,
            } => self.eval_for_each(binder, iterable, body, context).await,
            StatementKind::Return(expr) => {
                let value = self.eval_value(expr, context).await?;
                context.last_value = value.clone();
                context.record_step("statement_return", "returned a value");
                Ok(StatementResult::Control(ControlFlow::Return(value)))
            }
            StatementKind::Save { record } => self.eval_save(record, context).await,
            StatementKind::Create {
                record,
                values,
                target,
            } => self.eval_create(record, values, target, context).await,
            StatementKind::Find { record, predicate } => {
                self.eval_find(record, predicate, context).await
            }
            StatementKind::Update {
                record,
                predicate,
                updates,
            } => self.eval_update(record, predicate, updates, context).await,
            StatementKind::Delete { record, predicate } => {
                self.eval_delete(record, predicate, context).await
            }
            StatementKind::AskAi { ai, input, target } => {
                self.eval_ask_ai(ai, input, target, context).await
            }
            StatementKind::RunAgent {
                agent,
                input,
                target,
            } => self.eval_run_agent(agent, input, target, context).await,
            StatementKind::RunAgentsParallel {
                entries,
                target,
                merge,
            } => {
                self.eval_run_agents_parallel(entries, target, *merge, context)
                    .await
            }
            StatementKind::Parallel {
                branches,
                merge,
                target,
            } => {
                self.eval_parallel(branches, *merge, target.as_deref(), context)
                    .await
            }
            StatementKind::Orchestration {
                branches,
                merge,
                target,
            } => {
                self.eval_orchestration(branches, *merge, target, context)
                    .await
            }
            StatementKind::EnqueueJob { job, input, after } => {
                self.eval_enqueue_job(job, input.as_ref(), after.as_ref(), context)
                    .await
            }
            StatementKind::AdvanceTime { amount } => {
                let amount_value = self.eval_value(amount, context).await?;
                let amount = amount_value.as_count().ok_or_else(|| {
                    EvalError::type_mismatch("advance time", "non-negative integer", &amount_value)
                })?;
                let now = context.jobs.advance(amount);
                context.trace(TraceEvent::TimeAdvanced { amount, now });
                context.record_step("time_advanced", format!("clock advanced to {}", now));
                Ok(StatementResult::Value(Value::from(now as f64)))
            }
            StatementKind::Log {
                level,
                message,
                fields,
            } => self.eval_log(*level, message, fields.as_ref(), context).await,
            StatementKind::Metric { op, name, value } => {
                self.eval_metric(*op, name, value.as_ref(), context).await
            }
            StatementKind::Await { target, value } => {
                let timeout = context.config.await_timeout;
                let evaluated = tokio::time::timeout(
                    timeout,
                    self.expression_evaluator.eval_expression(value, context),
                )
                .await
                .map_err(|_| EvalError::Timeout(timeout))??;
                context.bind_local(target, evaluated.clone())?;
                context.last_value = evaluated.clone();
                context.record_step("await", format!("awaited {}", target));
                Ok(StatementResult::Value(evaluated))
            }
            StatementKind::Yield(expr) => {
                let value = self.eval_value(expr, context).await?;
                context.push_yield(value.clone());
                context.trace(TraceEvent::Yield {
                    value: value.clone(),
                });
                Ok(StatementResult::Value(value))
            }
            StatementKind::ThemeChange(expr) => self.eval_theme_change(expr, context).await,
            StatementKind::Unsupported(name) => Err(EvalError::NotSupported(format!(
                "Statement '{}'",
                name
            ))),
        }
    }

    pub(super) async fn eval_value(
        &self,
        expr: &Expression,
        context: &mut ExecutionContext,
    ) -> EvalResult<Value> {
        self.expression_evaluator.eval_expression(expr, context).await
    }

    pub(super) async fn eval_condition(
        &self,
        expr: &Expression,
        what: &str,
        context: &mut ExecutionContext,
    ) -> EvalResult<bool> {
        let value = self.eval_value(expr, context).await?;
        value
            .as_bool()
            .ok_or_else(|| EvalError::type_mismatch(what, "boolean", &value))
    }

    /// Bind a statement's result to a local name.
    pub(super) fn bind_result(
        &self,
        target: &str,
        value: Value,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        context.bind_local(target, value.clone())?;
        context.last_value = value.clone();
        Ok(StatementResult::Value(value))
    }

    async fn eval_let(
        &self,
        name: &str,
        value: &Expression,
        constant: bool,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let value = self.eval_value(value, context).await?;
        context.bind_local(name, value.clone())?;
        if constant {
            context.declare_constant(name);
        }
        context.last_value = value.clone();
        let keyword = if constant { "let constant" } else { "let" };
        context.record_step("statement_let", format!("{} {}", keyword, name));
        Ok(StatementResult::Value(value))
    }

    async fn eval_set(
        &self,
        target: &AssignTarget,
        value: &Expression,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let value = self.eval_value(value, context).await?;
        match target {
            AssignTarget::Local(name) => {
                if !context.has_local(name) {
                    return Err(EvalError::UndeclaredVariable(name.clone()));
                }
                context.bind_local(name, value.clone())?;
                context.record_step("statement_set", format!("set {}", name));
            }
            AssignTarget::State(path) => {
                match context.mode() {
                    ExecutionMode::Parallel => return Err(EvalError::ParallelMutation("state")),
                    ExecutionMode::Function => {
                        return Err(EvalError::NotSupported(
                            "Changing state inside a function".to_string(),
                        ));
                    }
                    ExecutionMode::Flow => {}
                }
                assign_state(context.state_mut(), path, value.clone()).map_err(|fault| {
                    EvalError::UnknownStatePath {
                        path: path.join("."),
                        fault: fault.to_string(),
                    }
                })?;
                context.record_step("statement_set", format!("set state.{}", path.join(".")));
            }
        }
        context.last_value = value.clone();
        Ok(StatementResult::Value(value))
    }

    async fn eval_if(
        &self,
        condition: &Expression,
        then_body: &[Statement],
        else_body: &[Statement],
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let taken = self.eval_condition(condition, "if condition", context).await?;
        let because = if taken {
            "condition was true"
        } else {
            "condition was false"
        };
        context.record_step_with(
            "decision_if",
            if taken { "took then branch" } else { "took else branch" },
            Some(because.to_string()),
            Value::Boolean(taken),
        );
        let body = if taken { then_body } else { else_body };
        self.eval_block(body, context).await
    }

    async fn eval_match(
        &self,
        subject: &Expression,
        cases: &[MatchCase],
        otherwise: Option<&[Statement]>,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let subject = self.eval_value(subject, context).await?;
        for (index, case) in cases.iter().enumerate() {
            let pattern = self.eval_value(&case.pattern, context).await?;
            if pattern == subject {
                context.record_step_with(
                    "decision_match",
                    format!("matched case {}", index + 1),
                    Some(format!("value equals {}", pattern)),
                    subject.clone(),
                );
                return self.eval_block(&case.body, context).await;
            }
        }
        match otherwise {
            Some(body) => {
                context.record_step_with(
                    "decision_match",
                    "took otherwise branch",
                    Some("no case matched".to_string()),
                    subject,
                );
                self.eval_block(body, context).await
            }
            None => {
                context.record_step_with(
                    "decision_match",
                    "no case matched",
                    None,
                    subject,
                );
                Ok(StatementResult::Value(Value::Null))
            }
        }
    }

    async fn eval_try_catch(
        &self,
        try_body: &[Statement],
        catch_var: &str,
        catch_body: &[Statement],
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let outer = context.current.clone();
        context.record_step("decision_try", "entered try");
        match self.eval_block(try_body, context).await {
            Ok(result) => {
                context.record_step("catch_skipped", "try completed without error");
                Ok(result)
            }
            Err(err) if err.is_catchable() => {
                context.current = outer;
                debug!(kind = err.kind(), "caught error");
                context.record_step_with(
                    "catch_taken",
                    format!("caught {}", err.kind()),
                    Some(err.to_string()),
                    Value::Null,
                );
                context.bind_local(catch_var, err.to_value())?;
                self.eval_block(catch_body, context).await
            }
            Err(err) => Err(err),
        }
    }

    fn loop_guard(iterations: usize, context: &ExecutionContext) -> EvalResult<()> {
        let limit = context.config.limits.max_loop_iterations;
        if iterations > limit {
            return Err(EvalError::LoopLimitExceeded(limit));
        }
        Ok(())
    }

    async fn eval_repeat(
        &self,
        count: &Expression,
        body: &[Statement],
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let count_value = self.eval_value(count, context).await?;
        let count = count_value.as_count().ok_or_else(|| {
            EvalError::type_mismatch("repeat count", "non-negative integer", &count_value)
        })? as usize;
        Self::loop_guard(count, context)?;
        context.record_step("loop_repeat", format!("repeat {} times", count));
        let mut last = Value::Null;
        for _ in 0..count {
            match self.eval_block(body, context).await? {
                StatementResult::Value(value) => last = value,
                control => return Ok(control),
            }
        }
        Ok(StatementResult::Value(last))
    }

    async fn eval_repeat_while(
        &self,
        condition: &Expression,
        body: &[Statement],
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let mut iterations = 0usize;
        let mut last = Value::Null;
        while self
            .eval_condition(condition, "repeat while condition", context)
            .await?
        {
            iterations += 1;
            Self::loop_guard(iterations, context)?;
            match self.eval_block(body, context).await? {
                StatementResult::Value(value) => last = value,
                control => return Ok(control),
            }
        }
        context.record_step("loop_while", format!("loop ran {} times", iterations));
        Ok(StatementResult::Value(last))
    }

    async fn eval_for_each(
        &self,
        binder: &str,
        iterable: &Expression,
        body: &[Statement],
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let items = match self.eval_value(iterable, context).await? {
            Value::List(items) => items,
            other => return Err(EvalError::type_mismatch("for each", "list", &other)),
        };
        Self::loop_guard(items.len(), context)?;
        context.record_step("loop_for_each", format!("for each over {} items", items.len()));
        let mut last = Value::Null;
        for item in items {
            context.bind_local(binder, item)?;
            match self.eval_block(body, context).await? {
                StatementResult::Value(value) => last = value,
                control => return Ok(control),
            }
        }
        Ok(StatementResult::Value(last))
    }

    async fn eval_enqueue_job(
        &self,
        job: &str,
        input: Option<&Expression>,
        after: Option<&Expression>,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        if !context.program.jobs.contains_key(job) {
            return Err(EvalError::UnknownDeclaration {
                kind: "job",
                name: job.to_string(),
            });
        }
        let input = match input {
            Some(expr) => self.eval_value(expr, context).await?,
            None => Value::Null,
        };
        let after = match after {
            Some(expr) => {
                let value = self.eval_value(expr, context).await?;
                value.as_count().ok_or_else(|| {
                    EvalError::type_mismatch("enqueue delay", "non-negative integer", &value)
                })?
            }
            None => 0,
        };
        let due_at = context.jobs.enqueue(job, input, after);
        context.trace(TraceEvent::JobEnqueued {
            job: job.to_string(),
            due_at,
        });
        context.record_step("job_enqueued", format!("enqueued job {}", job));
        Ok(StatementResult::Value(Value::Null))
    }

    async fn eval_log(
        &self,
        level: LogLevel,
        message: &Expression,
        fields: Option<&Expression>,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let message = self.eval_value(message, context).await?.to_string();
        let fields = match fields {
            Some(expr) => match self.eval_value(expr, context).await? {
                map @ Value::Map(_) => map,
                other => return Err(EvalError::type_mismatch("log fields", "map", &other)),
            },
            None => Value::Map(Default::default()),
        };
        let flow = context.flow.name.clone();
        match level {
            LogLevel::Debug => debug!(flow = %flow, %fields, "{}", message),
            LogLevel::Info => info!(flow = %flow, %fields, "{}", message),
            LogLevel::Warn => warn!(flow = %flow, %fields, "{}", message),
            LogLevel::Error => error!(flow = %flow, %fields, "{}", message),
        }
        context.push_log(LogEntry {
            level,
            message: message.clone(),
            fields: fields.clone(),
        });
        context.trace(TraceEvent::Log {
            level,
            message,
            fields,
        });
        Ok(StatementResult::Value(Value::Null))
    }

    async fn eval_metric(
        &self,
        op: MetricOperation,
        name: &str,
        value: Option<&Expression>,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let amount = match (op, value) {
            (MetricOperation::Increment, None) => 1.0,
            (_, Some(expr)) => {
                let value = self.eval_value(expr, context).await?;
                value
                    .as_number()
                    .ok_or_else(|| EvalError::type_mismatch("metric value", "number", &value))?
            }
            (_, None) => {
                return Err(EvalError::type_mismatch(
                    format!("metric {}", op),
                    "number",
                    &Value::Null,
                ));
            }
        };
        context.metrics_mut().apply(op, name, amount);
        context.trace(TraceEvent::Metric {
            op,
            name: name.to_string(),
            value: amount,
        });
        Ok(StatementResult::Value(Value::Number(amount)))
    }

    async fn eval_theme_change(
        &self,
        expr: &Expression,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        match context.mode() {
            ExecutionMode::Parallel => return Err(EvalError::ParallelMutation("theme")),
            ExecutionMode::Function => {
                return Err(EvalError::NotSupported(
                    "Changing theme inside a function".to_string(),
                ));
            }
            ExecutionMode::Flow => {}
        }
        let value = self.eval_value(expr, context).await?;
        let theme = value
            .as_text()
            .ok_or_else(|| EvalError::type_mismatch("theme", "text", &value))?
            .to_string();
        if !context.config.allowed_themes.contains(&theme) {
            return Err(EvalError::Application(format!(
                "Theme '{}' is not one of {}",
                theme,
                context.config.allowed_themes.join(", ")
            )));
        }
        context.set_runtime_theme(theme.clone());
        context.trace(TraceEvent::ThemeChange {
            value: theme.clone(),
        });
        context.record_step("theme_change", format!("theme set to {}", theme));
        Ok(StatementResult::Value(Value::Text(theme)))
    }
}
