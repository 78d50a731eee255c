//! Parallel and orchestration blocks.
//!
//! Branches run concurrently on forked contexts. Their outcomes are merged
//! in declaration order, never completion order, so results are
//! deterministic whatever the scheduling.

use futures::future::join_all;

use super::context::{ExecutionContext, ExecutionMode};
use super::evaluator::{EvalError, EvalResult};
use super::statement::{ControlFlow, StatementEvaluator, StatementResult};
use super::value::Value;
use crate::ast::{Branch, Expression, MergePolicy, Statement};
use crate::trace::{StepStatus, TraceEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeShape {
    /// Branch name to value.
    Map,
    /// Values in declaration order.
    List,
}

/// Combine branch outcomes according to `policy`, appending a merge trace.
pub(crate) fn merge_outcomes(
    context: &mut ExecutionContext,
    policy: MergePolicy,
    outcomes: Vec<(String, EvalResult<Value>)>,
    shape: MergeShape,
) -> EvalResult<Value> {
    let (succeeded, failed): (Vec<_>, Vec<_>) = outcomes.iter().partition(|(_, r)| r.is_ok());
    context.trace(TraceEvent::Merge {
        policy,
        succeeded: succeeded.iter().map(|(name, _)| name.clone()).collect(),
        failed: failed.iter().map(|(name, _)| name.clone()).collect(),
    });

    // Transactional and limit failures are never absorbed by a policy.
    let mut settled = Vec::with_capacity(outcomes.len());
    for (name, result) in outcomes {
        match result {
            Err(err) if !err.is_catchable() => return Err(err),
            result => settled.push((name, result)),
        }
    }
    let outcomes = settled;

    let collect = |values: Vec<(String, Value)>| match shape {
        MergeShape::Map => Value::Map(values.into_iter().collect()),
        MergeShape::List => Value::List(values.into_iter().map(|(_, v)| v).collect()),
    };

    match policy {
        MergePolicy::AllRequired => {
            let mut values = Vec::with_capacity(outcomes.len());
            for (name, result) in outcomes {
                values.push((name, result?));
            }
            Ok(collect(values))
        }
        MergePolicy::FirstSuccess => {
            let mut first_error = None;
            for (_, result) in outcomes {
                match result {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
            }
            Err(first_error
                .unwrap_or_else(|| EvalError::Application("Nothing to merge".to_string())))
        }
        MergePolicy::BestEffort => Ok(collect(
            outcomes
                .into_iter()
                .filter_map(|(name, result)| result.ok().map(|value| (name, value)))
                .collect(),
        )),
    }
}

impl StatementEvaluator {
    fn check_branch_limit(requested: usize, context: &ExecutionContext) -> EvalResult<()> {
        let limit = context.config.limits.max_parallel_branches;
        if requested > limit {
            return Err(EvalError::ParallelLimitExceeded { requested, limit });
        }
        Ok(())
    }

    /// Fold finished forks back into the parent in declaration order.
    fn collect_branches<T>(
        branches: &[Branch<T>],
        finished: Vec<(EvalResult<Value>, ExecutionContext)>,
        context: &mut ExecutionContext,
    ) -> Vec<(String, EvalResult<Value>)> {
        let mut outcomes = Vec::with_capacity(finished.len());
        for (index, (branch, (result, fork))) in branches.iter().zip(finished).enumerate() {
            context.absorb(fork.into_diagnostics());
            let (status, error) = match &result {
                Ok(_) => (StepStatus::Ok, None),
                Err(err) => (StepStatus::Error, Some(err.to_string())),
            };
            context.trace(TraceEvent::ParallelBranch {
                branch: branch.name.clone(),
                index,
                status,
                error,
            });
            outcomes.push((branch.name.clone(), result));
        }
        outcomes
    }

    pub(super) async fn eval_parallel(
        &self,
        branches: &[Branch<Vec<Statement>>],
        merge: MergePolicy,
        target: Option<&str>,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        Self::check_branch_limit(branches.len(), context)?;
        let forks: Vec<_> = branches
            .iter()
            .map(|_| context.fork(ExecutionMode::Parallel))
            .collect();
        let runs = branches.iter().zip(forks).map(|(branch, mut fork)| async move {
            let result = match self.eval_block(&branch.body, &mut fork).await {
                Ok(StatementResult::Control(ControlFlow::Return(value))) => Ok(value),
                Ok(StatementResult::Value(_)) => Ok(fork.last_value.clone()),
                Err(err) => Err(err),
            };
            (result, fork)
        });
        let finished = join_all(runs).await;

        let outcomes = Self::collect_branches(branches, finished, context);
        let merged = merge_outcomes(context, merge, outcomes, MergeShape::Map)?;
        context.record_step_with(
            "parallel",
            format!("ran {} branches", branches.len()),
            Some(format!("merged with {}", merge)),
            Value::Null,
        );
        match target {
            Some(target) => self.bind_result(target, merged, context),
            None => {
                context.last_value = merged.clone();
                Ok(StatementResult::Value(merged))
            }
        }
    }

    pub(super) async fn eval_orchestration(
        &self,
        branches: &[Branch<Expression>],
        merge: MergePolicy,
        target: &str,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        Self::check_branch_limit(branches.len(), context)?;
        let forks: Vec<_> = branches
            .iter()
            .map(|_| context.fork(ExecutionMode::Parallel))
            .collect();
        let runs = branches.iter().zip(forks).map(|(branch, mut fork)| async move {
            let result = self
                .expression_evaluator
                .eval_expression(&branch.body, &mut fork)
                .await;
            (result, fork)
        });
        let finished = join_all(runs).await;

        let outcomes = Self::collect_branches(branches, finished, context);
        let merged = merge_outcomes(context, merge, outcomes, MergeShape::Map)?;
        context.record_step_with(
            "orchestration",
            format!("ran {} tasks", branches.len()),
            Some(format!("merged with {}", merge)),
            Value::Null,
        );
        self.bind_result(target, merged, context)
    }
}
