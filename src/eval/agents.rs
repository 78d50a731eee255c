//! AI and agent statements, and the provider tool loop they share.

use futures::future::join_all;
use tracing::debug;

use super::context::{ExecutionContext, ExecutionMode};
use super::evaluator::{EvalError, EvalResult};
use super::parallel::{MergeShape, merge_outcomes};
use super::statement::{StatementEvaluator, StatementResult};
use super::value::Value;
use crate::ast::{AgentEntry, AiDecl, Expression, MergePolicy};
use crate::provider::{AiRequest, AiResponse, ProviderError};
use crate::trace::{AiTrace, StepStatus, TraceEvent};

/// Map a tool registry failure onto the evaluation error the caller sees.
pub(crate) fn tool_error(err: ProviderError) -> EvalError {
    match err {
        ProviderError::UnknownTool(name) => EvalError::UnknownDeclaration { kind: "tool", name },
        ProviderError::ToolFailed { name, message } => {
            EvalError::Application(format!("Tool '{}' failed: {}", name, message))
        }
        other => EvalError::Provider(other),
    }
}

pub(crate) fn ai_profile(context: &ExecutionContext, name: &str) -> EvalResult<AiDecl> {
    context
        .program
        .ais
        .get(name)
        .cloned()
        .ok_or_else(|| EvalError::UnknownDeclaration {
            kind: "ai",
            name: name.to_string(),
        })
}

/// One AI exchange: recall memory, drive the tool loop until the provider
/// answers, record the interaction.
///
/// The caller has already counted the call against the agent cap.
pub(crate) async fn converse(
    context: &mut ExecutionContext,
    profile: &AiDecl,
    agent_name: Option<&str>,
    system_prompt: &str,
    input: &str,
) -> EvalResult<AiTrace> {
    let memory_manager = context.services.memory.clone();
    let provider = context.services.ai.clone();
    let tools = context.services.tools.clone();
    let max_tool_calls = context.config.limits.max_tool_calls;

    let memory = memory_manager
        .recall_context(profile, input, context.state())
        .await?;

    let mut tool_calls = Vec::new();
    let mut tool_results = Vec::new();
    loop {
        let request = AiRequest {
            model: profile.model.clone(),
            system_prompt: system_prompt.to_string(),
            user_input: input.to_string(),
            tools: profile.exposed_tools.clone(),
            memory: memory.clone(),
            tool_results: tool_results.clone(),
        };
        match provider.ask(request).await? {
            AiResponse::Output(output) => {
                let mut tool_events = tool_calls.clone();
                tool_events.extend(tool_results.iter().cloned());
                memory_manager
                    .record_interaction(profile, context.state(), input, &output, &tool_events)
                    .await?;
                context.flush_pending_tool_traces();
                return Ok(AiTrace {
                    ai_name: profile.name.clone(),
                    agent_name: agent_name.map(str::to_string),
                    model: profile.model.clone(),
                    system_prompt: system_prompt.to_string(),
                    input: input.to_string(),
                    output,
                    memory,
                    tool_calls,
                    tool_results,
                });
            }
            AiResponse::ToolCall { name, args } => {
                if tool_calls.len() >= max_tool_calls {
                    return Err(EvalError::Application(format!(
                        "AI '{}' exceeded {} tool calls",
                        profile.name, max_tool_calls
                    )));
                }
                if !profile.exposed_tools.contains(&name) {
                    return Err(EvalError::Application(format!(
                        "AI '{}' requested tool '{}' which it does not expose",
                        profile.name, name
                    )));
                }
                if !matches!(args, Value::Map(_)) {
                    return Err(EvalError::type_mismatch(
                        format!("arguments of tool '{}'", name),
                        "map",
                        &args,
                    ));
                }
                debug!(ai = %profile.name, tool = %name, "ai tool call");
                let result = tools.execute_tool(&name, &args).await.map_err(tool_error)?;
                context.push_pending_tool_trace(TraceEvent::ToolCall {
                    name: name.clone(),
                    args: args.clone(),
                    result: Some(result.clone()),
                });
                tool_calls.push(Value::map([
                    ("name", Value::from(name.as_str())),
                    ("args", args),
                ]));
                tool_results.push(Value::map([
                    ("name", Value::from(name)),
                    ("result", result),
                ]));
            }
        }
    }
}

struct PreparedAgent {
    agent: String,
    profile: AiDecl,
    system_prompt: String,
    input: String,
}

impl StatementEvaluator {
    async fn eval_text_input(
        &self,
        input: &Expression,
        what: &str,
        context: &mut ExecutionContext,
    ) -> EvalResult<String> {
        match self.eval_value(input, context).await? {
            Value::Text(text) => Ok(text),
            other => Err(EvalError::type_mismatch(what, "text", &other)),
        }
    }

    async fn prepare_agent(
        &self,
        agent: &str,
        input: &Expression,
        context: &mut ExecutionContext,
    ) -> EvalResult<PreparedAgent> {
        let decl = context.program.agents.get(agent).cloned().ok_or_else(|| {
            EvalError::UnknownDeclaration {
                kind: "agent",
                name: agent.to_string(),
            }
        })?;
        let profile = ai_profile(context, &decl.ai)?;
        let input = self
            .eval_text_input(input, &format!("input of agent '{}'", agent), context)
            .await?;
        let system_prompt = decl
            .system_prompt
            .clone()
            .unwrap_or_else(|| profile.system_prompt.clone());
        Ok(PreparedAgent {
            agent: decl.name,
            profile,
            system_prompt,
            input,
        })
    }

    pub(super) async fn eval_ask_ai(
        &self,
        ai: &str,
        input: &Expression,
        target: &str,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let profile = ai_profile(context, ai)?;
        let input = self.eval_text_input(input, "ask ai input", context).await?;
        context.reserve_agent_calls(1)?;
        let trace = converse(context, &profile, None, &profile.system_prompt, &input).await?;
        let output = trace.output.clone();
        context.trace(TraceEvent::AiCall(trace));
        context.record_step("ai_call", format!("asked {}", profile.name));
        self.bind_result(target, Value::Text(output), context)
    }

    pub(super) async fn eval_run_agent(
        &self,
        agent: &str,
        input: &Expression,
        target: &str,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let prepared = self.prepare_agent(agent, input, context).await?;
        context.reserve_agent_calls(1)?;
        let trace = converse(
            context,
            &prepared.profile,
            Some(&prepared.agent),
            &prepared.system_prompt,
            &prepared.input,
        )
        .await?;
        let output = trace.output.clone();
        context.trace(TraceEvent::AiCall(trace));
        context.record_step("agent_call", format!("ran agent {}", prepared.agent));
        self.bind_result(target, Value::Text(output), context)
    }

    /// Run several agents concurrently. The whole batch is counted against
    /// the agent cap before any provider call.
    pub(super) async fn eval_run_agents_parallel(
        &self,
        entries: &[AgentEntry],
        target: &str,
        merge: MergePolicy,
        context: &mut ExecutionContext,
    ) -> EvalResult<StatementResult> {
        let limit = context.config.limits.max_parallel_agents;
        if entries.len() > limit {
            return Err(EvalError::ParallelLimitExceeded {
                requested: entries.len(),
                limit,
            });
        }
        let mut prepared = Vec::with_capacity(entries.len());
        for entry in entries {
            prepared.push(self.prepare_agent(&entry.agent, &entry.input, context).await?);
        }
        context.reserve_agent_calls(prepared.len())?;

        for (index, agent) in prepared.iter().enumerate() {
            context.trace(TraceEvent::AgentStepStart {
                agent: agent.agent.clone(),
                index,
            });
        }
        let forks: Vec<_> = prepared
            .iter()
            .map(|_| context.fork(ExecutionMode::Parallel))
            .collect();
        let runs = prepared.iter().zip(forks).map(|(agent, mut fork)| async move {
            let result = converse(
                &mut fork,
                &agent.profile,
                Some(&agent.agent),
                &agent.system_prompt,
                &agent.input,
            )
            .await;
            (result, fork)
        });
        let finished = join_all(runs).await;

        let mut traces = Vec::new();
        let mut outcomes = Vec::with_capacity(finished.len());
        for (index, (agent, (result, fork))) in prepared.iter().zip(finished).enumerate() {
            context.absorb(fork.into_diagnostics());
            let status = if result.is_ok() {
                StepStatus::Ok
            } else {
                StepStatus::Error
            };
            context.trace(TraceEvent::AgentStepEnd {
                agent: agent.agent.clone(),
                index,
                status,
            });
            let outcome = result.map(|trace| {
                let output = Value::Text(trace.output.clone());
                traces.push(trace);
                output
            });
            outcomes.push((agent.agent.clone(), outcome));
        }
        context.trace(TraceEvent::ParallelAgents {
            target: target.to_string(),
            agents: traces,
        });

        let merged = merge_outcomes(context, merge, outcomes, MergeShape::List)?;
        context.record_step_with(
            "parallel_agents",
            format!("ran {} agents in parallel", prepared.len()),
            Some(format!("merged with {}", merge)),
            Value::Null,
        );
        self.bind_result(target, merged, context)
    }
}
