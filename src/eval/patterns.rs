//! Single-call AI pattern flows: plain LLM call, translation, question
//! answering and step-by-step reasoning.

use super::context::ExecutionContext;
use super::evaluator::{EvalError, EvalResult};
use super::value::Value;
use crate::ast::{AiPatternSpec, PatternKind, TypeName};
use crate::provider::{AiRequest, AiResponse};
use crate::trace::{AiTrace, TraceEvent};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Debug, Default, Clone, Copy)]
pub struct PatternRunner;

impl PatternRunner {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, spec: &AiPatternSpec, context: &mut ExecutionContext) -> EvalResult<()> {
        let input = match context.local("input") {
            Some(Value::Text(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => serde_json::Value::from(other).to_string(),
        };
        let system_prompt = system_prompt(spec);

        context.reserve_agent_calls(1)?;
        let provider = context.services.ai.clone();
        let response = provider
            .ask(AiRequest {
                model: spec.model.clone(),
                system_prompt: system_prompt.clone(),
                user_input: input.clone(),
                tools: Vec::new(),
                memory: Value::Null,
                tool_results: Vec::new(),
            })
            .await?;
        let output = match response {
            AiResponse::Output(output) => output,
            AiResponse::ToolCall { name, .. } => {
                return Err(EvalError::Application(format!(
                    "AI pattern flows cannot call tools (requested '{}')",
                    name
                )));
            }
        };

        let answer = match spec.kind {
            PatternKind::Cot => final_line(&output),
            _ => output.trim().to_string(),
        };
        let value = coerce_output(spec, &answer)?;

        context.trace(TraceEvent::AiCall(AiTrace {
            ai_name: format!("{}_pattern", spec.kind),
            agent_name: None,
            model: spec.model.clone(),
            system_prompt,
            input,
            output,
            memory: Value::Null,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }));
        context.record_step_with(
            "ai_pattern",
            format!("ran {} pattern", spec.kind),
            None,
            value.clone(),
        );
        context.last_value = value;
        Ok(())
    }
}

fn system_prompt(spec: &AiPatternSpec) -> String {
    let base = spec.prompt.as_deref();
    match spec.kind {
        PatternKind::LlmCall => base.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string(),
        PatternKind::Translate => format!(
            "Translate the user text from {} to {}. Reply with the translation only.",
            spec.source_language.as_deref().unwrap_or("the detected language"),
            spec.target_language.as_deref().unwrap_or("English"),
        ),
        PatternKind::Qa => base
            .unwrap_or("Answer the question concisely and accurately.")
            .to_string(),
        PatternKind::Cot => format!(
            "{}\nThink step by step, then give the final answer alone on the last line.",
            base.unwrap_or(DEFAULT_SYSTEM_PROMPT)
        ),
    }
}

fn final_line(output: &str) -> String {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Convert the provider's text into the declared output type.
fn coerce_output(spec: &AiPatternSpec, answer: &str) -> EvalResult<Value> {
    let expected = spec.output_type.name();
    let mismatch = |found: &Value| EvalError::type_mismatch("AI pattern output", &expected, found);
    let value = match &spec.output_type {
        TypeName::Any | TypeName::Text => Value::from(answer),
        TypeName::Number => answer
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|_| mismatch(&Value::from(answer)))?,
        TypeName::Boolean => match answer.to_ascii_lowercase().as_str() {
            "true" | "yes" => Value::Boolean(true),
            "false" | "no" => Value::Boolean(false),
            _ => return Err(mismatch(&Value::from(answer))),
        },
        TypeName::Json | TypeName::List(_) => {
            let parsed: serde_json::Value =
                serde_json::from_str(answer).map_err(|_| mismatch(&Value::from(answer)))?;
            Value::from(parsed)
        }
    };
    if !spec.output_type.accepts(&value) {
        return Err(mismatch(&value));
    }
    if let Some(map) = value.as_map() {
        if let Some(missing) = spec
            .output_fields
            .iter()
            .find(|field| field.required && !map.contains_key(&field.name))
        {
            return Err(EvalError::Validation {
                record: "ai_output".to_string(),
                message: format!("missing required field '{}'", missing.name),
            });
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ast::{FieldSpec, Flow, FlowKind, Program};
    use crate::eval::context::test_support::context_with;
    use crate::eval::value::State;
    use crate::provider::ScriptedProvider;

    fn spec(kind: PatternKind, output_type: TypeName) -> AiPatternSpec {
        AiPatternSpec {
            kind,
            model: "test-model".to_string(),
            prompt: None,
            source_language: Some("French".to_string()),
            target_language: Some("English".to_string()),
            output_type,
            output_fields: Vec::new(),
        }
    }

    #[test]
    fn test_translate_prompt_names_languages() {
        let prompt = system_prompt(&spec(PatternKind::Translate, TypeName::Text));
        assert!(prompt.contains("French"));
        assert!(prompt.contains("English"));
    }

    #[test]
    fn test_coerce_json_checks_required_fields() {
        let mut spec = spec(PatternKind::Qa, TypeName::Json);
        spec.output_fields = vec![FieldSpec::required("answer", TypeName::Text)];
        assert!(coerce_output(&spec, r#"{"answer": "42"}"#).is_ok());
        assert!(matches!(
            coerce_output(&spec, r#"{"other": 1}"#),
            Err(EvalError::Validation { .. })
        ));
        assert!(matches!(
            coerce_output(&spec, "not json"),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_cot_keeps_final_line_and_counts_call() {
        let provider = Arc::new(ScriptedProvider::default().with_script(vec![AiResponse::Output(
            "first 2 + 2\nthen add 1\n5\n".to_string(),
        )]));
        let spec = spec(PatternKind::Cot, TypeName::Number);
        let flow = Flow::new("reason", vec![]).with_kind(FlowKind::AiPattern(spec.clone()));
        let mut context = context_with(flow, Program::new(), State::new());
        context.services = context.services.clone().with_ai(provider);

        PatternRunner::new().run(&spec, &mut context).await.unwrap();
        assert_eq!(context.last_value, Value::from(5_i64));
        assert_eq!(context.agent_calls(), 1);
    }
}
