use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

use super::retrieval::search;
use super::{PipelineKind, PipelineValues, ScoredChunk, StepLog};
use crate::audit::sha256_hex;
use crate::eval::context::ExecutionContext;
use crate::eval::evaluator::EvalResult;
use crate::eval::value::Value;
use crate::provider::{AiRequest, AiResponse};
use crate::trace::{AiTrace, TraceEvent};

const DEFAULT_MODEL: &str = "default";

const ANSWER_SYSTEM_PROMPT: &str = "You are a precise assistant.\n\
Answer using only the provided sources.\n\
Cite every sentence with [chunk_id] using the exact chunk_id value.\n\
If a sentence uses multiple sources, cite them together like [id1, id2].\n\
Do not cite sources that are not provided.";

lazy_static! {
    static ref CITATION: Regex = Regex::new(r"\[([^\[\]]+)\]").expect("citation pattern");
}

fn build_prompt(query: &str, sources: &[ScoredChunk]) -> String {
    let mut lines = vec!["question:".to_string(), query.to_string(), String::new()];
    lines.push("sources:".to_string());
    for (position, source) in sources.iter().enumerate() {
        lines.push(format!("source {}:", position + 1));
        lines.push(format!("chunk_id: {}", source.chunk.chunk_id()));
        lines.push(format!("upload_id: {}", source.chunk.upload_id));
        lines.push("text:".to_string());
        lines.push(source.chunk.text.trim().to_string());
        lines.push(String::new());
    }
    lines.push("answer:".to_string());
    lines.join("\n")
}

/// Citation ids in first-seen order, without duplicates.
fn parse_citations(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    CITATION
        .captures_iter(text)
        .flat_map(|captures| {
            captures[1]
                .split(',')
                .map(|token| token.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|token| !token.is_empty() && seen.insert(token.clone()))
        .collect()
}

pub(super) async fn run(
    log: &mut StepLog,
    args: &PipelineValues,
    context: &mut ExecutionContext,
) -> EvalResult<PipelineValues> {
    let sources = search(log, PipelineKind::Answer, args, context).await?;
    if sources.is_empty() {
        return Err(log.fail("prompt", "no sources were retrieved for answering"));
    }
    let query = args.get("query").and_then(Value::as_text).unwrap_or_default().trim();
    let model = args
        .get("model")
        .and_then(Value::as_text)
        .unwrap_or(DEFAULT_MODEL)
        .to_string();
    let prompt = build_prompt(query, &sources);
    log.ok("prompt", &Value::from(sha256_hex(prompt.as_bytes())));

    context.reserve_agent_calls(1)?;
    let provider = context.services.ai.clone();
    let response = provider
        .ask(AiRequest {
            model: model.clone(),
            system_prompt: ANSWER_SYSTEM_PROMPT.to_string(),
            user_input: prompt.clone(),
            tools: Vec::new(),
            memory: Value::Null,
            tool_results: Vec::new(),
        })
        .await;
    let output = match response {
        Ok(AiResponse::Output(output)) => output,
        Ok(AiResponse::ToolCall { name, .. }) => {
            return Err(log.fail("generate", format!("unexpected tool request '{}'", name)));
        }
        Err(err) => return Err(log.fail("generate", err.to_string())),
    };
    let answer_text = output.trim().to_string();
    log.ok("generate", &Value::from(answer_text.as_str()));
    context.trace(TraceEvent::AiCall(AiTrace {
        ai_name: "answer_pipeline".to_string(),
        agent_name: None,
        model,
        system_prompt: ANSWER_SYSTEM_PROMPT.to_string(),
        input: prompt,
        output: output.clone(),
        memory: Value::Null,
        tool_calls: Vec::new(),
        tool_results: Vec::new(),
    }));

    let citations = parse_citations(&answer_text);
    if citations.is_empty() {
        return Err(log.fail("citations", "the answer cites no sources"));
    }
    let allowed: HashSet<String> = sources.iter().map(|s| s.chunk.chunk_id()).collect();
    let mut unknown: Vec<&String> = citations.iter().filter(|c| !allowed.contains(*c)).collect();
    if !unknown.is_empty() {
        unknown.sort();
        let listed = unknown
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(log.fail("citations", format!("unknown citations: {}", listed)));
    }
    let citation_values = Value::List(citations.iter().map(|c| Value::from(c.as_str())).collect());
    log.ok("citations", &citation_values);

    let ratio = (citations.len() as f64 / sources.len() as f64).min(1.0);
    let confidence = (ratio * 1000.0).round() / 1000.0;
    Ok(PipelineValues::from([
        ("answer_text".to_string(), Value::from(answer_text)),
        ("citations".to_string(), citation_values),
        ("confidence".to_string(), Value::Number(confidence)),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_citations_dedupes_in_order() {
        assert_eq!(
            parse_citations("One [a:0]. Two [b:1, a:0]. Three [ , c:2]."),
            vec!["a:0".to_string(), "b:1".to_string(), "c:2".to_string()]
        );
        assert!(parse_citations("no sources here").is_empty());
    }
}
