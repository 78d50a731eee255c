use super::{PipelineKind, PipelineValues, StepLog, positive_count};
use crate::audit::sha256_hex;
use crate::eval::context::{ExecutionContext, ExecutionMode};
use crate::eval::evaluator::{EvalError, EvalResult};
use crate::eval::value::Value;
use crate::pipeline::{DocumentChunk, DocumentIndex};

const DEFAULT_CHUNK_WORDS: usize = 50;

pub(super) async fn run(
    log: &mut StepLog,
    args: &PipelineValues,
    context: &mut ExecutionContext,
) -> EvalResult<PipelineValues> {
    let upload_id = args
        .get("upload_id")
        .and_then(Value::as_text)
        .unwrap_or_default()
        .trim()
        .to_string();
    let content = args.get("content").and_then(Value::as_text).unwrap_or_default();
    let chunk_words = positive_count(PipelineKind::Ingestion, args, "chunk_size", DEFAULT_CHUNK_WORDS)?;
    if context.mode() == ExecutionMode::Parallel {
        return Err(EvalError::ParallelMutation("state"));
    }

    if upload_id.is_empty() {
        return Err(log.fail("normalize", "upload_id is empty"));
    }
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.is_empty() {
        return Err(log.fail("normalize", format!("upload '{}' has no text", upload_id)));
    }
    let normalized = words.join(" ");
    log.ok("normalize", &Value::from(normalized.as_str()));

    let chunks: Vec<DocumentChunk> = words
        .chunks(chunk_words)
        .enumerate()
        .map(|(index, slice)| {
            let text = slice.join(" ");
            DocumentChunk {
                upload_id: upload_id.clone(),
                index,
                checksum: sha256_hex(text.as_bytes()),
                text,
            }
        })
        .collect();
    log.ok(
        "chunk",
        &Value::List(
            chunks
                .iter()
                .map(|chunk| Value::from(chunk.checksum.as_str()))
                .collect(),
        ),
    );

    let chunk_count = chunks.len();
    let mut index = match DocumentIndex::from_state(context.state()) {
        Ok(index) => index,
        Err(err) => return Err(log.fail("index", err.to_string())),
    };
    index.put(&upload_id, chunks);
    let report = Value::map([
        ("upload_id", Value::from(upload_id.as_str())),
        ("chunks", Value::from(chunk_count)),
        ("words", Value::from(words.len())),
        ("checksum", Value::from(sha256_hex(normalized.as_bytes()))),
    ]);
    index.write_to(context.state_mut(), &upload_id, report.clone());
    log.ok("index", &report);

    Ok(PipelineValues::from([
        ("report".to_string(), report),
        ("chunk_count".to_string(), Value::from(chunk_count)),
    ]))
}
