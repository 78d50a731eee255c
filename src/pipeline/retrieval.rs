use super::{DocumentIndex, PipelineKind, PipelineValues, ScoredChunk, StepLog, positive_count};
use crate::eval::context::ExecutionContext;
use crate::eval::evaluator::EvalResult;
use crate::eval::value::Value;

pub(super) const DEFAULT_LIMIT: usize = 3;

/// Shared by the answer pipeline, which retrieves its sources the same way.
pub(super) async fn search(
    log: &mut StepLog,
    kind: PipelineKind,
    args: &PipelineValues,
    context: &ExecutionContext,
) -> EvalResult<Vec<ScoredChunk>> {
    let query = args.get("query").and_then(Value::as_text).unwrap_or_default().trim();
    let limit = positive_count(kind, args, "limit", DEFAULT_LIMIT)?;
    if query.is_empty() {
        return Err(log.fail("search", "query is empty"));
    }
    let hits = DocumentIndex::from_state(context.state())
        .map_err(|err| log.fail("search", err.to_string()))?
        .search(query, limit);
    log.ok(
        "search",
        &Value::List(hits.iter().map(|hit| Value::from(hit.chunk.chunk_id())).collect()),
    );
    Ok(hits)
}

pub(super) async fn run(
    log: &mut StepLog,
    args: &PipelineValues,
    context: &mut ExecutionContext,
) -> EvalResult<PipelineValues> {
    let hits = search(log, PipelineKind::Retrieval, args, context).await?;
    Ok(PipelineValues::from([(
        "results".to_string(),
        Value::List(hits.iter().map(ScoredChunk::to_value).collect()),
    )]))
}
