use std::sync::Arc;

use flowrun::ast::{Argument, BinaryOperator, Expression, Flow, Program, StatementKind};
use flowrun::config::EngineConfig;
use flowrun::provider::{AiResponse, ScriptedProvider};
use flowrun::{EvalError, FlowRunner, RunRequest, Services, State, Value};
use pretty_assertions::assert_eq;

use super::{count_traces, stmt};

fn pipeline(name: &str, arguments: Vec<Argument>, outputs: &[&str]) -> Expression {
    Expression::PipelineCall {
        pipeline: name.to_string(),
        arguments,
        outputs: outputs.iter().map(|o| o.to_string()).collect(),
    }
}

fn ingest_statement() -> StatementKind {
    StatementKind::Let {
        name: "indexed".to_string(),
        value: pipeline(
            "ingestion",
            vec![
                Argument::new("upload_id", Expression::literal("handbook")),
                Argument::new(
                    "content",
                    Expression::literal("Vacation requests need two weeks notice."),
                ),
            ],
            &["chunk_count"],
        ),
        constant: true,
    }
}

#[tokio::test]
async fn test_ingested_upload_is_retrievable() {
    let runner = FlowRunner::new(Services::in_memory(), EngineConfig::default());
    let flow = Flow::new(
        "docs",
        vec![
            stmt(ingest_statement()),
            stmt(StatementKind::Return(pipeline(
                "retrieval",
                vec![Argument::new("query", Expression::literal("vacation notice"))],
                &["results"],
            ))),
        ],
    )
    .capability("uploads");
    let result = runner
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap();

    let results = result.last_value.as_list().unwrap();
    assert_eq!(results.len(), 1);
    let top = results[0].as_map().unwrap();
    assert_eq!(top.get("chunk_id"), Some(&Value::from("handbook:0")));
    assert_eq!(count_traces(&result.traces, "pipeline_call_start"), 2);
    assert_eq!(count_traces(&result.traces, "pipeline_call_end"), 2);
    assert_eq!(count_traces(&result.traces, "pipeline_step"), 4);
}

#[tokio::test]
async fn test_answer_returns_cited_text() {
    let provider = Arc::new(ScriptedProvider::new().with_script([AiResponse::Output(
        "Give two weeks notice [handbook:0].".to_string(),
    )]));
    let runner = FlowRunner::new(
        Services::in_memory().with_ai(provider.clone()),
        EngineConfig::default(),
    );
    let flow = Flow::new(
        "ask_docs",
        vec![
            stmt(ingest_statement()),
            stmt(StatementKind::Return(pipeline(
                "answer",
                vec![Argument::new(
                    "query",
                    Expression::literal("How much notice for vacation?"),
                )],
                &[],
            ))),
        ],
    )
    .capability("uploads");
    let result = runner
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap();

    let answer = result.last_value.as_map().unwrap();
    assert_eq!(
        answer.get("citations"),
        Some(&Value::List(vec![Value::from("handbook:0")]))
    );
    assert_eq!(answer.get("confidence"), Some(&Value::Number(1.0)));
    assert_eq!(provider.call_count(), 1);
    assert!(provider.calls()[0].user_input.contains("chunk_id: handbook:0"));
}

#[tokio::test]
async fn test_missing_capability_is_forbidden() {
    let runner = FlowRunner::new(Services::in_memory(), EngineConfig::default());
    let flow = Flow::new("docs", vec![stmt(ingest_statement())]);
    let err = runner
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap_err();
    assert!(matches!(
        err.cause,
        EvalError::CapabilityMissing { ref capability, .. } if capability == "uploads"
    ));
    assert_eq!(err.http_status(), 403);
    assert_eq!(count_traces(&err.traces, "pipeline_call_start"), 0);
}

fn retrieve_vacation() -> Flow {
    Flow::new(
        "lookup",
        vec![stmt(StatementKind::Return(pipeline(
            "retrieval",
            vec![Argument::new("query", Expression::literal("vacation notice"))],
            &["results"],
        )))],
    )
    .capability("uploads")
}

#[tokio::test]
async fn test_failed_run_discards_its_ingested_chunks() {
    let runner = FlowRunner::new(Services::in_memory(), EngineConfig::default());
    let failing = Flow::new(
        "ingest_then_fail",
        vec![
            stmt(ingest_statement()),
            stmt(StatementKind::Return(Expression::binary(
                BinaryOperator::Divide,
                Expression::literal(1_i64),
                Expression::literal(0_i64),
            ))),
        ],
    )
    .capability("uploads");
    let err = runner
        .run_flow(RunRequest::new(failing, Program::new()))
        .await
        .unwrap_err();
    assert!(err.outcome.store_rolled_back);

    let result = runner
        .run_flow(RunRequest::new(retrieve_vacation(), Program::new()))
        .await
        .unwrap();
    assert_eq!(result.last_value, Value::List(vec![]));
    assert!(!result.state.contains_key("index"));
}

#[tokio::test]
async fn test_committed_chunks_are_visible_to_later_runs() {
    let runner = FlowRunner::new(Services::in_memory(), EngineConfig::default());
    let ingest = Flow::new("ingest", vec![stmt(ingest_statement())]).capability("uploads");
    let result = runner
        .run_flow(RunRequest::new(ingest, Program::new()))
        .await
        .unwrap();
    assert!(result.state["ingestion"].as_map().unwrap().contains_key("handbook"));

    let result = runner
        .run_flow(RunRequest::new(retrieve_vacation(), Program::new()))
        .await
        .unwrap();
    let results = result.last_value.as_list().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].as_map().unwrap().get("chunk_id"),
        Some(&Value::from("handbook:0"))
    );
}
