use std::collections::HashMap;
use std::sync::Arc;

use flowrun::ast::{AssignTarget, Expression, Flow, Program, StatementKind};
use flowrun::config::{EngineConfig, SecretConfig};
use flowrun::runtime::{EXECUTION_STEPS_FILE, RUN_OUTCOME_FILE};
use flowrun::store::InMemoryStore;
use flowrun::{FlowRunner, RunOutcome, RunRequest, RunStatus, Services, State, Value};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

use super::stmt;

fn bump_flow() -> Flow {
    Flow::new(
        "bump",
        vec![stmt(StatementKind::Set {
            target: AssignTarget::State(vec!["counter".to_string()]),
            value: Expression::literal(1_i64),
        })],
    )
}

#[tokio::test]
async fn test_successful_run_writes_outcome_and_steps() {
    let dir = tempdir().unwrap();
    let config = EngineConfig::default().with_project_root(dir.path());
    let artifacts = config.artifacts_path().unwrap();
    let store = InMemoryStore::new().with_state(State::from([(
        "counter".to_string(),
        Value::from(0_i64),
    )]));
    let runner = FlowRunner::new(Services::in_memory().with_store(Arc::new(store)), config);

    let result = runner
        .run_flow(RunRequest::new(bump_flow(), Program::new()))
        .await
        .unwrap();

    let written: RunOutcome =
        serde_json::from_slice(&std::fs::read(artifacts.join(RUN_OUTCOME_FILE)).unwrap())
            .unwrap();
    assert_eq!(written, result.outcome);
    assert_eq!(written.status, RunStatus::Ok);
    assert!(written.state_loaded_from_store);
    assert!(written.store_committed);
    assert!(!written.error_escaped);

    let steps: serde_json::Value =
        serde_json::from_slice(&std::fs::read(artifacts.join(EXECUTION_STEPS_FILE)).unwrap())
            .unwrap();
    assert_eq!(
        steps.as_array().map(|s| s.len()),
        Some(result.execution_steps.len())
    );
}

#[tokio::test]
async fn test_failed_run_still_writes_outcome() {
    let dir = tempdir().unwrap();
    let config = EngineConfig::default().with_project_root(dir.path());
    let artifacts = config.artifacts_path().unwrap();
    let runner = FlowRunner::new(Services::in_memory(), config);
    let flow = Flow::new(
        "broken",
        vec![stmt(StatementKind::Return(Expression::var("missing")))],
    );

    let err = runner
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap_err();

    let written: RunOutcome =
        serde_json::from_slice(&std::fs::read(artifacts.join(RUN_OUTCOME_FILE)).unwrap())
            .unwrap();
    assert_eq!(written.status, RunStatus::Failed);
    assert!(written.error_escaped);
    assert!(written.store_rolled_back);
    assert_eq!(written.run_id, err.outcome.run_id);
}

#[tokio::test]
async fn test_without_project_root_nothing_is_written() {
    let dir = tempdir().unwrap();
    let runner = FlowRunner::new(Services::in_memory(), EngineConfig::default());
    runner
        .run_flow(RunRequest::new(bump_flow(), Program::new()))
        .await
        .unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_error_messages_hide_secret_values() {
    let secret = "tok_9f8e7d6c5b";
    let config = EngineConfig::default().with_secrets(SecretConfig {
        values: HashMap::from([("billing".to_string(), secret.to_string())]),
    });
    let runner = FlowRunner::new(Services::in_memory(), config);
    let flow = Flow::new(
        "leaky",
        vec![stmt(StatementKind::Return(Expression::var(secret)))],
    );

    let err = runner
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_variable");
    assert!(!err.pack.message.contains(secret));
    assert!(err.error_id().starts_with("err-"));

    let result = runner
        .run_flow(
            RunRequest::new(
                Flow::new("ok", vec![stmt(StatementKind::Return(Expression::literal(1_i64)))]),
                Program::new(),
            )
            .with_state(State::new()),
        )
        .await
        .unwrap();
    assert_eq!(result.last_value, Value::from(1_i64));
}
