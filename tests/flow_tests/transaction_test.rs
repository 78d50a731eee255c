use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use flowrun::ast::{
    AiDecl, AssignTarget, Expression, FieldSpec, Flow, Program, RecordSchema, StatementKind,
    TypeName,
};
use flowrun::boundary::Boundary;
use flowrun::config::EngineConfig;
use flowrun::memory::{MemoryError, MemoryManager, MemoryResult};
use flowrun::store::{InMemoryStore, Store};
use flowrun::trace::TraceEvent;
use flowrun::{FlowRunner, RunRequest, RunStatus, Services, State, Value};
use pretty_assertions::assert_eq;

use super::{FailingStore, count_traces, stmt};

fn order_program() -> Program {
    Program::new().with_record(RecordSchema::new(
        "Order",
        vec![FieldSpec::required("item", TypeName::Text)],
    ))
}

fn create_order() -> flowrun::ast::Statement {
    stmt(StatementKind::Create {
        record: "Order".to_string(),
        values: Expression::literal(Value::map([("item", Value::from("book"))])),
        target: "order".to_string(),
    })
}

fn set_counter(value: i64) -> flowrun::ast::Statement {
    stmt(StatementKind::Set {
        target: AssignTarget::State(vec!["counter".to_string()]),
        value: Expression::literal(value),
    })
}

fn seeded_store() -> InMemoryStore {
    InMemoryStore::new().with_state(State::from([("counter".to_string(), Value::from(0_i64))]))
}

#[tokio::test]
async fn test_failed_write_in_loop_rolls_back_every_order() {
    let inner = seeded_store();
    let store = FailingStore::new(inner.clone()).fail_save_at(2);
    let runner = FlowRunner::new(
        Services::in_memory().with_store(Arc::new(store)),
        EngineConfig::default(),
    );
    let flow = Flow::new(
        "orders",
        vec![
            stmt(StatementKind::Let {
                name: "n".to_string(),
                value: Expression::literal(3_i64),
                constant: false,
            }),
            set_counter(5),
            stmt(StatementKind::Repeat {
                count: Expression::var("n"),
                body: vec![create_order()],
            }),
        ],
    );

    let err = runner
        .run_flow(RunRequest::new(flow, order_program()))
        .await
        .unwrap_err();

    assert_eq!(err.boundary(), Boundary::Store);
    assert_eq!(inner.count("Order"), 0);
    assert_eq!(count_traces(&err.traces, "record_write"), 1);
    assert_eq!(count_traces(&err.traces, "runtime_error"), 1);
    assert!(err.outcome.state_loaded_from_store);
    assert!(!err.outcome.store_committed);
    assert!(err.outcome.store_rolled_back);
    assert!(!err.outcome.state_save_attempted);
    assert_eq!(err.outcome.status, RunStatus::Failed);
    assert_eq!(err.http_status(), 503);

    let location = err.pack.location.clone().unwrap();
    assert_eq!(location.statement_kind.as_deref(), Some("create"));

    let persisted = inner.load_state().await.unwrap().unwrap();
    assert_eq!(persisted.get("counter"), Some(&Value::from(0_i64)));
}

#[tokio::test]
async fn test_commit_failure_leaves_persisted_state_untouched() {
    let inner = seeded_store();
    let store = FailingStore::new(inner.clone()).fail_commit();
    let runner = FlowRunner::new(
        Services::in_memory().with_store(Arc::new(store)),
        EngineConfig::default(),
    );
    let flow = Flow::new("bump", vec![set_counter(9), create_order()]);

    let err = runner
        .run_flow(RunRequest::new(flow, order_program()))
        .await
        .unwrap_err();

    assert!(err.outcome.state_save_succeeded);
    assert!(err.outcome.store_commit_failed);
    assert!(err.outcome.store_rolled_back);
    assert!(!err.outcome.memory_persist_attempted);
    assert_eq!(inner.count("Order"), 0);
    let persisted = inner.load_state().await.unwrap().unwrap();
    assert_eq!(persisted.get("counter"), Some(&Value::from(0_i64)));
    assert_eq!(count_traces(&err.traces, "flow_start"), 1);
    assert!(matches!(err.traces.last(), Some(TraceEvent::FlowEnd { ok: false, .. })));
}

struct BrokenMemory;

#[async_trait]
impl MemoryManager for BrokenMemory {
    async fn recall_context(&self, _: &AiDecl, _: &str, _: &State) -> MemoryResult<Value> {
        Ok(Value::Null)
    }

    async fn record_interaction(
        &self,
        _: &AiDecl,
        _: &State,
        _: &str,
        _: &str,
        _: &[Value],
    ) -> MemoryResult<()> {
        Ok(())
    }

    async fn persist(&self, _: Option<&Path>, _: Option<&Path>, _: &[String]) -> MemoryResult<()> {
        Err(MemoryError::Persist("disk full".to_string()))
    }
}

#[tokio::test]
async fn test_memory_failure_after_commit_is_reported_not_rolled_back() {
    let store = seeded_store();
    let runner = FlowRunner::new(
        Services::in_memory()
            .with_store(Arc::new(store.clone()))
            .with_memory(Arc::new(BrokenMemory)),
        EngineConfig::default(),
    );
    let err = runner
        .run_flow(RunRequest::new(Flow::new("bump", vec![set_counter(7)]), Program::new()))
        .await
        .unwrap_err();

    assert_eq!(err.boundary(), Boundary::Memory);
    assert!(err.outcome.store_committed);
    assert!(!err.outcome.store_rolled_back);
    assert!(err.outcome.memory_persist_failed);
    assert_eq!(err.outcome.status, RunStatus::CommittedMemoryPersistFailed);
    let persisted = store.load_state().await.unwrap().unwrap();
    assert_eq!(persisted.get("counter"), Some(&Value::from(7_i64)));
}

#[tokio::test]
async fn test_concurrent_runs_do_not_share_state() {
    let runner = FlowRunner::new(Services::in_memory(), EngineConfig::default());
    let flow = Flow::new(
        "claim",
        vec![
            stmt(StatementKind::Set {
                target: AssignTarget::State(vec!["owner".to_string()]),
                value: Expression::attr("input", &["name"]),
            }),
            stmt(StatementKind::Return(Expression::state(&["owner"]))),
        ],
    );
    let request = |name: &str| {
        RunRequest::new(flow.clone(), Program::new())
            .with_state(State::new())
            .with_input(Value::map([("name", Value::from(name))]))
    };

    let (a, b) = tokio::join!(runner.run_flow(request("ana")), runner.run_flow(request("bo")));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.state.get("owner"), Some(&Value::from("ana")));
    assert_eq!(b.state.get("owner"), Some(&Value::from("bo")));
    assert_eq!(a.last_value, Value::from("ana"));
    assert_eq!(b.last_value, Value::from("bo"));
}

fn runner_with(store: FailingStore) -> FlowRunner {
    FlowRunner::new(
        Services::in_memory().with_store(Arc::new(store)),
        EngineConfig::default(),
    )
}

#[tokio::test]
async fn test_begin_failure_never_runs_the_body() {
    let runner = runner_with(FailingStore::new(seeded_store()).fail_begin());
    let err = runner
        .run_flow(RunRequest::new(Flow::new("bump", vec![set_counter(3)]), Program::new()))
        .await
        .unwrap_err();

    assert_eq!(err.boundary(), Boundary::Store);
    assert!(err.outcome.store_begin_attempted);
    assert!(err.outcome.store_begin_failed);
    assert!(!err.outcome.store_began);
    assert!(!err.outcome.body_attempted);
    assert!(!err.outcome.store_rolled_back);
    assert!(!err.outcome.state_save_attempted);
    assert_eq!(err.outcome.status, RunStatus::Failed);
    assert_eq!(count_traces(&err.traces, "flow_start"), 1);
    assert!(err.execution_steps.is_empty());
}

#[tokio::test]
async fn test_state_save_failure_rolls_back() {
    let inner = seeded_store();
    let runner = runner_with(FailingStore::new(inner.clone()).fail_save_state());
    let flow = Flow::new("bump", vec![set_counter(4), create_order()]);
    let err = runner
        .run_flow(RunRequest::new(flow, order_program()))
        .await
        .unwrap_err();

    assert_eq!(err.boundary(), Boundary::Store);
    assert!(err.outcome.body_executed);
    assert!(err.outcome.state_save_attempted);
    assert!(err.outcome.state_save_failed);
    assert!(!err.outcome.state_save_succeeded);
    assert!(!err.outcome.store_committed);
    assert!(err.outcome.store_rolled_back);
    assert_eq!(inner.count("Order"), 0);
    let persisted = inner.load_state().await.unwrap().unwrap();
    assert_eq!(persisted.get("counter"), Some(&Value::from(0_i64)));
}

#[tokio::test]
async fn test_rollback_failure_is_recorded() {
    let runner = runner_with(
        FailingStore::new(seeded_store())
            .fail_save_at(1)
            .fail_rollback(),
    );
    let err = runner
        .run_flow(RunRequest::new(Flow::new("orders", vec![create_order()]), order_program()))
        .await
        .unwrap_err();

    assert_eq!(err.boundary(), Boundary::Store);
    assert!(err.outcome.body_attempted);
    assert!(err.outcome.body_failed);
    assert!(!err.outcome.body_executed);
    assert!(err.outcome.store_rollback_failed);
    assert!(!err.outcome.store_rolled_back);
    assert_eq!(err.outcome.status, RunStatus::Failed);
    assert!(matches!(err.traces.last(), Some(TraceEvent::FlowEnd { ok: false, .. })));
}
