use std::sync::Arc;

use flowrun::ast::{
    AssignTarget, ComparisonOperator, Expression, FieldSpec, Flow, Program, RecordSchema,
    StatementKind, TypeName,
};
use flowrun::boundary::{Boundary, ErrorCategory};
use flowrun::config::EngineConfig;
use flowrun::guard::{AuthContext, AuthFailure};
use flowrun::store::{InMemoryStore, Store};
use flowrun::trace::{AuthorizationOutcome, TraceEvent};
use flowrun::{EvalError, FlowRunner, RunRequest, Services, State, Value};
use pretty_assertions::assert_eq;

use super::{count_traces, stmt};

fn cart_state(items_count: i64) -> State {
    State::from([(
        "cart".to_string(),
        Value::map([("items_count", Value::from(items_count))]),
    )])
}

fn checkout() -> Flow {
    Flow::new(
        "checkout",
        vec![
            stmt(StatementKind::Set {
                target: AssignTarget::State(vec!["checked_out".to_string()]),
                value: Expression::literal(true),
            }),
            stmt(StatementKind::Return(Expression::literal("paid"))),
        ],
    )
    .requires(Expression::compare(
        ComparisonOperator::Gt,
        Expression::state(&["cart", "items_count"]),
        Expression::literal(0_i64),
    ))
}

#[tokio::test]
async fn test_false_guard_never_runs_the_body() {
    let store = InMemoryStore::new();
    let runner = FlowRunner::new(
        Services::in_memory().with_store(Arc::new(store.clone())),
        EngineConfig::default(),
    );
    let err = runner
        .run_flow(RunRequest::new(checkout(), Program::new()).with_state(cart_state(0)))
        .await
        .unwrap_err();

    assert!(matches!(err.cause, EvalError::GuardDenied { .. }));
    assert_eq!(err.kind(), "guard_denied");
    assert_eq!(err.pack.category, ErrorCategory::PolicyDenied);
    assert_eq!(err.http_status(), 403);
    assert_eq!(count_traces(&err.traces, "flow_start"), 0);
    assert!(err.execution_steps.is_empty());
    assert!(!err.outcome.store_begin_attempted);
    assert!(!err.outcome.store_began);
    assert!(!err.outcome.body_attempted);
    assert!(!err.outcome.store_rolled_back);
    assert!(!store.in_transaction().await);
    assert_eq!(store.load_state().await.unwrap(), None);

    let types: Vec<&str> = err.traces.iter().map(TraceEvent::type_name).collect();
    assert_eq!(types, vec!["authorization_check", "runtime_error", "flow_end"]);
}

#[tokio::test]
async fn test_true_guard_runs_the_body() {
    let runner = FlowRunner::new(Services::in_memory(), EngineConfig::default());
    let result = runner
        .run_flow(RunRequest::new(checkout(), Program::new()).with_state(cart_state(2)))
        .await
        .unwrap();
    assert_eq!(result.last_value, Value::from("paid"));
    assert_eq!(result.state.get("checked_out"), Some(&Value::Boolean(true)));
    assert!(matches!(
        result.traces.first(),
        Some(TraceEvent::AuthorizationCheck {
            outcome: AuthorizationOutcome::Allowed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_identity_guard_reports_authentication_failure() {
    let flow = Flow::new(
        "admin_only",
        vec![stmt(StatementKind::Return(Expression::literal(1_i64)))],
    )
    .requires(Expression::compare(
        ComparisonOperator::Eq,
        Expression::attr("identity", &["role"]),
        Expression::literal("admin"),
    ));
    let runner = FlowRunner::new(Services::in_memory(), EngineConfig::default());

    let viewer = || Value::map([("role", Value::from("viewer"))]);

    let err = runner
        .run_flow(
            RunRequest::new(flow.clone(), Program::new())
                .with_state(State::new())
                .with_identity(viewer())
                .with_auth(AuthContext::failed(AuthFailure::TokenExpired)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.boundary(), Boundary::Authentication);
    assert_eq!(err.pack.category, ErrorCategory::AuthInvalid);
    assert!(matches!(err.cause, EvalError::GuardDenied { ref reason, .. } if reason == "token_expired"));
    assert_eq!(err.http_status(), 401);

    let err = runner
        .run_flow(
            RunRequest::new(flow, Program::new())
                .with_state(State::new())
                .with_identity(viewer()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.boundary(), Boundary::Authentication);
    assert_eq!(err.pack.category, ErrorCategory::ActionDenied);
    assert_eq!(err.http_status(), 403);
}

#[tokio::test]
async fn test_mutation_guard_is_deferred_into_the_transaction() {
    let program = Program::new().with_record(RecordSchema::new(
        "Order",
        vec![FieldSpec::required("item", TypeName::Text)],
    ));
    let flow = Flow::new(
        "place",
        vec![stmt(StatementKind::Create {
            record: "Order".to_string(),
            values: Expression::literal(Value::map([("item", Value::from("book"))])),
            target: "order".to_string(),
        })],
    )
    .requires(Expression::compare(
        ComparisonOperator::Ne,
        Expression::attr("mutation", &["record"]),
        Expression::literal("Order"),
    ));
    let store = InMemoryStore::new();
    let runner = FlowRunner::new(
        Services::in_memory().with_store(Arc::new(store.clone())),
        EngineConfig::default(),
    );
    let err = runner
        .run_flow(RunRequest::new(flow, program).with_state(State::new()))
        .await
        .unwrap_err();

    assert!(matches!(err.cause, EvalError::GuardDenied { .. }));
    assert_eq!(count_traces(&err.traces, "flow_start"), 1);
    assert!(err.outcome.store_began);
    assert!(err.outcome.store_rolled_back);
    assert_eq!(store.count("Order"), 0);
}

#[tokio::test]
async fn test_audit_required_denies_unaudited_mutation() {
    let program = Program::new().with_record(RecordSchema::new(
        "Note",
        vec![FieldSpec::required("title", TypeName::Text)],
    ));
    let flow = Flow::new(
        "note",
        vec![stmt(StatementKind::Create {
            record: "Note".to_string(),
            values: Expression::literal(Value::map([("title", Value::from("hi"))])),
            target: "note".to_string(),
        })],
    );
    let config = EngineConfig {
        audit_required: true,
        ..EngineConfig::default()
    };
    let runner = FlowRunner::new(Services::in_memory(), config);

    let err = runner
        .run_flow(RunRequest::new(flow.clone(), program.clone()).with_state(State::new()))
        .await
        .unwrap_err();
    assert!(matches!(err.cause, EvalError::GuardDenied { ref reason, .. } if reason == "audit_required"));

    let result = runner
        .run_flow(RunRequest::new(flow.audited(), program).with_state(State::new()))
        .await
        .unwrap();
    assert_eq!(count_traces(&result.traces, "audit_entry"), 1);
    let entries = runner.services().audit.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record_changes.len(), 1);
    assert!(runner.services().audit.verify().await);
}
