use std::sync::Arc;

use flowrun::ast::{
    AssignTarget, BinaryOperator, ComparisonOperator, Expression, Flow, FlowKind, JobDecl,
    LogLevel, MatchCase, Program, StatementKind,
};
use flowrun::config::EngineConfig;
use flowrun::sandbox::FnSandboxRunner;
use flowrun::trace::TraceEvent;
use flowrun::{EvalError, FlowRunner, RunRequest, Services, State, Value};
use pretty_assertions::assert_eq;

use super::{count_traces, stmt};

fn runner() -> FlowRunner {
    FlowRunner::new(Services::in_memory(), EngineConfig::default())
}

fn status_flow() -> Flow {
    Flow::new(
        "status",
        vec![stmt(StatementKind::Match {
            subject: Expression::state(&["status"]),
            cases: vec![MatchCase {
                pattern: Expression::literal("open"),
                body: vec![stmt(StatementKind::Return(Expression::literal("OK")))],
            }],
            otherwise: Some(vec![stmt(StatementKind::Return(Expression::literal(
                "CLOSED",
            )))]),
        })],
    )
}

fn status(value: &str) -> State {
    State::from([("status".to_string(), Value::from(value))])
}

#[tokio::test]
async fn test_match_takes_the_first_equal_case() {
    let result = runner()
        .run_flow(RunRequest::new(status_flow(), Program::new()).with_state(status("open")))
        .await
        .unwrap();
    assert_eq!(result.last_value, Value::from("OK"));
    let decisions: Vec<_> = result
        .execution_steps
        .iter()
        .filter(|s| s.kind == "decision_match")
        .collect();
    assert_eq!(decisions.len(), 1);
    assert!(!decisions[0].what.contains("otherwise"));

    let result = runner()
        .run_flow(RunRequest::new(status_flow(), Program::new()).with_state(status("done")))
        .await
        .unwrap();
    assert_eq!(result.last_value, Value::from("CLOSED"));
}

#[tokio::test]
async fn test_constant_cannot_be_reassigned() {
    let flow = Flow::new(
        "constants",
        vec![
            stmt(StatementKind::Let {
                name: "rate".to_string(),
                value: Expression::literal(3_i64),
                constant: true,
            }),
            stmt(StatementKind::TryCatch {
                try_body: vec![stmt(StatementKind::Set {
                    target: AssignTarget::Local("rate".to_string()),
                    value: Expression::literal(4_i64),
                })],
                catch_var: "failure".to_string(),
                catch_body: vec![],
            }),
            stmt(StatementKind::Return(Expression::List(vec![
                Expression::var("rate"),
                Expression::attr("failure", &["kind"]),
            ]))),
        ],
    );
    let result = runner()
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap();
    assert_eq!(
        result.last_value,
        Value::List(vec![Value::from(3_i64), Value::from("constant_reassignment")])
    );
}

#[tokio::test]
async fn test_uncaught_reassignment_fails_the_run() {
    let flow = Flow::new(
        "constants",
        vec![
            stmt(StatementKind::Let {
                name: "rate".to_string(),
                value: Expression::literal(3_i64),
                constant: true,
            }),
            stmt(StatementKind::Set {
                target: AssignTarget::Local("rate".to_string()),
                value: Expression::literal(4_i64),
            })
            .at(2, 5),
        ],
    );
    let err = runner()
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap_err();
    assert!(matches!(err.cause, EvalError::ConstantReassignment(ref name) if name == "rate"));
    let location = err.pack.location.unwrap();
    assert_eq!(location.line, Some(2));
    assert_eq!(location.column, Some(5));
}

#[tokio::test]
async fn test_return_escapes_nested_loops() {
    let flow = Flow::new(
        "search",
        vec![
            stmt(StatementKind::ForEach {
                binder: "n".to_string(),
                iterable: Expression::List(vec![
                    Expression::literal(1_i64),
                    Expression::literal(4_i64),
                    Expression::literal(9_i64),
                ]),
                body: vec![stmt(StatementKind::If {
                    condition: Expression::compare(
                        ComparisonOperator::Gt,
                        Expression::var("n"),
                        Expression::literal(3_i64),
                    ),
                    then_body: vec![stmt(StatementKind::Return(Expression::binary(
                        BinaryOperator::Multiply,
                        Expression::var("n"),
                        Expression::literal(10_i64),
                    )))],
                    else_body: vec![],
                })],
            }),
            stmt(StatementKind::Return(Expression::literal(0_i64))),
        ],
    );
    let result = runner()
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap();
    assert_eq!(result.last_value, Value::from(40_i64));
}

#[tokio::test]
async fn test_due_jobs_run_after_the_body() {
    let program = Program::new().with_job(JobDecl {
        name: "process".to_string(),
        body: vec![stmt(StatementKind::Set {
            target: AssignTarget::State(vec!["processed".to_string()]),
            value: Expression::attr("input", &["id"]),
        })],
    });
    let flow = Flow::new(
        "schedule",
        vec![
            stmt(StatementKind::EnqueueJob {
                job: "process".to_string(),
                input: Some(Expression::literal(Value::map([("id", Value::from(7_i64))]))),
                after: Some(Expression::literal(10_i64)),
            }),
            stmt(StatementKind::EnqueueJob {
                job: "process".to_string(),
                input: Some(Expression::literal(Value::map([("id", Value::from(8_i64))]))),
                after: Some(Expression::literal(100_i64)),
            }),
            stmt(StatementKind::AdvanceTime {
                amount: Expression::literal(10_i64),
            }),
        ],
    );
    let result = runner()
        .run_flow(RunRequest::new(flow, program).with_state(State::new()))
        .await
        .unwrap();
    assert_eq!(result.state.get("processed"), Some(&Value::from(7_i64)));
    assert_eq!(count_traces(&result.traces, "job_enqueued"), 2);
    assert_eq!(count_traces(&result.traces, "job_run"), 1);
}

#[tokio::test]
async fn test_logs_yields_and_theme_are_returned() {
    let flow = Flow::new(
        "ui",
        vec![
            stmt(StatementKind::Log {
                level: LogLevel::Info,
                message: Expression::literal("switching theme"),
                fields: Some(Expression::literal(Value::map([("to", Value::from("dark"))]))),
            }),
            stmt(StatementKind::ThemeChange(Expression::literal("dark"))),
            stmt(StatementKind::Yield(Expression::literal("working"))),
        ],
    );
    let result = runner()
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap();
    assert_eq!(result.runtime_theme.as_deref(), Some("dark"));
    assert_eq!(result.yield_messages, vec![Value::from("working")]);
    assert_eq!(result.logs.len(), 1);
    assert_eq!(result.logs[0].message, "switching theme");

    let unknown_theme = Flow::new(
        "ui",
        vec![stmt(StatementKind::ThemeChange(Expression::literal("neon")))],
    );
    assert!(
        runner()
            .run_flow(RunRequest::new(unknown_theme, Program::new()).with_state(State::new()))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_unsupported_construct_is_named() {
    let flow = Flow::new(
        "legacy",
        vec![stmt(StatementKind::Unsupported("goto".to_string()))],
    );
    let err = runner()
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap_err();
    assert!(matches!(err.cause, EvalError::NotSupported(ref what) if what.contains("goto")));
    assert_eq!(err.kind(), "not_supported");
}

#[tokio::test]
async fn test_sandboxed_flow_uses_the_runner() {
    let sandbox = FnSandboxRunner::new("local", |flow_name, payload| {
        let name = payload
            .as_map()
            .and_then(|p| p.get("input"))
            .and_then(|i| i.as_map())
            .and_then(|i| i.get("name"))
            .and_then(Value::as_text)
            .ok_or("missing name")?
            .to_string();
        Ok(Value::from(format!("{} greeted {}", flow_name, name)))
    });
    let runner = FlowRunner::new(
        Services::in_memory().with_sandbox(Arc::new(sandbox)),
        EngineConfig::default(),
    );
    let flow = Flow::new("hello", vec![]).with_kind(FlowKind::Sandboxed);

    let result = runner
        .run_flow(
            RunRequest::new(flow.clone(), Program::new())
                .with_state(State::new())
                .with_input(Value::map([("name", Value::from("ana"))])),
        )
        .await
        .unwrap();
    assert_eq!(result.last_value, Value::from("hello greeted ana"));

    let err = runner
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap_err();
    assert!(matches!(err.cause, EvalError::Sandbox(ref message) if message == "missing name"));
}

#[tokio::test]
async fn test_declarative_flow_runs_through_the_coordinator() {
    use flowrun::ast::{FieldSpec, FlowStep, RecordSchema, TypeName};
    use flowrun::trace::StepStatus;

    let program = Program::new().with_record(RecordSchema::new(
        "Ticket",
        vec![FieldSpec::required("title", TypeName::Text)],
    ));
    let flow = Flow::new("open_ticket", vec![]).with_kind(FlowKind::Declarative(vec![
        FlowStep::Input {
            fields: vec![FieldSpec::required("title", TypeName::Text)],
        },
        FlowStep::Create {
            record: "Ticket".to_string(),
            fields: vec![("title".to_string(), Expression::attr("input", &["title"]))],
        },
    ]));
    let result = runner()
        .run_flow(
            RunRequest::new(flow, program)
                .with_state(State::new())
                .with_input(Value::map([("title", Value::from("printer jam"))])),
        )
        .await
        .unwrap();
    let statuses: Vec<StepStatus> = result
        .traces
        .iter()
        .filter_map(|t| match t {
            TraceEvent::FlowStep { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![StepStatus::Ok, StepStatus::Ok]);
    assert_eq!(count_traces(&result.traces, "record_write"), 1);
}
