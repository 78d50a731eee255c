use std::sync::Arc;

use flowrun::ast::{
    AgentDecl, AiDecl, BinaryOperator, Branch, Expression, Flow, MergePolicy, Program,
    StatementKind,
};
use flowrun::config::EngineConfig;
use flowrun::provider::scripted::ScriptedProvider;
use flowrun::{EvalError, FlowRunner, RunRequest, Services, State, Value};
use pretty_assertions::assert_eq;

use super::{count_traces, stmt};

fn program() -> Program {
    Program::new()
        .with_ai(AiDecl {
            name: "assistant".to_string(),
            model: "mock".to_string(),
            system_prompt: "You help.".to_string(),
            exposed_tools: vec![],
            memory: false,
        })
        .with_agent(AgentDecl {
            name: "helper".to_string(),
            ai: "assistant".to_string(),
            system_prompt: None,
        })
}

fn run_agent(input: &str) -> StatementKind {
    StatementKind::RunAgent {
        agent: "helper".to_string(),
        input: Expression::literal(input),
        target: "reply".to_string(),
    }
}

#[tokio::test]
async fn test_agent_cap_stops_the_sixth_call() {
    let provider = Arc::new(ScriptedProvider::new());
    let runner = FlowRunner::new(
        Services::in_memory().with_ai(provider.clone()),
        EngineConfig::default(),
    );
    let flow = Flow::new(
        "chatty",
        vec![stmt(StatementKind::Repeat {
            count: Expression::literal(6_i64),
            body: vec![stmt(run_agent("ping"))],
        })],
    );
    let err = runner
        .run_flow(RunRequest::new(flow, program()).with_state(State::new()))
        .await
        .unwrap_err();
    assert!(matches!(err.cause, EvalError::AgentCallLimitExceeded { limit: 5 }));
    assert_eq!(err.http_status(), 429);
    assert_eq!(provider.call_count(), 5);
    assert_eq!(count_traces(&err.traces, "ai_call"), 5);
}

#[tokio::test]
async fn test_agent_reply_is_bound_and_traced() {
    let provider = Arc::new(ScriptedProvider::new().with_answer("refund", "Refunds take 3 days."));
    let runner = FlowRunner::new(
        Services::in_memory().with_ai(provider.clone()),
        EngineConfig::default(),
    );
    let flow = Flow::new(
        "support",
        vec![
            stmt(run_agent("how long does a refund take?")),
            stmt(StatementKind::Return(Expression::var("reply"))),
        ],
    );
    let result = runner
        .run_flow(RunRequest::new(flow, program()).with_state(State::new()))
        .await
        .unwrap();
    assert_eq!(result.last_value, Value::from("Refunds take 3 days."));
    assert_eq!(count_traces(&result.traces, "ai_call"), 1);
    assert_eq!(provider.calls()[0].system_prompt, "You help.");
}

#[tokio::test]
async fn test_best_effort_parallel_keeps_successful_branches() {
    let runner = FlowRunner::new(Services::in_memory(), EngineConfig::default());
    let branches = vec![
        Branch::new(
            "fast",
            vec![stmt(StatementKind::Return(Expression::literal("done")))],
        ),
        Branch::new(
            "broken",
            vec![stmt(StatementKind::Return(Expression::binary(
                BinaryOperator::Divide,
                Expression::literal(1_i64),
                Expression::literal(0_i64),
            )))],
        ),
    ];
    let flow = Flow::new(
        "fan_out",
        vec![
            stmt(StatementKind::Parallel {
                branches,
                merge: MergePolicy::BestEffort,
                target: Some("merged".to_string()),
            }),
            stmt(StatementKind::Return(Expression::var("merged"))),
        ],
    );
    let result = runner
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap();
    assert_eq!(result.last_value, Value::map([("fast", Value::from("done"))]));
    assert_eq!(count_traces(&result.traces, "parallel_branch"), 2);
    assert_eq!(count_traces(&result.traces, "merge"), 1);
}

#[tokio::test]
async fn test_all_required_parallel_fails_with_the_branch_error() {
    let runner = FlowRunner::new(Services::in_memory(), EngineConfig::default());
    let branches = vec![
        Branch::new(
            "ok",
            vec![stmt(StatementKind::Return(Expression::literal(1_i64)))],
        ),
        Branch::new(
            "broken",
            vec![stmt(StatementKind::Return(Expression::binary(
                BinaryOperator::Divide,
                Expression::literal(1_i64),
                Expression::literal(0_i64),
            )))],
        ),
    ];
    let flow = Flow::new(
        "fan_out",
        vec![stmt(StatementKind::Parallel {
            branches,
            merge: MergePolicy::AllRequired,
            target: None,
        })],
    );
    let err = runner
        .run_flow(RunRequest::new(flow, Program::new()).with_state(State::new()))
        .await
        .unwrap_err();
    assert!(matches!(err.cause, EvalError::DivisionByZero));
    assert_eq!(count_traces(&err.traces, "merge"), 1);
}

#[tokio::test]
async fn test_best_effort_branch_cannot_exceed_the_agent_cap() {
    let provider = Arc::new(ScriptedProvider::new());
    let runner = FlowRunner::new(
        Services::in_memory().with_ai(provider.clone()),
        EngineConfig::default(),
    );
    let branches = vec![
        Branch::new(
            "noop",
            vec![stmt(StatementKind::Return(Expression::literal(1_i64)))],
        ),
        Branch::new("sixth", vec![stmt(run_agent("one more"))]),
    ];
    let flow = Flow::new(
        "over_budget",
        vec![
            stmt(StatementKind::Repeat {
                count: Expression::literal(5_i64),
                body: vec![stmt(run_agent("ping"))],
            }),
            stmt(StatementKind::Parallel {
                branches,
                merge: MergePolicy::BestEffort,
                target: Some("merged".to_string()),
            }),
        ],
    );
    let err = runner
        .run_flow(RunRequest::new(flow, program()).with_state(State::new()))
        .await
        .unwrap_err();
    assert!(matches!(err.cause, EvalError::AgentCallLimitExceeded { limit: 5 }));
    assert_eq!(provider.call_count(), 5);
    assert!(err.outcome.store_rolled_back);
    assert!(!err.outcome.store_committed);
}
