//! Out-of-process runner seam for sandboxed flows.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::eval::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxFailure {
    pub kind: String,
    pub message: String,
}

/// What a sandbox runner reports back for one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub ok: bool,
    pub result: Value,
    pub error: Option<SandboxFailure>,
    pub runner: String,
}

impl SandboxResult {
    pub fn success(runner: impl Into<String>, result: Value) -> Self {
        Self {
            ok: true,
            result,
            error: None,
            runner: runner.into(),
        }
    }

    pub fn failure(
        runner: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ok: false,
            result: Value::Null,
            error: Some(SandboxFailure {
                kind: kind.into(),
                message: message.into(),
            }),
            runner: runner.into(),
        }
    }
}

/// Runs a sandboxed flow given `{input, state, identity}`.
///
/// Failures are reported in the result, never raised.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, flow_name: &str, payload: Value) -> SandboxResult;
}

type SandboxFn = Arc<dyn Fn(&str, &Value) -> Result<Value, String> + Send + Sync>;

/// In-process runner wrapping a closure. Used where no isolated worker exists.
#[derive(Clone)]
pub struct FnSandboxRunner {
    name: String,
    run: SandboxFn,
}

impl FnSandboxRunner {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(run),
        }
    }
}

#[async_trait]
impl SandboxRunner for FnSandboxRunner {
    async fn run(&self, flow_name: &str, payload: Value) -> SandboxResult {
        match (self.run)(flow_name, &payload) {
            Ok(result) => SandboxResult::success(&self.name, result),
            Err(message) => SandboxResult::failure(&self.name, "sandbox_error", message),
        }
    }
}
