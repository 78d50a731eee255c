use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{AiProvider, AiRequest, AiResponse, ProviderError, ProviderResult};

type Pattern = String;

type Answer = String;

/// Deterministic provider for local runs and tests.
///
/// Answers come from, in order: the queued script, the first knowledge-base
/// pattern contained in the user input, then an echo of the input.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<AiResponse>>,
    knowledge: DashMap<Pattern, Answer>,
    calls: Mutex<Vec<AiRequest>>,
    should_fail: AtomicBool,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, responses: impl IntoIterator<Item = AiResponse>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(responses);
        }
        self
    }

    pub fn with_answer(self, pattern: impl Into<String>, answer: impl Into<String>) -> Self {
        self.knowledge.insert(pattern.into(), answer.into());
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<AiRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    fn lookup(&self, input: &str) -> Option<Answer> {
        let mut matches: Vec<(Pattern, Answer)> = self
            .knowledge
            .iter()
            .filter(|entry| input.contains(entry.key().as_str()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        matches.sort();
        matches.into_iter().next().map(|(_, answer)| answer)
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    #[tracing::instrument(skip(self, request), level = "debug")]
    async fn ask(&self, request: AiRequest) -> ProviderResult<AiResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(ProviderError::Unavailable("scripted failure".to_string()));
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let response = match scripted {
            Some(response) => response,
            None => match self.lookup(&request.user_input) {
                Some(answer) => AiResponse::Output(answer),
                None => AiResponse::Output(format!("echo: {}", request.user_input)),
            },
        };
        debug!("response: {:?}", response);
        Ok(response)
    }
}
