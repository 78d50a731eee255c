//! Error boundary classification.
//!
//! Converts any [`EvalError`] escaping a run into an [`ErrorPack`]: a stable,
//! scrubbed description safe to show to callers. The boundary comes from the
//! layer that raised the error; the message never carries host paths or
//! secret values.

use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::eval::evaluator::EvalError;
use crate::guard::GuardCategory;
use crate::provider::ProviderError;

const MAX_MESSAGE_CHARS: usize = 280;
const REDACTED: &str = "***";

lazy_static! {
    static ref BEARER_TOKEN: Regex =
        Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").expect("bearer pattern");
    static ref API_KEY: Regex = Regex::new(r"sk-[A-Za-z0-9_-]{8,}").expect("api key pattern");
    static ref ABSOLUTE_PATH: Regex =
        Regex::new(r"(?:[A-Za-z]:\\|/)(?:[\w.-]+[/\\])+[\w.-]*").expect("path pattern");
}

/// Where an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Store,
    Memory,
    Engine,
    Authentication,
    Data,
    Internal,
}

/// Caller-facing category, independent of which layer raised the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ServerUnavailable,
    AuthInvalid,
    AuthMissing,
    ProviderMisconfigured,
    ActionDenied,
    PolicyDenied,
    UploadFailed,
    IngestionFailed,
    RuntimeInternal,
}

impl ErrorCategory {
    fn hint(&self) -> &'static str {
        match self {
            ErrorCategory::ServerUnavailable => "A backing service is unavailable. Retry later.",
            ErrorCategory::AuthInvalid => "Sign in again; the credentials are no longer valid.",
            ErrorCategory::AuthMissing => "Sign in before running this flow.",
            ErrorCategory::ProviderMisconfigured => "Check the AI provider configuration.",
            ErrorCategory::ActionDenied => "The current identity lacks the required permission.",
            ErrorCategory::PolicyDenied => "The flow's requires rule did not allow this run.",
            ErrorCategory::UploadFailed => "Check the uploaded file and try again.",
            ErrorCategory::IngestionFailed => "Ingestion could not process the upload.",
            ErrorCategory::RuntimeInternal => "Inspect the trace for the failing statement.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub flow_name: String,
    pub statement_kind: Option<String>,
    pub statement_index: Option<usize>,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

/// Stable error contract handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPack {
    pub error_id: String,
    pub boundary: Boundary,
    pub kind: String,
    pub category: ErrorCategory,
    pub stable_code: String,
    pub message: String,
    pub hint: String,
    pub location: Option<ErrorLocation>,
}

/// What the classifier needs to know to scrub a message.
#[derive(Debug, Default, Clone)]
pub struct ScrubContext<'a> {
    pub project_root: Option<&'a Path>,
    pub secret_values: &'a [String],
}

pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(
        error: &EvalError,
        location: Option<ErrorLocation>,
        scrub: &ScrubContext<'_>,
    ) -> ErrorPack {
        let boundary = error.boundary();
        let kind = error.kind().to_string();
        let category = Self::category(error);
        ErrorPack {
            error_id: format!("err-{}", Uuid::new_v4().simple()),
            boundary,
            stable_code: format!("runtime.{}.{}", category, kind),
            kind,
            category,
            message: scrub_message(&error.to_string(), scrub),
            hint: category.hint().to_string(),
            location,
        }
    }

    fn category(error: &EvalError) -> ErrorCategory {
        match error {
            EvalError::GuardDenied { category, reason, .. } => match category {
                GuardCategory::Authentication if reason == "missing_authentication" => {
                    ErrorCategory::AuthMissing
                }
                GuardCategory::Authentication => ErrorCategory::AuthInvalid,
                GuardCategory::Permission => ErrorCategory::ActionDenied,
                GuardCategory::Policy => ErrorCategory::PolicyDenied,
            },
            EvalError::CapabilityMissing { .. } => ErrorCategory::PolicyDenied,
            EvalError::Store { .. } | EvalError::Memory(_) => ErrorCategory::ServerUnavailable,
            EvalError::Provider(ProviderError::Misconfigured(_)) => {
                ErrorCategory::ProviderMisconfigured
            }
            EvalError::Provider(_) => ErrorCategory::ServerUnavailable,
            EvalError::Pipeline { pipeline, .. } if pipeline == "ingestion" => {
                ErrorCategory::IngestionFailed
            }
            EvalError::Contract { pipeline, .. } if pipeline == "ingestion" => {
                ErrorCategory::UploadFailed
            }
            _ => ErrorCategory::RuntimeInternal,
        }
    }
}

/// Replace every occurrence of a configured secret value.
pub fn scrub_secrets(text: &str, secret_values: &[String]) -> String {
    let mut scrubbed = text.to_string();
    for secret in secret_values.iter().filter(|s| !s.is_empty()) {
        scrubbed = scrubbed.replace(secret.as_str(), REDACTED);
    }
    scrubbed
}

/// Full caller-facing scrub: secrets, tokens, paths, then truncation.
pub fn scrub_message(text: &str, scrub: &ScrubContext<'_>) -> String {
    let mut scrubbed = scrub_secrets(text, scrub.secret_values);
    if let Some(root) = scrub.project_root {
        let root = root.to_string_lossy();
        if !root.is_empty() {
            scrubbed = scrubbed.replace(root.as_ref(), "<project>");
        }
    }
    scrubbed = BEARER_TOKEN
        .replace_all(&scrubbed, format!("Bearer {}", REDACTED))
        .into_owned();
    scrubbed = API_KEY.replace_all(&scrubbed, REDACTED).into_owned();
    scrubbed = ABSOLUTE_PATH.replace_all(&scrubbed, "<path>").into_owned();
    truncate(&scrubbed, MAX_MESSAGE_CHARS)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
