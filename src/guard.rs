//! `requires` enforcement.
//!
//! Guards are evaluated with the expression evaluator against the current
//! context and never touch state. Every check appends an
//! `authorization_check` trace whatever the outcome.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::debug;

use crate::ast::Expression;
use crate::eval::context::ExecutionContext;
use crate::eval::evaluator::{EvalError, EvalResult};
use crate::eval::expression::ExpressionEvaluator;
use crate::eval::value::Value;
use crate::trace::{AuthorizationOutcome, RecordAction, TraceEvent};

/// Why authentication is absent or invalid, as reported by the serving layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    MissingAuthentication,
    TokenInvalid,
    TokenExpired,
    SessionRevoked,
    SessionExpired,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub authenticated: bool,
    pub failure: Option<AuthFailure>,
}

impl AuthContext {
    pub fn authenticated() -> Self {
        Self {
            authenticated: true,
            failure: None,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            authenticated: false,
            failure: Some(AuthFailure::MissingAuthentication),
        }
    }

    pub fn failed(failure: AuthFailure) -> Self {
        Self {
            authenticated: false,
            failure: Some(failure),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GuardCategory {
    Policy,
    Authentication,
    Permission,
}

pub struct GuardEnforcer {
    expression_evaluator: ExpressionEvaluator,
}

impl Default for GuardEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardEnforcer {
    pub fn new() -> Self {
        Self {
            expression_evaluator: ExpressionEvaluator::new(),
        }
    }

    /// Evaluate `requires` and fail with `GuardDenied` when it is false.
    #[tracing::instrument(skip(self, context, requires), level = "debug")]
    pub async fn enforce(
        &self,
        context: &mut ExecutionContext,
        requires: &Expression,
        subject: &str,
    ) -> EvalResult<()> {
        let result = self
            .expression_evaluator
            .eval_expression(requires, context)
            .await?;
        let allowed = result.as_bool().ok_or_else(|| EvalError::TypeMismatch {
            context: format!("{} requires", subject),
            expected: "boolean".to_string(),
            found: result.type_name().to_string(),
        })?;

        if allowed {
            debug!(subject, "guard allowed");
            context.trace(TraceEvent::AuthorizationCheck {
                subject: subject.to_string(),
                outcome: AuthorizationOutcome::Allowed,
                category: None,
                reason: None,
            });
            return Ok(());
        }

        let (category, reason) = Self::denial_reason(context, requires);
        debug!(subject, %category, reason = %reason, "guard denied");
        context.trace(TraceEvent::AuthorizationCheck {
            subject: subject.to_string(),
            outcome: AuthorizationOutcome::Denied,
            category: Some(category.to_string()),
            reason: Some(reason.clone()),
        });
        Err(EvalError::GuardDenied {
            subject: subject.to_string(),
            category,
            reason,
        })
    }

    /// Guard check for one record mutation, with `mutation` bound to
    /// `{action, record}` while the rule is evaluated.
    pub async fn enforce_mutation(
        &self,
        context: &mut ExecutionContext,
        action: RecordAction,
        record: &str,
    ) -> EvalResult<()> {
        let flow = context.flow.clone();
        let subject = format!("flow \"{}\"", flow.name);

        if context.config.audit_required && !flow.audited {
            context.trace(TraceEvent::AuthorizationCheck {
                subject: subject.clone(),
                outcome: AuthorizationOutcome::Denied,
                category: Some(GuardCategory::Policy.to_string()),
                reason: Some("audit_required".to_string()),
            });
            return Err(EvalError::GuardDenied {
                subject,
                category: GuardCategory::Policy,
                reason: "audit_required".to_string(),
            });
        }

        let Some(requires) = flow.requires.as_ref().filter(|r| r.mentions_mutation()) else {
            return Ok(());
        };
        let binding = Value::map([
            ("action", Value::from(action.as_str())),
            ("record", Value::from(record)),
        ]);
        let mut scoped = context.locals().clone();
        scoped.insert("mutation".to_string(), binding);
        let saved = context.swap_locals(scoped);
        let result = self.enforce(context, requires, &subject).await;
        context.swap_locals(saved);
        result
    }

    fn denial_reason(context: &ExecutionContext, requires: &Expression) -> (GuardCategory, String) {
        if !requires.mentions_identity() {
            return (GuardCategory::Policy, "access_denied".to_string());
        }
        let auth = context.auth();
        if !auth.authenticated {
            let failure = auth.failure.unwrap_or(AuthFailure::MissingAuthentication);
            return (GuardCategory::Authentication, failure.to_string());
        }
        (
            GuardCategory::Permission,
            "insufficient_permissions".to_string(),
        )
    }
}
