//! Retry wrapper for registered actions

use super::{call_with_retry, classify_action_error, RetryError, RetryPolicy, ServedBy};
use crate::actions::{Action, ActionError, ActionResult};
use crate::context::ExecutionContext;
use crate::error::ErrorKind;
use crate::redact::Redactor;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Applies a [`RetryPolicy`] to an action, with an optional fallback action
/// invoked once when retries are exhausted.
pub struct RetryingAction {
    primary: Arc<dyn Action>,
    primary_name: String,
    fallback: Option<(String, Arc<dyn Action>)>,
    policy: RetryPolicy,
    redactor: Redactor,
}

impl RetryingAction {
    pub fn new(primary: Arc<dyn Action>, primary_name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            primary,
            primary_name: primary_name.into(),
            fallback: None,
            policy,
            redactor: Redactor::new(),
        }
    }

    pub fn with_fallback(mut self, name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        self.fallback = Some((name.into(), action));
        self
    }

    /// Mask secrets in logged and reported errors with `redactor`
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    fn unavailable(
        &self,
        last_error: &ActionError,
        retries: u32,
        fallback_error: Option<&ActionError>,
    ) -> String {
        match (&self.fallback, fallback_error) {
            (Some((fallback_name, _)), Some(fallback_error)) => format!(
                "'{}' unavailable after {} retries ({}); fallback '{}' failed: {}",
                self.primary_name, retries, last_error.message, fallback_name, fallback_error.message
            ),
            _ => format!(
                "'{}' unavailable after {} retries: {}",
                self.primary_name, retries, last_error.message
            ),
        }
    }
}

/// Run `action` once against the shared context
async fn attempt(
    action: &dyn Action,
    params: &Value,
    context: &Mutex<&mut ExecutionContext>,
) -> Result<ActionResult, ActionError> {
    let mut context = context.lock().await;
    let result = action.execute(params, &mut **context).await;
    if result.success {
        Ok(result)
    } else {
        Err(result.error_or_default())
    }
}

#[async_trait]
impl Action for RetryingAction {
    async fn execute(&self, params: &Value, context: &mut ExecutionContext) -> ActionResult {
        // Each attempt and the fallback borrow the context in turn
        let context = Mutex::new(context);
        let fallback = self
            .fallback
            .as_ref()
            .map(|(_, action)| attempt(action.as_ref(), params, &context).boxed());

        let outcome = call_with_retry(
            |_| attempt(self.primary.as_ref(), params, &context),
            &self.policy,
            classify_action_error,
            fallback,
            &self.redactor,
        )
        .await;

        match outcome {
            Ok(outcome) => {
                let served_by = match (outcome.served_by, &self.fallback) {
                    (ServedBy::Fallback, Some((fallback_name, _))) => {
                        info!("Fallback '{}' served '{}'", fallback_name, self.primary_name);
                        fallback_name.clone()
                    }
                    _ => self.primary_name.clone(),
                };
                outcome
                    .value
                    .with_served_by(served_by)
                    .with_retries(outcome.retries)
            }
            Err(RetryError::Terminal { error, retries }) => {
                ActionResult::from_error(error).with_retries(retries)
            }
            Err(RetryError::ServiceUnavailable {
                last_error,
                retries,
                fallback_error,
                ..
            }) => {
                let message = self.unavailable(&last_error, retries, fallback_error.as_ref());
                ActionResult::failure(ErrorKind::ServiceUnavailable, self.redactor.redact(&message))
                    .with_retries(retries)
            }
        }
    }

    fn description(&self) -> &str {
        self.primary.description()
    }
}
