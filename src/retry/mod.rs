//! Retry with exponential backoff and an optional fallback
//!
//! Failures are classified as retryable (timeouts, rate limiting, transient
//! network trouble, unavailable services) or terminal. Only retryable failures
//! are retried. The delay before retry `n` (1-based) is
//! `backoff_base * 2^(n-1)` plus jitter drawn from `[0, delay / 2)`, so
//! uncapped delays strictly increase.

use crate::actions::ActionError;
use crate::error::ErrorKind;
use crate::redact::Redactor;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod action;

pub use action::RetryingAction;

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_jitter() -> bool {
    true
}

/// Backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Upper bound on a single delay
    #[serde(default, with = "humantime_serde")]
    pub max_delay: Option<Duration>,

    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            max_delay: None,
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Un-jittered delay before retry `retry` (1-based)
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let multiplier = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        let delay = self
            .backoff_base
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Add jitter in `[0, delay / 2)`
    pub fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let mut rng = rand::rng();
        let factor: f64 = rng.random_range(0.0..0.5);
        delay + delay.mul_f64(factor)
    }

    /// Delay actually waited before retry `retry`
    pub fn next_delay(&self, retry: u32) -> Duration {
        self.apply_jitter(self.calculate_delay(retry))
    }
}

/// Retry block of a step: a policy plus an optional fallback action
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepRetryConfig {
    #[serde(flatten)]
    pub policy: RetryPolicy,

    /// Registry key of the action used once retries are exhausted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_action: Option<String>,
}

/// Whether a failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// Classify by kind; generic execution failures fall back to their message
pub fn classify_action_error(error: &ActionError) -> ErrorClass {
    match error.kind {
        ErrorKind::Timeout
        | ErrorKind::RateLimited
        | ErrorKind::Network
        | ErrorKind::ServiceUnavailable => ErrorClass::Retryable,
        ErrorKind::ActionExecution | ErrorKind::Io => classify_message(&error.message),
        _ => ErrorClass::Terminal,
    }
}

/// Transient-failure keywords; status codes only count as whole words
static TRANSIENT_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:500|502|503|504|429)\b|network|connection|refused|unreachable|timeout|timed out|server error|unavailable|rate limit|too many requests",
    )
    .expect("valid transient message pattern")
});

/// Keyword classification of a free-form error message
pub fn classify_message(message: &str) -> ErrorClass {
    if TRANSIENT_MESSAGE.is_match(message) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Terminal
    }
}

/// Which implementation produced a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedBy {
    Primary,
    Fallback,
}

/// Successful outcome of [`call_with_retry`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub served_by: ServedBy,
    pub retries: u32,
    /// Each delay waited, in order
    pub delays: Vec<Duration>,
}

/// Failure of [`call_with_retry`]
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Retryable failures until the budget ran out (and the fallback, if any, failed too)
    #[error("service unavailable after {retries} retries: {last_error}")]
    ServiceUnavailable {
        last_error: E,
        retries: u32,
        delays: Vec<Duration>,
        fallback_error: Option<E>,
    },

    /// A failure that is not worth retrying, such as data not found
    #[error("terminal failure after {retries} retries: {error}")]
    Terminal { error: E, retries: u32 },
}

impl<E> RetryError<E> {
    pub fn retries(&self) -> u32 {
        match self {
            RetryError::ServiceUnavailable { retries, .. } | RetryError::Terminal { retries, .. } => {
                *retries
            }
        }
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, RetryError::ServiceUnavailable { .. })
    }

    /// The primary call's last error
    pub fn into_error(self) -> E {
        match self {
            RetryError::ServiceUnavailable { last_error, .. } => last_error,
            RetryError::Terminal { error, .. } => error,
        }
    }
}

/// Call `operation` until it succeeds, fails terminally, or retries run out.
///
/// `operation` receives the number of retries performed so far. On
/// exhaustion the `fallback` future, if given, is awaited once. Error text is
/// passed through `redactor` before it is logged.
pub async fn call_with_retry<T, E, F, Fut, C>(
    mut operation: F,
    policy: &RetryPolicy,
    classify: C,
    fallback: Option<BoxFuture<'_, Result<T, E>>>,
    redactor: &Redactor,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorClass,
    E: std::fmt::Display,
{
    let mut retries = 0u32;
    let mut delays = Vec::new();

    let last_error = loop {
        match operation(retries).await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    served_by: ServedBy::Primary,
                    retries,
                    delays,
                })
            }
            Err(error) => {
                if classify(&error) == ErrorClass::Terminal {
                    debug!(
                        "Terminal failure, not retrying: {}",
                        redactor.redact(&error.to_string())
                    );
                    return Err(RetryError::Terminal { error, retries });
                }
                if retries >= policy.max_retries {
                    break error;
                }
                retries += 1;
                let delay = policy.next_delay(retries);
                info!(
                    "Retrying (attempt {}/{}) after {:?}: {}",
                    retries,
                    policy.max_retries,
                    delay,
                    redactor.redact(&error.to_string())
                );
                tokio::time::sleep(delay).await;
                delays.push(delay);
            }
        }
    };

    warn!(
        "Retries exhausted after {} attempts: {}",
        retries + 1,
        redactor.redact(&last_error.to_string())
    );

    let Some(fallback) = fallback else {
        return Err(RetryError::ServiceUnavailable {
            last_error,
            retries,
            delays,
            fallback_error: None,
        });
    };

    match fallback.await {
        Ok(value) => {
            info!("Fallback served the call after {} retries", retries);
            Ok(RetryOutcome {
                value,
                served_by: ServedBy::Fallback,
                retries,
                delays,
            })
        }
        Err(fallback_error) => {
            warn!(
                "Fallback failed after {} retries: {}",
                retries,
                redactor.redact(&fallback_error.to_string())
            );
            Err(RetryError::ServiceUnavailable {
                last_error,
                retries,
                delays,
                fallback_error: Some(fallback_error),
            })
        }
    }
}
