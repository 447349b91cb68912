//! Exponential backoff with jitter and a pluggable retry classifier.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::jitter_unit;
use crate::error::{ErrorCode, ToolCallError};

/// Resolved, clamped retry knobs (see `config::RetryConfig` for the raw,
/// user-facing form before clamping).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: i64,
    pub max_delay_ms: i64,
    pub backoff_factor: f64,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 250,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            jitter_ratio: 0.2,
        }
    }
}

/// Information handed to a [`RetryClassifier`] about the failure that just occurred.
#[derive(Debug, Clone)]
pub struct RetryClassifierInput<'a> {
    pub error_message: &'a str,
    pub error_code: ErrorCode,
    pub status_code: Option<u16>,
    pub cancelled_by_caller: bool,
    pub attempt: u32,
    pub max_attempts: u32,
    pub tool_name: &'a str,
    pub destination: Option<&'a str>,
    pub action: Option<&'a str>,
}

/// The classifier's verdict. `delay_ms: None` defers to the default backoff
/// calculation; `Some(ms)` overrides it outright.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub retryable: bool,
    pub reason: Option<String>,
    pub delay_ms: Option<i64>,
}

impl RetryDecision {
    pub fn retry() -> Self {
        RetryDecision {
            retryable: true,
            reason: None,
            delay_ms: None,
        }
    }

    pub fn no_retry(reason: impl Into<String>) -> Self {
        RetryDecision {
            retryable: false,
            reason: Some(reason.into()),
            delay_ms: None,
        }
    }
}

/// Pluggable override for the default retryability decision.
#[async_trait]
pub trait RetryClassifier: Send + Sync {
    async fn classify(&self, input: &RetryClassifierInput<'_>) -> RetryDecision;
}

/// A status code the source treats as transient HTTP failure: 408, 429, or any 5xx.
pub fn is_retryable_status(status_code: Option<u16>) -> bool {
    matches!(status_code, Some(408) | Some(429)) || matches!(status_code, Some(s) if s >= 500)
}

/// Whether a failure is retryable absent any classifier override:
/// not caller-cancelled, and either a transient HTTP status or a
/// `NETWORK_ERROR` code. Fatal codes are never retried regardless.
pub fn is_default_retryable(
    code: ErrorCode,
    status_code: Option<u16>,
    cancelled_by_caller: bool,
) -> bool {
    if cancelled_by_caller || code.is_fatal() {
        return false;
    }
    is_retryable_status(status_code) || code == ErrorCode::NetworkError
}

/// Resolve whether to retry `error` on `attempt` of `max_attempts`, consulting
/// an optional classifier and falling back to the default decision when the
/// classifier is absent or defers.
pub async fn resolve_retry_decision(
    policy: &RetryPolicy,
    classifier: Option<&(dyn RetryClassifier)>,
    error: &ToolCallError,
    attempt: u32,
    tool_name: &str,
    destination: Option<&str>,
    action: Option<&str>,
) -> RetryDecision {
    let default_retryable =
        is_default_retryable(error.code(), error.status_code(), error.cancelled_by_caller());

    if attempt >= policy.max_attempts {
        return RetryDecision::no_retry("max attempts exhausted");
    }

    match classifier {
        None => {
            if default_retryable {
                RetryDecision::retry()
            } else {
                RetryDecision::no_retry("not retryable")
            }
        }
        Some(classifier) => {
            let input = RetryClassifierInput {
                error_message: error.message(),
                error_code: error.code(),
                status_code: error.status_code(),
                cancelled_by_caller: error.cancelled_by_caller(),
                attempt,
                max_attempts: policy.max_attempts,
                tool_name,
                destination,
                action,
            };
            // The classifier's verdict always wins over the default — it is an
            // explicit override, not a vote.
            classifier.classify(&input).await
        }
    }
}

/// `min(maxDelay, initial * factor^(attempt-1)) * (1 + U(-1,1) * jitterRatio)`, floored at 0.
pub fn compute_backoff_delay(policy: &RetryPolicy, attempt: u32, override_delay_ms: Option<i64>) -> i64 {
    if let Some(delay) = override_delay_ms {
        if delay >= 0 {
            return delay;
        }
    }
    let exponent = attempt.saturating_sub(1) as i32;
    let base = policy.initial_delay_ms as f64 * policy.backoff_factor.powi(exponent);
    let capped = base.min(policy.max_delay_ms as f64);
    let jittered = capped * (1.0 + jitter_unit() * policy.jitter_ratio);
    jittered.max(0.0).round() as i64
}
