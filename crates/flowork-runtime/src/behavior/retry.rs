//! Retry behavior: re-run a failed execution after a delay, with an optional
//! per-attempt timeout.

use super::params::{get_seconds, get_u32};
use crate::config::BehaviorConfig;
use crate::error::ExecutionFailure;
use crate::instance::{ExecuteFn, ExecutionOutcome, ExecutionRequest, Payload};
use futures::FutureExt;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Retry parameters read from a node configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Additional tries after the first one.
    pub attempts: u32,
    pub delay: Duration,
    /// Per-attempt limit; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: BehaviorConfig::DEFAULT_RETRY_ATTEMPTS,
            delay: Duration::from_secs(BehaviorConfig::DEFAULT_RETRY_DELAY_SECS),
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Read `retry_attempts`, `retry_delay_seconds` and `timeout_seconds`.
    pub fn from_config(config: &Payload) -> Self {
        let defaults = Self::default();
        let attempts = get_u32(config, "retry_attempts").unwrap_or(defaults.attempts);
        let delay = get_seconds(config, "retry_delay_seconds").unwrap_or(defaults.delay);
        let timeout = get_seconds(config, "timeout_seconds").filter(|limit| !limit.is_zero());
        Self {
            attempts,
            delay,
            timeout,
        }
    }
}

/// Wrap `inner` with retry semantics.
pub fn wrap_retry(component_id: impl Into<String>, inner: ExecuteFn) -> ExecuteFn {
    let component_id: Arc<str> = Arc::from(component_id.into());
    Arc::new(move |request: ExecutionRequest| {
        let inner = Arc::clone(&inner);
        let component_id = Arc::clone(&component_id);
        async move { run_with_retry(&component_id, inner, request).await }.boxed()
    })
}

async fn run_with_retry(
    component_id: &str,
    inner: ExecuteFn,
    request: ExecutionRequest,
) -> ExecutionOutcome {
    let policy = RetryPolicy::from_config(&request.config);
    let label = request
        .node_name
        .clone()
        .unwrap_or_else(|| component_id.to_string());
    let stop = request.control.stop.clone();
    let mut last_failure = ExecutionFailure::Cancelled;

    for attempt in 0..=policy.attempts {
        if attempt > 0 {
            if stop.is_cancelled() {
                debug!("Stop requested, not retrying '{}'", label);
                break;
            }
            warn!(
                attempt,
                total_attempts = policy.attempts,
                "Retrying '{}' in {:?} after: {}",
                label,
                policy.delay,
                last_failure
            );
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!("Stop requested during retry delay of '{}'", label);
                    break;
                }
                _ = tokio::time::sleep(policy.delay) => {}
            }
        }

        match run_attempt(component_id, &inner, &request, policy.timeout).await {
            Ok(payload) => return Ok(payload),
            Err(ExecutionFailure::Cancelled) => return Err(ExecutionFailure::Cancelled),
            Err(failure) => last_failure = failure,
        }
    }

    error!(
        "'{}' failed after {} retries: {}",
        label, policy.attempts, last_failure
    );
    Err(last_failure)
}

/// Run one attempt as its own task so a timeout can cancel and abort it.
async fn run_attempt(
    component_id: &str,
    inner: &ExecuteFn,
    request: &ExecutionRequest,
    timeout: Option<Duration>,
) -> ExecutionOutcome {
    let token = request.control.stop.child_token();
    let mut attempt_request = request.clone();
    attempt_request.control.stop = token.clone();

    let mut handle = tokio::spawn(inner(attempt_request));
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                token.cancel();
                handle.abort();
                return Err(ExecutionFailure::Timeout {
                    component: component_id.to_string(),
                    timeout: limit,
                });
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(ExecutionFailure::Panicked {
            message: panic_message(e.into_panic()),
        }),
        Err(_) => Err(ExecutionFailure::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
