//! Loop behavior: run a component repeatedly, feeding each output back in as
//! the next input, with resumable progress.

use super::params::{get_bool, get_seconds, get_str, get_u32, is_truthy};
use super::progress::{progress_key, ProgressStore};
use crate::config::BehaviorConfig;
use crate::instance::{ExecuteFn, ExecutionMode, ExecutionOutcome, ExecutionRequest, Payload};
use futures::FutureExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopType {
    /// Run a fixed number of iterations.
    Count,
    /// Run while a field of the previous output is truthy.
    Condition,
}

/// Pause between two iterations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SleepPolicy {
    None,
    Static(Duration),
    /// Uniformly random duration between two bounds.
    RandomRange { min: Duration, max: Duration },
}

impl SleepPolicy {
    fn next_duration(&self) -> Option<Duration> {
        let duration = match *self {
            SleepPolicy::None => return None,
            SleepPolicy::Static(duration) => duration,
            SleepPolicy::RandomRange { min, max } => {
                let (low, high) = if min <= max { (min, max) } else { (max, min) };
                if low == high {
                    low
                } else {
                    rand::rng().random_range(low..=high)
                }
            }
        };
        (!duration.is_zero()).then_some(duration)
    }
}

/// Loop parameters read from a node configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopPolicy {
    pub enabled: bool,
    pub loop_type: LoopType,
    pub iterations: u32,
    /// Output field checked in condition mode; `None` tests the whole output.
    pub condition_field: Option<String>,
    pub max_iterations: u32,
    pub sleep: SleepPolicy,
}

impl LoopPolicy {
    pub fn from_config(config: &Payload) -> Self {
        let loop_type = match get_str(config, "loop_type").map(str::to_lowercase).as_deref() {
            Some("condition") => LoopType::Condition,
            _ => LoopType::Count,
        };

        let sleep = if get_bool(config, "enable_sleep").unwrap_or(false) {
            let seconds = |key: &str| get_seconds(config, key).unwrap_or(Duration::ZERO);
            match get_str(config, "sleep_type") {
                Some("random_range") => SleepPolicy::RandomRange {
                    min: seconds("random_min"),
                    max: seconds("random_max"),
                },
                _ => SleepPolicy::Static(seconds("static_duration")),
            }
        } else {
            SleepPolicy::None
        };

        Self {
            enabled: get_bool(config, "enable_loop").unwrap_or(false),
            loop_type,
            iterations: get_u32(config, "iterations")
                .unwrap_or(BehaviorConfig::DEFAULT_LOOP_ITERATIONS),
            condition_field: get_str(config, "condition_field").map(str::to_string),
            max_iterations: get_u32(config, "max_iterations")
                .unwrap_or(BehaviorConfig::DEFAULT_MAX_CONDITION_ITERATIONS),
            sleep,
        }
    }

    /// Whether another iteration should run after `completed` iterations.
    ///
    /// `previous` is the output of the last iteration run in this call; a
    /// condition loop always runs at least once per call.
    pub fn should_continue(&self, completed: u32, previous: Option<&Payload>) -> bool {
        match self.loop_type {
            LoopType::Count => completed < self.iterations,
            LoopType::Condition => {
                if completed >= self.max_iterations {
                    return false;
                }
                match (previous, self.condition_field.as_deref()) {
                    (None, _) => true,
                    (Some(output), Some(field)) => output.get(field).is_some_and(is_truthy),
                    (Some(output), None) => is_truthy(output),
                }
            }
        }
    }
}

/// Where a loop run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Iterating { completed: u32 },
    Stopped { completed: u32 },
    Completed { completed: u32 },
    Failed { completed: u32 },
}

/// Wrap `inner` with loop semantics; progress goes to `progress`.
pub fn wrap_loop(
    component_id: impl Into<String>,
    inner: ExecuteFn,
    progress: Arc<dyn ProgressStore>,
) -> ExecuteFn {
    let component_id: Arc<str> = Arc::from(component_id.into());
    Arc::new(move |request: ExecutionRequest| {
        let inner = Arc::clone(&inner);
        let progress = Arc::clone(&progress);
        let component_id = Arc::clone(&component_id);
        async move { run_loop(&component_id, inner, progress.as_ref(), request).await }.boxed()
    })
}

async fn run_loop(
    component_id: &str,
    inner: ExecuteFn,
    progress: &dyn ProgressStore,
    request: ExecutionRequest,
) -> ExecutionOutcome {
    let policy = LoopPolicy::from_config(&request.config);
    if !policy.enabled {
        return inner(request).await;
    }

    let persist = request.mode == ExecutionMode::Execute;
    let label = request.node_name.as_deref().unwrap_or(component_id).to_string();
    let key = progress_key(
        &request.context_id,
        request.node_id.as_deref().unwrap_or(component_id),
    );
    let start = if persist {
        progress.load(&key).unwrap_or(0)
    } else {
        0
    };
    if start > 0 {
        info!("Resuming loop of '{}' after {} completed iterations", label, start);
    }

    let stop = &request.control.stop;
    let mut completed = start;
    let mut payload = request.payload.clone();
    let mut previous: Option<Payload> = None;
    let mut state = LoopState::Idle;
    debug!(state = ?state, start, "Loop of '{}' starting", label);

    let outcome = loop {
        if stop.is_cancelled() || request.control.pause.wait_while_paused(stop).await.is_err() {
            warn!("Loop of '{}' stopped after {} iterations", label, completed);
            state = LoopState::Stopped { completed };
            break Ok(payload);
        }
        if !policy.should_continue(completed, previous.as_ref()) {
            info!("Loop of '{}' finished after {} iterations", label, completed);
            state = LoopState::Completed { completed };
            break Ok(payload);
        }

        state = LoopState::Iterating { completed };
        debug!(state = ?state, "Running loop iteration of '{}'", label);

        match inner(request.with_payload(payload.clone())).await {
            Ok(output) => {
                completed += 1;
                payload = output.clone();
                previous = Some(output);
                if persist {
                    if let Err(e) = progress.save(&key, completed) {
                        warn!("Failed to record loop progress of '{}': {}", label, e);
                    }
                }
            }
            Err(failure) => {
                error!(
                    "Loop iteration {} of '{}' failed: {}",
                    completed + 1,
                    label,
                    failure
                );
                state = LoopState::Failed { completed };
                break Err(failure);
            }
        }

        if persist && policy.should_continue(completed, previous.as_ref()) {
            if let Some(duration) = policy.sleep.next_duration() {
                debug!("Sleeping {:?} before next iteration of '{}'", duration, label);
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(duration) => {}
                }
            }
        }
    };

    debug!(state = ?state, "Loop of '{}' ended", label);
    // A failed loop keeps its progress so a retry resumes at the failed iteration.
    if persist && !matches!(state, LoopState::Failed { .. }) {
        if let Err(e) = progress.clear(&key) {
            warn!("Failed to clear loop progress of '{}': {}", label, e);
        }
    }
    outcome
}
