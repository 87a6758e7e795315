//! Execution behaviors declared by components.
//!
//! A descriptor opts into behaviors by name; the chain wraps the raw entry
//! point with each declared behavior once, Loop innermost and Retry around
//! it, so a retried attempt resumes a failed loop where it stopped.

mod looping;
mod params;
mod progress;
mod retry;

pub use looping::{wrap_loop, LoopPolicy, LoopState, LoopType, SleepPolicy};
pub use progress::{progress_key, JsonProgressStore, MemoryProgressStore, ProgressStore};
pub use retry::{wrap_retry, RetryPolicy};

use crate::component::{Behavior, ComponentDescriptor};
use crate::instance::ExecuteFn;
use std::sync::Arc;

/// Applies declared behaviors to raw entry points.
#[derive(Clone)]
pub struct BehaviorChain {
    progress: Arc<dyn ProgressStore>,
}

impl BehaviorChain {
    pub fn new(progress: Arc<dyn ProgressStore>) -> Self {
        Self { progress }
    }

    pub fn progress(&self) -> &Arc<dyn ProgressStore> {
        &self.progress
    }

    pub fn wrap(&self, descriptor: &ComponentDescriptor, raw: ExecuteFn) -> ExecuteFn {
        let mut execute = raw;
        if descriptor.has_behavior(Behavior::Loop) {
            execute = wrap_loop(descriptor.id.clone(), execute, Arc::clone(&self.progress));
        }
        if descriptor.has_behavior(Behavior::Retry) {
            execute = wrap_retry(descriptor.id.clone(), execute);
        }
        execute
    }
}
