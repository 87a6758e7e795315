//! The executable side of a component and the request it is called with.

use crate::cancel::{CancellationToken, CancelledError};
use crate::error::{ExecutionFailure, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Data flowing between workflow nodes.
pub type Payload = serde_json::Value;

/// Outcome of one (possibly decorated) execution.
pub type ExecutionOutcome = std::result::Result<Payload, ExecutionFailure>;

/// Whether side effects are allowed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    #[default]
    Execute,
    /// Dry run; loop progress is not persisted.
    Simulate,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Execute => "EXECUTE",
            ExecutionMode::Simulate => "SIMULATE",
        }
    }
}

/// Shared pause switch of a workflow run.
#[derive(Debug, Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Return once the gate is open, or fail when `stop` fires first.
    pub async fn wait_while_paused(
        &self,
        stop: &CancellationToken,
    ) -> std::result::Result<(), CancelledError> {
        let mut rx = self.tx.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = stop.cancelled() => return Err(CancelledError),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Stop and pause signals of a workflow run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionControl {
    pub stop: CancellationToken,
    pub pause: PauseGate,
}

/// One call into a component.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub payload: Payload,
    /// Node configuration; behaviors read their parameters from here.
    pub config: Payload,
    pub mode: ExecutionMode,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    /// Workflow run identifier, part of the loop progress key.
    pub context_id: String,
    pub control: ExecutionControl,
}

impl ExecutionRequest {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            config: Payload::Object(Default::default()),
            mode: ExecutionMode::Execute,
            node_id: None,
            node_name: None,
            context_id: String::new(),
            control: ExecutionControl::default(),
        }
    }

    pub fn with_config(mut self, config: Payload) -> Self {
        self.config = config;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_node(mut self, id: impl Into<String>, name: Option<String>) -> Self {
        self.node_id = Some(id.into());
        self.node_name = name;
        self
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = context_id.into();
        self
    }

    pub fn with_control(mut self, control: ExecutionControl) -> Self {
        self.control = control;
        self
    }

    /// Same request with a different payload.
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }
}

/// A live component instance.
#[async_trait]
pub trait Component: Send + Sync {
    /// Called once after construction; an error discards the instance.
    async fn on_load(&self) -> Result<()> {
        Ok(())
    }

    /// Called once when the instance is evicted.
    async fn on_unload(&self) {}

    async fn execute(&self, request: ExecutionRequest) -> ExecutionOutcome;
}

/// Type-erased execution entry point, the unit the behavior chain wraps.
pub type ExecuteFn = Arc<dyn Fn(ExecutionRequest) -> BoxFuture<'static, ExecutionOutcome> + Send + Sync>;

/// The raw, undecorated entry point of an instance.
pub fn execute_fn(component: Arc<dyn Component>) -> ExecuteFn {
    Arc::new(move |request: ExecutionRequest| {
        let component = Arc::clone(&component);
        async move { component.execute(request).await }.boxed()
    })
}
