//! Flowork Runtime - component runtime for the Flowork automation engine.
//!
//! Components are self-describing packages of four kinds (modules, plugins,
//! tools and triggers). This crate discovers them on disk, keeps their
//! third-party dependencies converged with their `requirements.txt`,
//! instantiates them on first use with their declared collaborators and
//! decorates their execution with retry and loop behaviors.
//!
//! # Example
//!
//! ```rust,ignore
//! use flowork_runtime::{ComponentKind, ComponentRuntime, ExecutionRequest};
//!
//! #[tokio::main]
//! async fn main() -> flowork_runtime::Result<()> {
//!     let runtime = ComponentRuntime::new("/srv/flowork")?;
//!     runtime.start_background()?;
//!
//!     for record in runtime.list(ComponentKind::Plugin) {
//!         println!("{} (installed: {})", record.id(), record.is_installed);
//!     }
//!
//!     let request = ExecutionRequest::new(serde_json::json!({ "text": "hi" }));
//!     let output = runtime.execute(ComponentKind::Plugin, "echo", request).await;
//!     println!("{:?}", output);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod behavior;
pub mod cancel;
pub mod component;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod install;
pub mod instance;
pub mod persist;

mod runtime;

// Re-export commonly used types
pub use behavior::{BehaviorChain, JsonProgressStore, MemoryProgressStore, ProgressStore};
pub use cancel::{CancellationToken, CancelledError};
pub use component::{
    Behavior, ComponentDescriptor, ComponentKind, ComponentRecord, EntryPoint,
    IsolationStrategy, KindPolicy,
};
pub use config::RuntimeSettings;
pub use discovery::{ComponentRegistry, RegistryDelta};
pub use error::{ExecutionFailure, Result, RuntimeError};
pub use events::{BroadcastEventBus, EventBus, RuntimeEvent, COMPONENT_LIST_CHANGED};
pub use install::{InstallReport, PackageInstaller, PipInstaller, PollReport};
pub use instance::{
    Component, ComponentContext, EntryPointRegistry, ExecutionControl, ExecutionMode,
    ExecutionOutcome, ExecutionRequest, Payload, ServiceLocator, StaticServiceLocator,
};
pub use runtime::{ComponentRuntime, ComponentRuntimeBuilder};
