//! Component instances: the execution contract, entry point resolution,
//! service injection and the JIT instance manager.

mod component;
mod loader;
mod manager;
mod services;

pub use component::{
    execute_fn, Component, ExecuteFn, ExecutionControl, ExecutionMode, ExecutionOutcome,
    ExecutionRequest, Payload, PauseGate,
};
pub use loader::{
    ComponentContext, ComponentFactory, EntryPointRegistry, LoaderContext, PythonComponent,
};
pub use manager::InstanceManager;
pub use services::{
    ComponentLogger, LogLevel, Service, ServiceLocator, ServiceMap, StaticServiceLocator,
    TracingLogger, KERNEL_ALIAS, LOCALIZATION_ALIASES, LOCALIZATION_SERVICE, LOGGER_ALIAS,
};
