//! Error types for the Flowork component runtime.
//!
//! `RuntimeError` covers failures that are the runtime's own responsibility
//! (discovery, reconciliation, instantiation). Failures raised by a
//! component's own execution are modelled separately as [`ExecutionFailure`]
//! so the behavior chain can hand them back to the workflow executor as data.

use crate::component::ComponentKind;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the component runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    // Descriptor errors
    #[error("Invalid descriptor at {path}: {message}")]
    Descriptor { path: PathBuf, message: String },

    // Installation errors
    #[error("Dependency installation failed for {component}: {message}")]
    Install { component: String, message: String },

    #[error("Installer timed out after {0:?}")]
    Timeout(std::time::Duration),

    // Instantiation errors
    #[error("Failed to instantiate {kind} '{id}': {message}")]
    Instantiation {
        kind: ComponentKind,
        id: String,
        message: String,
    },

    #[error("Entry point '{entry_point}' not found for '{id}'")]
    EntryPointNotFound { id: String, entry_point: String },

    // Registry errors
    #[error("{kind} '{id}' not found")]
    ComponentNotFound { kind: ComponentKind, id: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RuntimeError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        RuntimeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create an installation error for a component.
    pub fn install(component: impl Into<String>, message: impl Into<String>) -> Self {
        RuntimeError::Install {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the reconciler should simply try again on its next poll.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RuntimeError::Install { .. } | RuntimeError::Timeout(_) | RuntimeError::Io { .. }
        )
    }
}

/// Uniform failure outcome of a component execution.
///
/// Both an error value returned by a component and a panic inside it end up
/// here; the behavior chain decides whether to retry on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionFailure {
    #[error("{message}")]
    Failed { message: String },

    #[error("Execution of '{component}' timed out after {timeout:?}")]
    Timeout {
        component: String,
        timeout: std::time::Duration,
    },

    #[error("Component panicked: {message}")]
    Panicked { message: String },

    #[error("Execution cancelled")]
    Cancelled,
}

impl ExecutionFailure {
    /// Convenience constructor for a plain failure message.
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutionFailure::Failed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::ComponentNotFound {
            kind: ComponentKind::Plugin,
            id: "echo".into(),
        };
        assert_eq!(err.to_string(), "plugin 'echo' not found");
    }

    #[test]
    fn test_transient_errors() {
        assert!(RuntimeError::install("echo", "pip exited with 1").is_transient());
        assert!(RuntimeError::Timeout(std::time::Duration::from_secs(5)).is_transient());
        assert!(!RuntimeError::Config {
            message: "bad".into()
        }
        .is_transient());
    }

    #[test]
    fn test_execution_failure_display() {
        let failure = ExecutionFailure::Timeout {
            component: "echo".into(),
            timeout: std::time::Duration::from_secs(3),
        };
        assert_eq!(failure.to_string(), "Execution of 'echo' timed out after 3s");

        let failure = ExecutionFailure::Timeout {
            component: "echo".into(),
            timeout: std::time::Duration::from_millis(500),
        };
        assert_eq!(failure.to_string(), "Execution of 'echo' timed out after 500ms");
        assert_eq!(ExecutionFailure::failed("boom").to_string(), "boom");
    }
}
