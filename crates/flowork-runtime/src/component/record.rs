//! Registry entry for a discovered component.

use super::ComponentDescriptor;
use serde::Serialize;

/// One discovered component and its mutable lifecycle flags.
///
/// The live instance is deliberately not stored here: it belongs to the
/// instance manager, which keeps it in its own per-id slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentRecord {
    pub descriptor: ComponentDescriptor,
    /// Persisted in the kind's pause list; survives restarts.
    pub is_paused: bool,
    /// Derived from the install marker in the component directory.
    pub is_installed: bool,
    /// Fingerprint of the dependency file recorded at the last install.
    pub dependency_fingerprint: Option<String>,
}

impl ComponentRecord {
    pub fn new(descriptor: ComponentDescriptor) -> Self {
        Self {
            descriptor,
            is_paused: false,
            is_installed: false,
            dependency_fingerprint: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Installed and not paused: the component can be instantiated.
    pub fn is_ready(&self) -> bool {
        self.is_installed && !self.is_paused
    }
}
