//! Component kinds and the per-kind policy that replaces four copies of the
//! same manager.

use crate::config::PathsConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The four kinds of installable component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Module,
    Plugin,
    Tool,
    Trigger,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 4] = [
        ComponentKind::Module,
        ComponentKind::Plugin,
        ComponentKind::Tool,
        ComponentKind::Trigger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Module => "module",
            ComponentKind::Plugin => "plugin",
            ComponentKind::Tool => "tool",
            ComponentKind::Trigger => "trigger",
        }
    }

    /// Plural form used for directory names and namespaces.
    pub fn plural(&self) -> &'static str {
        match self {
            ComponentKind::Module => "modules",
            ComponentKind::Plugin => "plugins",
            ComponentKind::Tool => "tools",
            ComponentKind::Trigger => "triggers",
        }
    }

    /// Where this kind installs third-party dependencies.
    pub fn isolation(&self) -> IsolationStrategy {
        match self {
            ComponentKind::Module => IsolationStrategy::Shared,
            ComponentKind::Plugin | ComponentKind::Tool | ComponentKind::Trigger => {
                IsolationStrategy::PerComponent
            }
        }
    }

    /// Manifest fields that may hold the entry point, in priority order.
    pub fn entry_point_fields(&self) -> &'static [&'static str] {
        match self {
            ComponentKind::Trigger => &["listener_entry_point", "entry_point"],
            _ => &["entry_point"],
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().trim_end_matches('s') {
            "module" => Some(ComponentKind::Module),
            "plugin" => Some(ComponentKind::Plugin),
            "tool" => Some(ComponentKind::Tool),
            "trigger" => Some(ComponentKind::Trigger),
            _ => None,
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Target environment for a component's dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationStrategy {
    /// Install into the interpreter the runtime itself uses.
    Shared,
    /// Install into a `.venv` inside the component directory.
    PerComponent,
}

/// Kind-specific policy: where components live and how they are isolated.
#[derive(Debug, Clone)]
pub struct KindPolicy {
    pub kind: ComponentKind,
    /// Root directories scanned in order; the first root wins on duplicate ids.
    pub roots: Vec<PathBuf>,
    pub isolation: IsolationStrategy,
}

impl KindPolicy {
    pub fn new(kind: ComponentKind, roots: Vec<PathBuf>) -> Self {
        Self {
            kind,
            roots,
            isolation: kind.isolation(),
        }
    }

    /// Standard layout below a runtime root directory.
    ///
    /// Plugins additionally scan `system_plugins/`, which ships with the
    /// engine rather than being user-installed.
    pub fn standard(kind: ComponentKind, root: &Path) -> Self {
        let roots = match kind {
            ComponentKind::Module => vec![root.join(PathsConfig::MODULES_DIR_NAME)],
            ComponentKind::Plugin => vec![
                root.join(PathsConfig::PLUGINS_DIR_NAME),
                root.join(PathsConfig::SYSTEM_PLUGINS_DIR_NAME),
            ],
            ComponentKind::Tool => vec![root.join(PathsConfig::TOOLS_DIR_NAME)],
            ComponentKind::Trigger => vec![root.join(PathsConfig::TRIGGERS_DIR_NAME)],
        };
        Self::new(kind, roots)
    }
}
