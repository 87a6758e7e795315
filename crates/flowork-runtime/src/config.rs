//! Centralized configuration for the component runtime.
//!
//! Compile-time constants live in the `*Config` groups below. Values an
//! operator may want to change without rebuilding are loaded from
//! `runtime.json` into [`RuntimeSettings`].

use crate::component::ComponentKind;
use crate::error::Result;
use crate::persist::atomic_read_json;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application-level configuration.
pub struct RuntimeConfig;

impl RuntimeConfig {
    pub const APP_NAME: &'static str = "Flowork";
    pub const DEFAULT_ROOT_DIR_NAME: &'static str = ".flowork";
    pub const SETTINGS_FILENAME: &'static str = "runtime.json";
}

/// Timing of the background dependency reconciler.
pub struct ReconcilerConfig;

impl ReconcilerConfig {
    /// Delay before the first poll so mounted volumes can settle.
    pub const INITIAL_DELAY: Duration = Duration::from_secs(3);
    pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
}

/// Configuration for the package installer.
pub struct InstallConfig;

impl InstallConfig {
    pub const PIP_INSTALL_TIMEOUT: Duration = Duration::from_secs(900);
    pub const VENV_CREATION_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DEFAULT_PYTHON: &'static str = "python3";
    pub const PIP_FLAGS: &'static [&'static str] =
        &["--disable-pip-version-check", "--prefer-binary"];
    /// Max characters of installer output kept in error messages.
    pub const ERROR_OUTPUT_LIMIT: usize = 300;
}

/// Retry and loop defaults used when a node configuration omits them.
pub struct BehaviorConfig;

impl BehaviorConfig {
    pub const DEFAULT_RETRY_ATTEMPTS: u32 = 1;
    pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
    pub const DEFAULT_LOOP_ITERATIONS: u32 = 1;
    /// Upper bound for condition-driven loops without an explicit cap.
    pub const DEFAULT_MAX_CONDITION_ITERATIONS: u32 = 1000;
}

/// Child interpreter hosting Python components.
pub struct BridgeConfig;

impl BridgeConfig {
    /// Prefix of log records the child writes to stderr.
    pub const LOG_PREFIX: &'static str = "@flowork-log ";
    /// How long `on_unload` may take before the child is killed.
    pub const UNLOAD_TIMEOUT: Duration = Duration::from_secs(10);
    /// Stderr lines kept for error messages.
    pub const STDERR_TAIL_LINES: usize = 20;
}

/// File and directory names shared across the runtime.
pub struct PathsConfig;

impl PathsConfig {
    pub const DATA_DIR_NAME: &'static str = "data";
    pub const MODULES_DIR_NAME: &'static str = "modules";
    pub const PLUGINS_DIR_NAME: &'static str = "plugins";
    pub const SYSTEM_PLUGINS_DIR_NAME: &'static str = "system_plugins";
    pub const TOOLS_DIR_NAME: &'static str = "tools";
    pub const TRIGGERS_DIR_NAME: &'static str = "triggers";

    pub const MANIFEST_FILENAME: &'static str = "manifest.json";
    pub const REQUIREMENTS_FILENAME: &'static str = "requirements.txt";
    pub const INSTALL_MARKER_FILENAME: &'static str = ".installed";
    pub const FINGERPRINT_FILENAME: &'static str = ".requirements_hash";
    pub const VENV_DIR_NAME: &'static str = ".venv";
    pub const VENDOR_DIR_NAME: &'static str = "vendor";
    pub const LOOP_PROGRESS_FILENAME: &'static str = "loop_progress.json";
}

/// Operator-tunable settings, persisted as `runtime.json` in the data dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Component ids that are never discovered, whatever their kind.
    pub globally_disabled: HashSet<String>,
    /// Interpreter used for the shared environment and to create venvs.
    pub python: String,
    /// Seconds before the reconciler's first poll.
    pub reconcile_initial_delay_secs: u64,
    /// Seconds between reconciler polls.
    pub reconcile_interval_secs: u64,
    /// Expected dependency lists per kind and component id.
    pub fallback_requirements: BTreeMap<ComponentKind, BTreeMap<String, Vec<String>>>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            globally_disabled: HashSet::new(),
            python: InstallConfig::DEFAULT_PYTHON.to_string(),
            reconcile_initial_delay_secs: ReconcilerConfig::INITIAL_DELAY.as_secs(),
            reconcile_interval_secs: ReconcilerConfig::POLL_INTERVAL.as_secs(),
            fallback_requirements: default_fallback_requirements(),
        }
    }
}

impl RuntimeSettings {
    /// Load settings from a JSON file, falling back to defaults if absent.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(atomic_read_json::<Self>(path)?.unwrap_or_default())
    }

    /// Load `runtime.json` from a data directory.
    pub fn load_from_data_dir(data_dir: &Path) -> Result<Self> {
        Self::load(&data_dir.join(RuntimeConfig::SETTINGS_FILENAME))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.reconcile_initial_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

/// Built-in expected requirements for components known to ship dependencies.
fn default_fallback_requirements() -> BTreeMap<ComponentKind, BTreeMap<String, Vec<String>>> {
    let mut modules = BTreeMap::new();
    modules.insert(
        "golden_moment_clipper".to_string(),
        vec![
            "numpy".to_string(),
            "opencv-python-headless".to_string(),
            "mediapipe".to_string(),
            "faster-whisper".to_string(),
            "protobuf==3.20.3".to_string(),
        ],
    );

    let mut plugins = BTreeMap::new();
    plugins.insert("agent_host".to_string(), Vec::new());
    plugins.insert("metrics_dashboard".to_string(), Vec::new());

    let mut table = BTreeMap::new();
    table.insert(ComponentKind::Module, modules);
    table.insert(ComponentKind::Plugin, plugins);
    table
}

/// Default runtime root: `~/.flowork`.
pub fn default_root() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(RuntimeConfig::DEFAULT_ROOT_DIR_NAME))
}
