//! Builder for configuring ComponentRuntime initialization.

use super::{ComponentRuntime, RuntimeInner};
use crate::behavior::{BehaviorChain, JsonProgressStore, ProgressStore};
use crate::cancel::CancellationToken;
use crate::component::{ComponentKind, KindPolicy};
use crate::config::{PathsConfig, RuntimeSettings};
use crate::discovery::{ComponentRegistry, DiscoveryScanner};
use crate::error::{Result, RuntimeError};
use crate::events::{BroadcastEventBus, EventBus};
use crate::install::{DependencyReconciler, FallbackRequirements, PackageInstaller, PipInstaller};
use crate::instance::{EntryPointRegistry, InstanceManager, ServiceLocator, StaticServiceLocator};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::info;

/// Builder for configuring ComponentRuntime initialization.
///
/// # Example
///
/// ```rust,ignore
/// use flowork_runtime::ComponentRuntime;
///
/// let runtime = ComponentRuntime::builder("/srv/flowork")
///     .auto_create_dirs(true)
///     .build()?;
/// runtime.start_background()?;
/// ```
pub struct ComponentRuntimeBuilder {
    root: PathBuf,
    data_dir: Option<PathBuf>,
    auto_create_dirs: bool,
    initial_scan: bool,
    settings: Option<RuntimeSettings>,
    installer: Option<Arc<dyn PackageInstaller>>,
    services: Option<Arc<dyn ServiceLocator>>,
    progress: Option<Arc<dyn ProgressStore>>,
    events: Option<Arc<dyn EventBus>>,
    entry_points: Option<Arc<EntryPointRegistry>>,
}

impl ComponentRuntimeBuilder {
    /// Create a new builder for the given runtime root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            data_dir: None,
            auto_create_dirs: false,
            initial_scan: true,
            settings: None,
            installer: None,
            services: None,
            progress: None,
            events: None,
            entry_points: None,
        }
    }

    /// Auto-create the root, the data directory and every kind root.
    ///
    /// Default: `false` (the root must exist)
    pub fn auto_create_dirs(mut self, enable: bool) -> Self {
        self.auto_create_dirs = enable;
        self
    }

    /// Where pause lists, caches, settings and loop progress live.
    ///
    /// Default: `<root>/data`
    pub fn data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    /// Scan every kind while building.
    ///
    /// Default: `true`
    pub fn initial_scan(mut self, enable: bool) -> Self {
        self.initial_scan = enable;
        self
    }

    /// Use these settings instead of reading `runtime.json`.
    pub fn settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn services(mut self, services: Arc<dyn ServiceLocator>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn progress_store(mut self, progress: Arc<dyn ProgressStore>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn event_bus(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Entry point factories for in-process components. Disable the Python
    /// bridge on the registry itself to run factories only.
    pub fn entry_points(mut self, entry_points: Arc<EntryPointRegistry>) -> Self {
        self.entry_points = Some(entry_points);
        self
    }

    fn create_directory_structure(dirs: &[PathBuf]) -> Result<()> {
        for dir in dirs {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|e| RuntimeError::Io {
                    message: format!("Failed to create directory: {}", dir.display()),
                    path: Some(dir.clone()),
                    source: Some(e),
                })?;
            }
        }
        Ok(())
    }

    /// Build the ComponentRuntime instance.
    pub fn build(self) -> Result<ComponentRuntime> {
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(|| self.root.join(PathsConfig::DATA_DIR_NAME));
        let policies: Vec<KindPolicy> = ComponentKind::ALL
            .iter()
            .map(|kind| KindPolicy::standard(*kind, &self.root))
            .collect();

        if self.auto_create_dirs {
            let mut dirs = vec![self.root.clone(), data_dir.clone()];
            dirs.extend(policies.iter().flat_map(|p| p.roots.iter().cloned()));
            Self::create_directory_structure(&dirs)?;
        } else if !self.root.exists() {
            return Err(RuntimeError::Config {
                message: format!("Runtime root does not exist: {}", self.root.display()),
            });
        }

        let settings = match self.settings {
            Some(settings) => settings,
            None => RuntimeSettings::load_from_data_dir(&data_dir)?,
        };

        let events = self
            .events
            .unwrap_or_else(|| Arc::new(BroadcastEventBus::new()));
        let installer = self
            .installer
            .unwrap_or_else(|| Arc::new(PipInstaller::new(settings.python.clone())));
        let services = self
            .services
            .unwrap_or_else(|| Arc::new(StaticServiceLocator::new()));
        let progress = match self.progress {
            Some(progress) => progress,
            None => Arc::new(JsonProgressStore::open(&data_dir)),
        };
        let entry_points = self
            .entry_points
            .unwrap_or_else(|| Arc::new(EntryPointRegistry::new()));

        let mut registries = BTreeMap::new();
        let mut scanners = BTreeMap::new();
        for policy in &policies {
            let registry = Arc::new(ComponentRegistry::new(policy.kind, &data_dir));
            scanners.insert(
                policy.kind,
                DiscoveryScanner::new(
                    policy.clone(),
                    Arc::clone(&registry),
                    Arc::clone(&events),
                    &data_dir,
                    settings.globally_disabled.clone(),
                ),
            );
            registries.insert(policy.kind, registry);
        }

        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let reconciler = Arc::new(
            DependencyReconciler::new(
                policies.clone(),
                registries.clone(),
                installer,
                FallbackRequirements::new(settings.fallback_requirements.clone()),
            )
            .with_globally_disabled(settings.globally_disabled.clone())
            .with_reload_channel(reload_tx),
        );

        let instances = InstanceManager::new(
            policies,
            registries.clone(),
            Arc::clone(&reconciler),
            Arc::clone(&entry_points),
            services,
            settings.python.clone(),
        );

        if self.initial_scan {
            for scanner in scanners.values() {
                scanner.scan();
            }
        }

        info!("Component runtime initialized at {}", self.root.display());

        Ok(ComponentRuntime {
            inner: Arc::new(RuntimeInner {
                root: self.root,
                data_dir,
                settings,
                scanners,
                registries,
                reconciler,
                instances,
                behaviors: BehaviorChain::new(progress),
                entry_points,
                events,
                shutdown: CancellationToken::new(),
                reload_rx: Mutex::new(Some(reload_rx)),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// Whether `path` is inside one of `roots`.
pub(super) fn is_under_roots(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root) && path != root)
}
