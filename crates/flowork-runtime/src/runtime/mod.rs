//! The component runtime facade.
//!
//! Owns one registry and scanner per kind, the dependency reconciler and its
//! background task, the instance manager and the behavior chain. This is the
//! single entry point for the workflow executor and the CLI.

mod builder;

pub use builder::ComponentRuntimeBuilder;

use crate::behavior::{BehaviorChain, ProgressStore};
use crate::cancel::CancellationToken;
use crate::component::{ComponentKind, ComponentRecord};
use crate::config::RuntimeSettings;
use crate::discovery::{ComponentRegistry, DiscoveryScanner, RegistryDelta};
use crate::error::{ExecutionFailure, Result, RuntimeError};
use crate::events::{publish_list_changed, EventBus};
use crate::install::{DependencyReconciler, InstallCallback, PollReport};
use crate::instance::{
    execute_fn, Component, EntryPointRegistry, ExecuteFn, ExecutionOutcome, ExecutionRequest,
    InstanceManager,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Main entry point of the component runtime.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ComponentRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    root: PathBuf,
    data_dir: PathBuf,
    settings: RuntimeSettings,
    scanners: BTreeMap<ComponentKind, DiscoveryScanner>,
    registries: BTreeMap<ComponentKind, Arc<ComponentRegistry>>,
    reconciler: Arc<DependencyReconciler>,
    instances: InstanceManager,
    behaviors: BehaviorChain,
    entry_points: Arc<EntryPointRegistry>,
    events: Arc<dyn EventBus>,
    shutdown: CancellationToken,
    reload_rx: Mutex<Option<mpsc::UnboundedReceiver<ComponentKind>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ComponentRuntime {
    /// Create a builder for ComponentRuntime.
    pub fn builder(root: impl Into<PathBuf>) -> ComponentRuntimeBuilder {
        ComponentRuntimeBuilder::new(root)
    }

    /// Runtime with default collaborators, creating missing directories.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(root).auto_create_dirs(true).build()
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.inner.settings
    }

    pub fn events(&self) -> &Arc<dyn EventBus> {
        &self.inner.events
    }

    pub fn entry_points(&self) -> &Arc<EntryPointRegistry> {
        &self.inner.entry_points
    }

    pub fn progress_store(&self) -> &Arc<dyn ProgressStore> {
        self.inner.behaviors.progress()
    }

    pub fn reconciler(&self) -> &Arc<DependencyReconciler> {
        &self.inner.reconciler
    }

    pub fn registry(&self, kind: ComponentKind) -> Option<&Arc<ComponentRegistry>> {
        self.inner.registries.get(&kind)
    }

    fn registry_or_err(&self, kind: ComponentKind, id: &str) -> Result<&Arc<ComponentRegistry>> {
        self.registry(kind).ok_or_else(|| RuntimeError::ComponentNotFound {
            kind,
            id: id.to_string(),
        })
    }

    // ========================================
    // Discovery
    // ========================================

    /// Re-discover one kind and drop instances whose record went away or
    /// changed.
    pub async fn scan(&self, kind: ComponentKind) -> RegistryDelta {
        let Some(scanner) = self.inner.scanners.get(&kind) else {
            return RegistryDelta::default();
        };
        let delta = scanner.scan();
        self.inner.instances.apply_delta(kind, &delta).await;
        delta
    }

    pub async fn scan_all(&self) -> BTreeMap<ComponentKind, RegistryDelta> {
        let mut deltas = BTreeMap::new();
        for kind in ComponentKind::ALL {
            deltas.insert(kind, self.scan(kind).await);
        }
        deltas
    }

    /// Drop the on-disk discovery cache of a kind and scan it again.
    pub async fn reload(&self, kind: ComponentKind) -> RegistryDelta {
        if let Some(scanner) = self.inner.scanners.get(&kind) {
            scanner.invalidate_cache();
        }
        self.scan(kind).await
    }

    /// Snapshot of a kind's records, sorted by id.
    pub fn list(&self, kind: ComponentKind) -> Vec<ComponentRecord> {
        self.registry(kind).map(|r| r.list()).unwrap_or_default()
    }

    pub fn get(&self, kind: ComponentKind, id: &str) -> Option<ComponentRecord> {
        self.registry(kind).and_then(|r| r.get(id))
    }

    // ========================================
    // Background tasks
    // ========================================

    /// Start the reconciler poll loop and the reload listener.
    ///
    /// Must be called from within a tokio runtime. Calling it twice is an
    /// error.
    pub fn start_background(&self) -> Result<()> {
        let reload_rx = self
            .inner
            .reload_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| RuntimeError::Other("background tasks already started".to_string()))?;

        let settings = &self.inner.settings;
        let reconciler_task = Arc::clone(&self.inner.reconciler).spawn(
            settings.initial_delay(),
            settings.poll_interval(),
            self.inner.shutdown.child_token(),
        );
        let reload_task = self.spawn_reload_listener(reload_rx);

        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([reconciler_task, reload_task]);
        Ok(())
    }

    fn spawn_reload_listener(
        &self,
        mut reload_rx: mpsc::UnboundedReceiver<ComponentKind>,
    ) -> JoinHandle<()> {
        let runtime = self.clone();
        let shutdown = self.inner.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    kind = reload_rx.recv() => match kind {
                        Some(kind) => kind,
                        None => break,
                    },
                };

                // Coalesce a burst of requests into one scan per kind.
                let mut kinds = BTreeSet::from([first]);
                while let Ok(kind) = reload_rx.try_recv() {
                    kinds.insert(kind);
                }
                for kind in kinds {
                    let delta = runtime.reload(kind).await;
                    debug!(kind = %kind, count = delta.count, "Reloaded after installation");
                }
            }
            debug!("Reload listener stopped");
        })
    }

    /// Stop background tasks and unload every instance.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.inner.instances.shutdown().await;
        info!("Component runtime shut down");
    }

    // ========================================
    // Instances and execution
    // ========================================

    /// Cached or freshly built instance; `None` when unavailable.
    pub async fn get_instance(&self, kind: ComponentKind, id: &str) -> Option<Arc<dyn Component>> {
        self.inner.instances.get_instance(kind, id).await
    }

    pub async fn try_get_instance(
        &self,
        kind: ComponentKind,
        id: &str,
    ) -> Result<Arc<dyn Component>> {
        self.inner.instances.try_get_instance(kind, id).await
    }

    pub async fn is_instantiated(&self, kind: ComponentKind, id: &str) -> bool {
        self.inner.instances.is_cached(kind, id).await
    }

    /// The instance's entry point wrapped with its declared behaviors.
    pub async fn decorated(&self, kind: ComponentKind, id: &str) -> Result<ExecuteFn> {
        let descriptor = self
            .registry_or_err(kind, id)?
            .descriptor(id)
            .ok_or_else(|| RuntimeError::ComponentNotFound {
                kind,
                id: id.to_string(),
            })?;
        let component = self.try_get_instance(kind, id).await?;
        Ok(self.inner.behaviors.wrap(&descriptor, execute_fn(component)))
    }

    /// Run a component once through its behavior chain.
    pub async fn execute(
        &self,
        kind: ComponentKind,
        id: &str,
        request: ExecutionRequest,
    ) -> ExecutionOutcome {
        let execute = self
            .decorated(kind, id)
            .await
            .map_err(|e| ExecutionFailure::failed(e.to_string()))?;
        execute(request).await
    }

    // ========================================
    // Lifecycle
    // ========================================

    pub async fn pause(&self, kind: ComponentKind, id: &str) -> Result<()> {
        self.inner.instances.set_paused(kind, id, true).await
    }

    pub async fn resume(&self, kind: ComponentKind, id: &str) -> Result<()> {
        self.inner.instances.set_paused(kind, id, false).await
    }

    /// Force installation of a component's dependencies now.
    ///
    /// A live instance is unloaded on success so the next use picks up the
    /// new packages.
    pub async fn install_component(
        &self,
        kind: ComponentKind,
        id: &str,
        callback: Option<InstallCallback>,
    ) -> Result<()> {
        self.inner
            .reconciler
            .install_component(kind, id, callback)
            .await?;
        if let Some(canonical) = self.registry(kind).and_then(|r| r.resolve_id(id)) {
            self.inner.instances.evict(kind, &canonical).await;
        }
        Ok(())
    }

    /// Remove the installed dependencies of a component.
    pub async fn uninstall_dependencies(&self, kind: ComponentKind, id: &str) -> Result<()> {
        let canonical = self
            .registry_or_err(kind, id)?
            .resolve_id(id)
            .unwrap_or_else(|| id.to_string());
        self.inner.instances.evict(kind, &canonical).await;
        self.inner
            .reconciler
            .uninstall_dependencies(kind, &canonical)
            .await
    }

    /// Delete a component from disk and from the registry.
    pub async fn uninstall_component(&self, kind: ComponentKind, id: &str) -> Result<()> {
        let registry = self.registry_or_err(kind, id)?;
        let descriptor = registry
            .descriptor(id)
            .ok_or_else(|| RuntimeError::ComponentNotFound {
                kind,
                id: id.to_string(),
            })?;

        let roots = self
            .inner
            .scanners
            .get(&kind)
            .map(|s| s.policy().roots.clone())
            .unwrap_or_default();
        if !builder::is_under_roots(&descriptor.path, &roots) {
            return Err(RuntimeError::Config {
                message: format!(
                    "Refusing to delete {} outside the {} roots",
                    descriptor.path.display(),
                    kind.plural()
                ),
            });
        }

        self.inner.instances.evict(kind, &descriptor.id).await;
        tokio::fs::remove_dir_all(&descriptor.path)
            .await
            .map_err(|e| RuntimeError::Io {
                message: format!("Failed to delete {}", descriptor.path.display()),
                path: Some(descriptor.path.clone()),
                source: Some(e),
            })?;
        registry.remove(&descriptor.id);
        if let Some(scanner) = self.inner.scanners.get(&kind) {
            scanner.invalidate_cache();
        }
        publish_list_changed(self.inner.events.as_ref(), kind, registry.count());
        info!("Uninstalled {} '{}'", kind, descriptor.id);
        Ok(())
    }

    /// Run one reconciler pass over every kind now.
    pub async fn reconcile_once(&self) -> PollReport {
        self.inner.reconciler.poll_once().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::MemoryProgressStore;
    use crate::install::{InstallRequest, PackageInstaller};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingInstaller {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PackageInstaller for RecordingInstaller {
        async fn install(&self, _request: &InstallRequest) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Echo;

    #[async_trait]
    impl Component for Echo {
        async fn execute(&self, request: ExecutionRequest) -> ExecutionOutcome {
            Ok(request.payload)
        }
    }

    fn write_component(root: &Path, kind_dir: &str, id: &str, extra: &str) -> PathBuf {
        let dir = root.join(kind_dir).join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            format!(r#"{{ "id": "{}", "entry_point": "main.Echo" {} }}"#, id, extra),
        )
        .unwrap();
        dir
    }

    fn runtime(temp_dir: &TempDir, installer: Arc<RecordingInstaller>) -> ComponentRuntime {
        let entry_points = Arc::new(EntryPointRegistry::new().with_python_bridge(false));
        entry_points.register("main.Echo", |_context| Ok(Arc::new(Echo) as Arc<dyn Component>));
        ComponentRuntime::builder(temp_dir.path())
            .auto_create_dirs(true)
            .settings(RuntimeSettings::default())
            .installer(installer)
            .progress_store(Arc::new(MemoryProgressStore::new()))
            .entry_points(entry_points)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_scans_and_executes() {
        let temp_dir = TempDir::new().unwrap();
        write_component(temp_dir.path(), "plugins", "echo", "");
        let runtime = runtime(&temp_dir, Arc::default());

        assert_eq!(runtime.list(ComponentKind::Plugin).len(), 1);
        let out = runtime
            .execute(
                ComponentKind::Plugin,
                "echo",
                ExecutionRequest::new(json!({ "text": "hi" })),
            )
            .await
            .unwrap();
        assert_eq!(out, json!({ "text": "hi" }));
        assert!(runtime.is_instantiated(ComponentKind::Plugin, "echo").await);
    }

    #[tokio::test]
    async fn test_execute_unknown_component_fails() {
        let temp_dir = TempDir::new().unwrap();
        let runtime = runtime(&temp_dir, Arc::default());
        let failure = runtime
            .execute(ComponentKind::Tool, "ghost", ExecutionRequest::new(json!(null)))
            .await
            .unwrap_err();
        assert!(failure.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_rescan_evicts_removed_component() {
        let temp_dir = TempDir::new().unwrap();
        let dir = write_component(temp_dir.path(), "tools", "echo", "");
        let runtime = runtime(&temp_dir, Arc::default());
        runtime.get_instance(ComponentKind::Tool, "echo").await.unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
        let delta = runtime.reload(ComponentKind::Tool).await;
        assert_eq!(delta.removed, vec!["echo".to_string()]);
        assert!(!runtime.is_instantiated(ComponentKind::Tool, "echo").await);
    }

    #[tokio::test]
    async fn test_manual_install_forces_and_uninstall_clears() {
        let temp_dir = TempDir::new().unwrap();
        let dir = write_component(temp_dir.path(), "plugins", "echo", "");
        std::fs::write(dir.join("requirements.txt"), "requests\n").unwrap();
        let installer = Arc::new(RecordingInstaller::default());
        let runtime = runtime(&temp_dir, Arc::clone(&installer));

        runtime.reconcile_once().await;
        runtime
            .install_component(ComponentKind::Plugin, "echo", None)
            .await
            .unwrap();
        assert_eq!(installer.calls.load(Ordering::SeqCst), 2);
        assert!(runtime.get(ComponentKind::Plugin, "echo").unwrap().is_installed);

        runtime
            .uninstall_dependencies(ComponentKind::Plugin, "echo")
            .await
            .unwrap();
        assert!(!dir.join(".installed").exists());
        assert!(!runtime.get(ComponentKind::Plugin, "echo").unwrap().is_installed);
    }

    #[tokio::test]
    async fn test_uninstall_component_deletes_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dir = write_component(temp_dir.path(), "triggers", "cron", "");
        let runtime = runtime(&temp_dir, Arc::default());

        runtime
            .uninstall_component(ComponentKind::Trigger, "cron")
            .await
            .unwrap();
        assert!(!dir.exists());
        assert!(runtime.get(ComponentKind::Trigger, "cron").is_none());
        assert!(runtime.scan(ComponentKind::Trigger).await.is_empty());
    }

    #[tokio::test]
    async fn test_background_reload_after_install() {
        let temp_dir = TempDir::new().unwrap();
        let dir = write_component(temp_dir.path(), "modules", "echo", "");
        std::fs::write(dir.join("requirements.txt"), "numpy\n").unwrap();
        let runtime = runtime(&temp_dir, Arc::default());
        assert!(!runtime.get(ComponentKind::Module, "echo").unwrap().is_installed);

        runtime.start_background().unwrap();
        assert!(runtime.start_background().is_err());
        runtime
            .install_component(ComponentKind::Module, "echo", None)
            .await
            .unwrap();
        runtime.shutdown().await;

        assert!(runtime.get(ComponentKind::Module, "echo").unwrap().is_installed);
    }
}
