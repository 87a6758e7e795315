//! Just-in-time instantiation, caching and pause control.

use super::component::Component;
use super::loader::{ComponentContext, EntryPointRegistry, LoaderContext};
use super::services::{ServiceLocator, ServiceMap};
use crate::component::{ComponentDescriptor, ComponentKind, KindPolicy};
use crate::discovery::{ComponentRegistry, RegistryDelta};
use crate::error::{Result, RuntimeError};
use crate::install::DependencyReconciler;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

struct LoadedInstance {
    descriptor: ComponentDescriptor,
    component: Arc<dyn Component>,
}

/// One slot per `(kind, id)`. Holding the slot's lock while constructing
/// makes construction exactly-once under concurrent callers.
type Slot = Arc<tokio::sync::Mutex<Option<LoadedInstance>>>;

/// Builds component instances on first use and owns them afterwards.
pub struct InstanceManager {
    policies: BTreeMap<ComponentKind, KindPolicy>,
    registries: BTreeMap<ComponentKind, Arc<ComponentRegistry>>,
    reconciler: Arc<DependencyReconciler>,
    entry_points: Arc<EntryPointRegistry>,
    services: Arc<dyn ServiceLocator>,
    python: String,
    slots: Mutex<HashMap<(ComponentKind, String), Slot>>,
}

impl InstanceManager {
    pub fn new(
        policies: Vec<KindPolicy>,
        registries: BTreeMap<ComponentKind, Arc<ComponentRegistry>>,
        reconciler: Arc<DependencyReconciler>,
        entry_points: Arc<EntryPointRegistry>,
        services: Arc<dyn ServiceLocator>,
        python: impl Into<String>,
    ) -> Self {
        Self {
            policies: policies.into_iter().map(|p| (p.kind, p)).collect(),
            registries,
            reconciler,
            entry_points,
            services,
            python: python.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self, kind: ComponentKind, id: &str) -> Result<&Arc<ComponentRegistry>> {
        self.registries
            .get(&kind)
            .ok_or_else(|| RuntimeError::ComponentNotFound {
                kind,
                id: id.to_string(),
            })
    }

    fn slot(&self, kind: ComponentKind, id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry((kind, id.to_string()))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None))),
        )
    }

    fn existing_slot(&self, kind: ComponentKind, id: &str) -> Option<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, id.to_string()))
            .cloned()
    }

    /// Cached or freshly built instance; `None` if unknown, paused or broken.
    pub async fn get_instance(&self, kind: ComponentKind, id: &str) -> Option<Arc<dyn Component>> {
        match self.try_get_instance(kind, id).await {
            Ok(component) => Some(component),
            Err(RuntimeError::ComponentNotFound { .. }) => {
                debug!("{} '{}' is not registered", kind, id);
                None
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Like [`Self::get_instance`] but reports why no instance is available.
    pub async fn try_get_instance(
        &self,
        kind: ComponentKind,
        id: &str,
    ) -> Result<Arc<dyn Component>> {
        let registry = self.registry(kind, id)?;
        let record = registry
            .get(id)
            .ok_or_else(|| RuntimeError::ComponentNotFound {
                kind,
                id: id.to_string(),
            })?;
        let id = record.descriptor.id.clone();
        let instantiation_error = |message: String| RuntimeError::Instantiation {
            kind,
            id: id.clone(),
            message,
        };

        if record.is_paused {
            return Err(instantiation_error("component is paused".to_string()));
        }

        let slot = self.slot(kind, &id);
        let mut guard = slot.lock().await;

        if let Some(loaded) = guard.as_ref() {
            if loaded.descriptor == record.descriptor {
                return Ok(Arc::clone(&loaded.component));
            }
        }
        if let Some(stale) = guard.take() {
            debug!("Descriptor of {} '{}' changed, unloading old instance", kind, id);
            stale.component.on_unload().await;
        }

        self.reconciler
            .ensure_converged(kind, &id)
            .await
            .map_err(|e| instantiation_error(format!("dependencies not converged: {}", e)))?;

        // Pausing may have raced with the install.
        if registry.is_paused(&id) {
            return Err(instantiation_error("component is paused".to_string()));
        }

        let isolation = self
            .policies
            .get(&kind)
            .map(|p| p.isolation)
            .unwrap_or_else(|| kind.isolation());
        let context = ComponentContext {
            loader: LoaderContext::for_descriptor(&record.descriptor, isolation, &self.python),
            services: ServiceMap::resolve(&record.descriptor, self.services.as_ref()),
            descriptor: record.descriptor.clone(),
        };

        let component = self
            .entry_points
            .instantiate(context)
            .map_err(|e| instantiation_error(e.to_string()))?;
        component
            .on_load()
            .await
            .map_err(|e| instantiation_error(format!("on_load failed: {}", e)))?;

        info!("Instantiated {} '{}'", kind, id);
        *guard = Some(LoadedInstance {
            descriptor: record.descriptor,
            component: Arc::clone(&component),
        });
        Ok(component)
    }

    /// Whether an instance is currently cached.
    pub async fn is_cached(&self, kind: ComponentKind, id: &str) -> bool {
        let Some(id) = self.registries.get(&kind).and_then(|r| r.resolve_id(id)) else {
            return false;
        };
        match self.existing_slot(kind, &id) {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Pause or resume a component. Pausing drops its instance.
    pub async fn set_paused(&self, kind: ComponentKind, id: &str, paused: bool) -> Result<()> {
        let registry = self.registry(kind, id)?;
        let canonical = match registry.resolve_id(id) {
            Some(canonical) => canonical,
            // A stale entry left in the pause list can still be resumed.
            None if !paused && registry.is_paused(id) => id.to_string(),
            None => {
                return Err(RuntimeError::ComponentNotFound {
                    kind,
                    id: id.to_string(),
                })
            }
        };
        registry.set_paused(&canonical, paused)?;
        if paused {
            self.evict(kind, &canonical).await;
        }
        info!(
            "{} '{}' {}",
            kind,
            canonical,
            if paused { "paused" } else { "resumed" }
        );
        Ok(())
    }

    /// Drop the cached instance, running its unload hook. Returns whether an
    /// instance was cached.
    pub async fn evict(&self, kind: ComponentKind, id: &str) -> bool {
        let Some(slot) = self.existing_slot(kind, id) else {
            return false;
        };
        let loaded = slot.lock().await.take();
        match loaded {
            Some(loaded) => {
                loaded.component.on_unload().await;
                debug!("Unloaded {} '{}'", kind, id);
                true
            }
            None => false,
        }
    }

    /// Evict instances whose record disappeared or changed in a re-scan.
    pub async fn apply_delta(&self, kind: ComponentKind, delta: &RegistryDelta) {
        for id in delta.removed.iter().chain(delta.changed.iter()) {
            self.evict(kind, id).await;
        }
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &delta.removed {
            slots.remove(&(kind, id.clone()));
        }
    }

    /// Unload every cached instance.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect();
        for ((kind, id), slot) in slots {
            if let Some(loaded) = slot.lock().await.take() {
                loaded.component.on_unload().await;
                debug!("Unloaded {} '{}' on shutdown", kind, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionFailure;
    use crate::install::{FallbackRequirements, InstallRequest, PackageInstaller};
    use crate::instance::component::{ExecutionOutcome, ExecutionRequest};
    use crate::instance::services::StaticServiceLocator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct NoInstall;

    #[async_trait]
    impl PackageInstaller for NoInstall {
        async fn install(&self, request: &InstallRequest) -> Result<()> {
            Err(RuntimeError::install(&request.label, "installs disabled in tests"))
        }
    }

    #[derive(Default)]
    struct Counters {
        built: AtomicUsize,
        loaded: AtomicUsize,
        unloaded: AtomicUsize,
    }

    struct Counted(Arc<Counters>);

    #[async_trait]
    impl Component for Counted {
        async fn on_load(&self) -> Result<()> {
            self.0.loaded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_unload(&self) {
            self.0.unloaded.fetch_add(1, Ordering::SeqCst);
        }

        async fn execute(&self, _request: ExecutionRequest) -> ExecutionOutcome {
            Err(ExecutionFailure::failed("unused"))
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        registry: Arc<ComponentRegistry>,
        manager: InstanceManager,
        counters: Arc<Counters>,
    }

    fn fixture(requirements: Option<&str>) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let dir = root.join("plugins").join("echo");
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = r#"{ "id": "echo", "entry_point": "main.Echo", "requires_services": ["logger"] }"#;
        std::fs::write(dir.join("manifest.json"), manifest).unwrap();
        if let Some(requirements) = requirements {
            std::fs::write(dir.join("requirements.txt"), requirements).unwrap();
        }

        let registry = Arc::new(ComponentRegistry::new(ComponentKind::Plugin, &root.join("data")));
        let mut record = crate::component::ComponentRecord::new(
            ComponentDescriptor::load(ComponentKind::Plugin, &dir).unwrap(),
        );
        record.is_installed = false;
        registry.replace(vec![record]);

        let mut registries = BTreeMap::new();
        registries.insert(ComponentKind::Plugin, Arc::clone(&registry));
        let policies = vec![KindPolicy::standard(ComponentKind::Plugin, root)];
        let reconciler = Arc::new(DependencyReconciler::new(
            policies.clone(),
            registries.clone(),
            Arc::new(NoInstall),
            FallbackRequirements::default(),
        ));

        let counters = Arc::new(Counters::default());
        let entry_points = Arc::new(EntryPointRegistry::new());
        {
            let counters = Arc::clone(&counters);
            entry_points.register("main.Echo", move |context: ComponentContext| {
                assert!(context.services.logger().is_some());
                counters.built.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Counted(Arc::clone(&counters))) as Arc<dyn Component>)
            });
        }

        let manager = InstanceManager::new(
            policies,
            registries,
            reconciler,
            entry_points,
            Arc::new(StaticServiceLocator::new()),
            "python3",
        );

        Fixture {
            _temp_dir: temp_dir,
            registry,
            manager,
            counters,
        }
    }

    fn dir_of(fixture: &Fixture) -> std::path::PathBuf {
        fixture.registry.descriptor("echo").unwrap().path
    }

    #[tokio::test]
    async fn test_instance_is_cached_and_dependencies_converged() {
        let fixture = fixture(None);
        let first = fixture.manager.get_instance(ComponentKind::Plugin, "echo").await;
        let second = fixture.manager.get_instance(ComponentKind::Plugin, "echo").await;

        assert!(first.is_some());
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert_eq!(fixture.counters.built.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.counters.loaded.load(Ordering::SeqCst), 1);
        assert!(dir_of(&fixture).join(".installed").exists());
        assert!(fixture.registry.get("echo").unwrap().is_installed);
    }

    #[tokio::test]
    async fn test_unknown_component_yields_none() {
        let fixture = fixture(None);
        assert!(fixture
            .manager
            .get_instance(ComponentKind::Plugin, "ghost")
            .await
            .is_none());
        assert!(fixture
            .manager
            .get_instance(ComponentKind::Tool, "echo")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_convergence_aborts_instantiation() {
        let fixture = fixture(Some("requests\n"));
        let err = fixture
            .manager
            .try_get_instance(ComponentKind::Plugin, "echo")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("dependencies not converged"));
        assert_eq!(fixture.counters.built.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pause_unloads_once_and_blocks() {
        let fixture = fixture(None);
        fixture
            .manager
            .get_instance(ComponentKind::Plugin, "echo")
            .await
            .unwrap();

        fixture
            .manager
            .set_paused(ComponentKind::Plugin, "echo", true)
            .await
            .unwrap();
        fixture
            .manager
            .set_paused(ComponentKind::Plugin, "echo", true)
            .await
            .unwrap();

        assert_eq!(fixture.counters.unloaded.load(Ordering::SeqCst), 1);
        assert!(!fixture.manager.is_cached(ComponentKind::Plugin, "echo").await);
        assert!(fixture
            .manager
            .get_instance(ComponentKind::Plugin, "echo")
            .await
            .is_none());

        fixture
            .manager
            .set_paused(ComponentKind::Plugin, "echo", false)
            .await
            .unwrap();
        assert!(fixture
            .manager
            .get_instance(ComponentKind::Plugin, "echo")
            .await
            .is_some());
        assert_eq!(fixture.counters.built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pausing_unknown_component_is_rejected() {
        let fixture = fixture(None);
        let err = fixture
            .manager
            .set_paused(ComponentKind::Plugin, "ghost", true)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ComponentNotFound { .. }));
        assert!(fixture.registry.paused_ids().is_empty());

        assert!(fixture
            .manager
            .set_paused(ComponentKind::Plugin, "ghost", false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stale_pause_entry_can_be_resumed() {
        let fixture = fixture(None);
        fixture.registry.set_paused("gone", true).unwrap();

        fixture
            .manager
            .set_paused(ComponentKind::Plugin, "gone", false)
            .await
            .unwrap();
        assert!(fixture.registry.paused_ids().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_instance_constructs_once() {
        let fixture = Arc::new(fixture(None));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let fixture = Arc::clone(&fixture);
            handles.push(tokio::spawn(async move {
                fixture
                    .manager
                    .get_instance(ComponentKind::Plugin, "echo")
                    .await
                    .is_some()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(fixture.counters.built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delta_evicts_changed_instances() {
        let fixture = fixture(None);
        fixture
            .manager
            .get_instance(ComponentKind::Plugin, "echo")
            .await
            .unwrap();

        let delta = RegistryDelta {
            removed: vec!["echo".to_string()],
            ..RegistryDelta::default()
        };
        fixture.manager.apply_delta(ComponentKind::Plugin, &delta).await;
        assert_eq!(fixture.counters.unloaded.load(Ordering::SeqCst), 1);

        fixture.manager.shutdown().await;
        assert_eq!(fixture.counters.unloaded.load(Ordering::SeqCst), 1);
    }
}
