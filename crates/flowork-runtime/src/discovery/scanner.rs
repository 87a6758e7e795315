//! Discovery scanner: builds a kind's registry from its root directories.

use super::cache::DiscoveryCache;
use super::registry::{ComponentRegistry, RegistryDelta};
use crate::component::{ComponentDescriptor, ComponentRecord, KindPolicy};
use crate::config::PathsConfig;
use crate::events::{publish_list_changed, EventBus};
use crate::install::InstallState;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Whether a directory entry name is skipped by discovery.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with("__")
}

/// Immediate, non-hidden component directories below the given roots, in
/// root order. Missing roots are treated as empty.
pub fn component_dirs(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for root in roots {
        if !root.is_dir() {
            debug!("Component root {} does not exist", root.display());
            continue;
        }
        let mut entries: Vec<PathBuf> = WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .filter(|e| !is_hidden(&e.file_name().to_string_lossy()))
            .map(|e| e.into_path())
            .collect();
        entries.sort();
        dirs.extend(entries);
    }
    dirs
}

/// Scans one kind's roots into its registry.
pub struct DiscoveryScanner {
    policy: KindPolicy,
    registry: Arc<ComponentRegistry>,
    events: Arc<dyn EventBus>,
    cache: DiscoveryCache,
    globally_disabled: HashSet<String>,
}

impl DiscoveryScanner {
    pub fn new(
        policy: KindPolicy,
        registry: Arc<ComponentRegistry>,
        events: Arc<dyn EventBus>,
        data_dir: &Path,
        globally_disabled: HashSet<String>,
    ) -> Self {
        let cache = DiscoveryCache::new(policy.kind, data_dir);
        Self {
            policy,
            registry,
            events,
            cache,
            globally_disabled,
        }
    }

    pub fn policy(&self) -> &KindPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Rescan the kind, replace its registry and publish the new count.
    pub fn scan(&self) -> RegistryDelta {
        let descriptors = match self.cache.load_if_fresh(&self.policy.roots) {
            Some(descriptors) => descriptors
                .into_iter()
                .filter(|d| !self.is_disabled(d))
                .collect(),
            None => {
                let descriptors = self.read_descriptors();
                if let Err(e) = self.cache.store(&descriptors) {
                    warn!(kind = %self.policy.kind, "Failed to write discovery cache: {}", e);
                }
                descriptors
            }
        };

        let records = descriptors.into_iter().map(with_install_state).collect();
        let delta = self.registry.replace(records);

        info!(
            kind = %self.policy.kind,
            count = delta.count,
            "Discovered {} {}",
            delta.count,
            self.policy.kind.plural()
        );
        publish_list_changed(self.events.as_ref(), self.policy.kind, delta.count);
        delta
    }

    /// Drop the on-disk cache so the next scan reads every descriptor.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    fn is_disabled(&self, descriptor: &ComponentDescriptor) -> bool {
        self.globally_disabled.contains(&descriptor.id)
            || self.globally_disabled.contains(&descriptor.dir_name)
    }

    /// Full scan: parse every manifest, skipping broken ones.
    fn read_descriptors(&self) -> Vec<ComponentDescriptor> {
        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        let mut descriptors = Vec::new();

        for dir in component_dirs(&self.policy.roots) {
            let dir_name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if self.globally_disabled.contains(&dir_name) {
                debug!(kind = %self.policy.kind, "Skipping globally disabled '{}'", dir_name);
                continue;
            }
            if !dir.join(PathsConfig::MANIFEST_FILENAME).is_file() {
                continue;
            }

            let descriptor = match ComponentDescriptor::load(self.policy.kind, &dir) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!(kind = %self.policy.kind, "Skipping component: {}", e);
                    continue;
                }
            };
            if self.is_disabled(&descriptor) {
                debug!(kind = %self.policy.kind, "Skipping globally disabled '{}'", descriptor.id);
                continue;
            }
            if let Some(first) = seen.get(&descriptor.id) {
                warn!(
                    kind = %self.policy.kind,
                    id = %descriptor.id,
                    "Ignoring {} because {} already provides this id",
                    dir.display(),
                    first.display()
                );
                continue;
            }

            seen.insert(descriptor.id.clone(), dir.clone());
            descriptors.push(descriptor);
        }

        descriptors
    }
}

fn with_install_state(descriptor: ComponentDescriptor) -> ComponentRecord {
    let state = InstallState::new(&descriptor.path);
    let mut record = ComponentRecord::new(descriptor);
    record.is_installed = state.has_marker();
    record.dependency_fingerprint = state.stored_fingerprint();
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;
    use crate::events::BroadcastEventBus;
    use tempfile::TempDir;

    fn write_component(root: &Path, dir: &str, manifest: &str) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("manifest.json"), manifest).unwrap();
    }

    fn scanner(temp_dir: &TempDir, disabled: &[&str]) -> DiscoveryScanner {
        let root = temp_dir.path();
        let data_dir = root.join("data");
        DiscoveryScanner::new(
            KindPolicy::standard(ComponentKind::Plugin, root),
            Arc::new(ComponentRegistry::new(ComponentKind::Plugin, &data_dir)),
            Arc::new(BroadcastEventBus::new()),
            &data_dir,
            disabled.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_missing_roots_are_empty() {
        let temp_dir = TempDir::new().unwrap();
        let delta = scanner(&temp_dir, &[]).scan();
        assert_eq!(delta.count, 0);
    }

    #[test]
    fn test_skips_hidden_disabled_and_broken() {
        let temp_dir = TempDir::new().unwrap();
        let plugins = temp_dir.path().join("plugins");
        write_component(&plugins, "echo", r#"{ "id": "echo", "entry_point": "main.Echo" }"#);
        write_component(&plugins, ".hidden", r#"{ "id": "hidden", "entry_point": "main.H" }"#);
        write_component(&plugins, "__pycache__", r#"{ "id": "pyc", "entry_point": "main.P" }"#);
        write_component(&plugins, "broken", "{ not json");
        write_component(&plugins, "off", r#"{ "id": "off", "entry_point": "main.Off" }"#);
        std::fs::create_dir_all(plugins.join("no_manifest")).unwrap();

        let scanner = scanner(&temp_dir, &["off"]);
        let delta = scanner.scan();
        assert_eq!(delta.added, vec!["echo"]);
        assert_eq!(scanner.registry().count(), 1);
    }

    #[test]
    fn test_first_root_wins() {
        let temp_dir = TempDir::new().unwrap();
        write_component(
            &temp_dir.path().join("plugins"),
            "echo",
            r#"{ "id": "echo", "entry_point": "user.Echo" }"#,
        );
        write_component(
            &temp_dir.path().join("system_plugins"),
            "echo",
            r#"{ "id": "echo", "entry_point": "system.Echo" }"#,
        );
        write_component(
            &temp_dir.path().join("system_plugins"),
            "core",
            r#"{ "id": "core", "entry_point": "main.Core" }"#,
        );

        let scanner = scanner(&temp_dir, &[]);
        scanner.scan();
        let registry = scanner.registry();
        assert_eq!(registry.count(), 2);
        assert_eq!(
            registry.get("echo").unwrap().descriptor.entry_point.module,
            "user"
        );
    }

    #[test]
    fn test_install_state_is_derived_from_markers() {
        let temp_dir = TempDir::new().unwrap();
        let plugins = temp_dir.path().join("plugins");
        write_component(&plugins, "echo", r#"{ "id": "echo", "entry_point": "main.Echo" }"#);
        std::fs::write(plugins.join("echo").join(".installed"), "Installed").unwrap();
        std::fs::write(plugins.join("echo").join(".requirements_hash"), "abc").unwrap();

        let scanner = scanner(&temp_dir, &[]);
        scanner.scan();
        let record = scanner.registry().get("echo").unwrap();
        assert!(record.is_installed);
        assert_eq!(record.dependency_fingerprint.as_deref(), Some("abc"));
    }

    #[cfg(unix)]
    #[test]
    fn test_new_component_dir_invalidates_cache() {
        use std::time::{Duration, SystemTime};

        let temp_dir = TempDir::new().unwrap();
        let plugins = temp_dir.path().join("plugins");
        write_component(&plugins, "a", r#"{ "id": "a", "entry_point": "main.A" }"#);
        let scanner = scanner(&temp_dir, &[]);
        assert_eq!(scanner.scan().added, vec!["a"]);

        let past = SystemTime::now() - Duration::from_secs(60);
        for path in [plugins.join("a").join("manifest.json"), plugins.join("a"), plugins.clone()] {
            std::fs::File::open(&path).unwrap().set_modified(past).unwrap();
        }
        // While fresh, the cache is served without reading manifests.
        let ghost = ComponentDescriptor::parse(
            ComponentKind::Plugin,
            &plugins.join("ghost"),
            r#"{ "id": "ghost", "entry_point": "main.Ghost" }"#,
        )
        .unwrap();
        let a = ComponentDescriptor::load(ComponentKind::Plugin, &plugins.join("a")).unwrap();
        DiscoveryCache::new(ComponentKind::Plugin, &temp_dir.path().join("data"))
            .store(&[a, ghost])
            .unwrap();
        assert_eq!(scanner.scan().added, vec!["ghost"]);

        write_component(&plugins, "b", r#"{ "id": "b", "entry_point": "main.B" }"#);
        let delta = scanner.scan();
        assert_eq!(delta.added, vec!["b"]);
        assert_eq!(delta.removed, vec!["ghost"]);
    }

    #[test]
    fn test_scan_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let plugins = temp_dir.path().join("plugins");
        write_component(&plugins, "a", r#"{ "id": "a", "entry_point": "main.A" }"#);
        write_component(&plugins, "b", r#"{ "id": "b", "entry_point": "main.B" }"#);

        let scanner = scanner(&temp_dir, &[]);
        scanner.scan();
        let first = scanner.registry().list();
        let delta = scanner.scan();
        assert!(delta.is_empty());
        assert_eq!(scanner.registry().list(), first);
    }

    #[tokio::test]
    async fn test_scan_publishes_list_changed() {
        let temp_dir = TempDir::new().unwrap();
        write_component(
            &temp_dir.path().join("plugins"),
            "echo",
            r#"{ "id": "echo", "entry_point": "main.Echo" }"#,
        );
        let data_dir = temp_dir.path().join("data");
        let bus = Arc::new(BroadcastEventBus::new());
        let mut receiver = bus.subscribe();
        let scanner = DiscoveryScanner::new(
            KindPolicy::standard(ComponentKind::Plugin, temp_dir.path()),
            Arc::new(ComponentRegistry::new(ComponentKind::Plugin, &data_dir)),
            bus.clone(),
            &data_dir,
            HashSet::new(),
        );

        scanner.scan();
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.payload["type"], "plugin");
        assert_eq!(event.payload["count"], 1);
    }
}
