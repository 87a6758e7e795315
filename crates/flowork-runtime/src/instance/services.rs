//! Collaborators injected into component instances.
//!
//! A descriptor lists the aliases it needs in `requires_services`. A few
//! aliases are reserved and resolved by the runtime itself; the rest go to
//! the embedder's [`ServiceLocator`]. Unknown aliases are left out of the map.

use crate::component::ComponentDescriptor;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// A type-erased collaborator.
pub type Service = Arc<dyn Any + Send + Sync>;

/// Alias of the engine handle.
pub const KERNEL_ALIAS: &str = "kernel";
/// Alias of the per-component logger.
pub const LOGGER_ALIAS: &str = "logger";
/// Both aliases resolve the localization service.
pub const LOCALIZATION_ALIASES: [&str; 2] = ["localization", "loc"];
/// Locator name the localization aliases map to.
pub const LOCALIZATION_SERVICE: &str = "localization_manager";

/// Resolves collaborators by name.
pub trait ServiceLocator: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Service>;
}

/// Locator backed by a map filled by the embedder.
#[derive(Default)]
pub struct StaticServiceLocator {
    services: RwLock<HashMap<String, Service>>,
}

impl StaticServiceLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Any + Send + Sync>(&self, name: impl Into<String>, service: T) {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(service));
    }
}

impl ServiceLocator for StaticServiceLocator {
    fn resolve(&self, name: &str) -> Option<Service> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// Severity accepted by [`ComponentLogger::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" | "DETAIL" => LogLevel::Debug,
            "WARN" | "WARNING" => LogLevel::Warn,
            "ERROR" | "CRITICAL" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Logger handed to components under the `logger` alias.
pub trait ComponentLogger: Send + Sync {
    fn write(&self, message: &str, level: LogLevel);
}

/// Logger that forwards to `tracing`, tagged with the component id.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    source: String,
}

impl TracingLogger {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl ComponentLogger for TracingLogger {
    fn write(&self, message: &str, level: LogLevel) {
        let source = self.source.as_str();
        match level {
            LogLevel::Debug => debug!(component = source, "{}", message),
            LogLevel::Info => info!(component = source, "{}", message),
            LogLevel::Warn => warn!(component = source, "{}", message),
            LogLevel::Error => error!(component = source, "{}", message),
        }
    }
}

/// Collaborators resolved for one instance, keyed by alias.
#[derive(Clone, Default)]
pub struct ServiceMap {
    services: HashMap<String, Service>,
}

impl std::fmt::Debug for ServiceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut aliases: Vec<_> = self.services.keys().collect();
        aliases.sort();
        f.debug_struct("ServiceMap").field("aliases", &aliases).finish()
    }
}

impl ServiceMap {
    /// Resolve every alias a descriptor asks for.
    pub fn resolve(descriptor: &ComponentDescriptor, locator: &dyn ServiceLocator) -> Self {
        let mut services = HashMap::new();
        for alias in &descriptor.required_services {
            let service: Option<Service> = match alias.as_str() {
                LOGGER_ALIAS => {
                    let logger: Arc<dyn ComponentLogger> =
                        Arc::new(TracingLogger::new(descriptor.id.clone()));
                    Some(Arc::new(logger))
                }
                KERNEL_ALIAS => locator.resolve(KERNEL_ALIAS),
                a if LOCALIZATION_ALIASES.contains(&a) => locator.resolve(LOCALIZATION_SERVICE),
                other => locator.resolve(other),
            };

            match service {
                Some(service) => {
                    services.insert(alias.clone(), service);
                }
                None => debug!(
                    component = %descriptor.id,
                    alias = %alias,
                    "Requested service is unavailable, omitting it"
                ),
            }
        }
        Self { services }
    }

    pub fn insert(&mut self, alias: impl Into<String>, service: Service) {
        self.services.insert(alias.into(), service);
    }

    /// Typed access to a collaborator.
    pub fn get<T: Any + Send + Sync>(&self, alias: &str) -> Option<Arc<T>> {
        self.services
            .get(alias)
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    /// Resolved aliases, sorted.
    pub fn aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = self.services.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        aliases
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.services.contains_key(alias)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// The injected logger, if the component asked for one.
    pub fn logger(&self) -> Option<Arc<dyn ComponentLogger>> {
        self.get::<Arc<dyn ComponentLogger>>(LOGGER_ALIAS)
            .map(|logger| Arc::clone(&*logger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;
    use std::path::Path;

    #[derive(Debug, PartialEq)]
    struct Kernel(&'static str);

    #[derive(Debug, PartialEq)]
    struct Localization;

    fn descriptor(services: &str) -> ComponentDescriptor {
        ComponentDescriptor::parse(
            ComponentKind::Module,
            Path::new("/srv/flowork/modules/echo"),
            &format!(
                r#"{{ "id": "echo", "entry_point": "main.Echo", "requires_services": {} }}"#,
                services
            ),
        )
        .unwrap()
    }

    #[test]
    fn test_reserved_and_unknown_aliases() {
        let locator = StaticServiceLocator::new();
        locator.register("kernel", Kernel("main"));
        locator.register("localization_manager", Localization);

        let map = ServiceMap::resolve(
            &descriptor(r#"["logger", "kernel", "loc", "dataset_manager"]"#),
            &locator,
        );

        assert_eq!(map.len(), 3);
        assert_eq!(map.aliases(), vec!["kernel", "loc", "logger"]);
        assert_eq!(*map.get::<Kernel>("kernel").unwrap(), Kernel("main"));
        assert!(map.get::<Localization>("loc").is_some());
        assert!(!map.contains("dataset_manager"));
        assert!(map.logger().is_some());
        // Wrong type yields None rather than panicking
        assert!(map.get::<Localization>("kernel").is_none());
    }

    #[test]
    fn test_locator_services() {
        let locator = StaticServiceLocator::new();
        locator.register("dataset_manager", 42u32);
        let map = ServiceMap::resolve(&descriptor(r#"["dataset_manager"]"#), &locator);
        assert_eq!(*map.get::<u32>("dataset_manager").unwrap(), 42);
        assert!(map.logger().is_none());
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from_str("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("SUCCESS"), LogLevel::Info);
        assert_eq!(LogLevel::from_str("critical"), LogLevel::Error);
    }
}
