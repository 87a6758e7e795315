//! Component discovery: per-kind registries, the scanner that fills them and
//! the staleness-checked discovery cache.

mod cache;
mod registry;
mod scanner;

pub use cache::DiscoveryCache;
pub use registry::{ComponentRegistry, RegistryDelta};
pub use scanner::{component_dirs, is_hidden, DiscoveryScanner};
