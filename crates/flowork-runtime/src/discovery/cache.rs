//! On-disk discovery cache, one file per kind.
//!
//! The cache holds the descriptors of the last full scan. It is fresh while
//! its own modification time is newer than every root directory, every
//! immediate component directory and every manifest below the roots. Adding
//! or removing a component touches its root, so either invalidates the cache.

use crate::component::{ComponentDescriptor, ComponentKind};
use crate::config::PathsConfig;
use crate::error::Result;
use crate::persist::{atomic_read_json, atomic_write_json};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

/// Bumped whenever the cached layout changes.
const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    kind: ComponentKind,
    descriptors: Vec<ComponentDescriptor>,
}

/// Discovery cache of one kind: `<data>/<kind>_index.cache`.
#[derive(Debug, Clone)]
pub struct DiscoveryCache {
    kind: ComponentKind,
    path: PathBuf,
}

impl DiscoveryCache {
    pub fn new(kind: ComponentKind, data_dir: &Path) -> Self {
        Self {
            kind,
            path: data_dir.join(format!("{}_index.cache", kind.as_str())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return cached descriptors if the cache is newer than everything under
    /// `roots`.
    pub fn load_if_fresh(&self, roots: &[PathBuf]) -> Option<Vec<ComponentDescriptor>> {
        let cache_mtime = modified(&self.path)?;
        if let Some(newer) = newest_source(roots) {
            if newer >= cache_mtime {
                debug!(kind = %self.kind, "Discovery cache is stale");
                return None;
            }
        }

        match atomic_read_json::<CacheFile>(&self.path) {
            Ok(Some(file)) if file.version == CACHE_FORMAT_VERSION && file.kind == self.kind => {
                debug!(
                    kind = %self.kind,
                    count = file.descriptors.len(),
                    "Serving discovery from cache"
                );
                Some(file.descriptors)
            }
            Ok(_) => None,
            Err(e) => {
                debug!(kind = %self.kind, "Ignoring unreadable discovery cache: {}", e);
                None
            }
        }
    }

    pub fn store(&self, descriptors: &[ComponentDescriptor]) -> Result<()> {
        let file = CacheFile {
            version: CACHE_FORMAT_VERSION,
            kind: self.kind,
            descriptors: descriptors.to_vec(),
        };
        atomic_write_json(&self.path, &file, false)
    }

    pub fn invalidate(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Newest modification time among the roots, their immediate
/// subdirectories and the manifests inside them.
fn newest_source(roots: &[PathBuf]) -> Option<SystemTime> {
    let mut newest: Option<SystemTime> = None;
    let mut bump = |time: Option<SystemTime>| {
        if let Some(time) = time {
            newest = Some(newest.map_or(time, |n| n.max(time)));
        }
    };

    for root in roots {
        if !root.is_dir() {
            continue;
        }
        bump(modified(root));
        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            bump(entry.metadata().ok().and_then(|m| m.modified().ok()));
            bump(modified(&entry.path().join(PathsConfig::MANIFEST_FILENAME)));
        }
    }
    newest
}
