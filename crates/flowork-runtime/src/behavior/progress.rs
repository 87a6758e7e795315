//! Loop progress store.

use crate::config::PathsConfig;
use crate::error::Result;
use crate::persist::{atomic_read_json, atomic_write_json};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Key under which a loop records its completed iteration count.
pub fn progress_key(context_id: &str, node_or_component_id: &str) -> String {
    format!("loop_progress::{}::{}", context_id, node_or_component_id)
}

/// Small key-value store for loop progress.
pub trait ProgressStore: Send + Sync {
    fn load(&self, key: &str) -> Option<u32>;
    fn save(&self, key: &str, completed: u32) -> Result<()>;
    fn clear(&self, key: &str) -> Result<()>;
}

/// Process-local store; progress is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    entries: Mutex<HashMap<String, u32>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn load(&self, key: &str) -> Option<u32> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    fn save(&self, key: &str, completed: u32) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), completed);
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Store persisted as one JSON object in the data directory.
#[derive(Debug)]
pub struct JsonProgressStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, u32>>,
}

impl JsonProgressStore {
    /// Open `<data_dir>/loop_progress.json`. An unreadable file starts empty.
    pub fn open(data_dir: &Path) -> Self {
        let path = data_dir.join(PathsConfig::LOOP_PROGRESS_FILENAME);
        let entries = match atomic_read_json::<BTreeMap<String, serde_json::Value>>(&path) {
            Ok(Some(raw)) => raw
                .into_iter()
                .filter_map(|(key, value)| {
                    let completed = value.as_u64().and_then(|n| u32::try_from(n).ok())?;
                    Some((key, completed))
                })
                .collect(),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!("Ignoring unreadable loop progress file: {}", e);
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, u32>) -> bool,
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if f(&mut entries) {
            atomic_write_json(&self.path, &*entries, false)?;
        }
        Ok(())
    }
}

impl ProgressStore for JsonProgressStore {
    fn load(&self, key: &str) -> Option<u32> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    fn save(&self, key: &str, completed: u32) -> Result<()> {
        self.update(|entries| entries.insert(key.to_string(), completed) != Some(completed))
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.update(|entries| entries.remove(key).is_some())
    }
}
