//! In-memory registry of discovered components, one per kind.
//!
//! Readers always get cloned snapshots. A scan replaces the whole map under
//! one write lock, so no reader ever sees a half-updated registry.

use crate::component::{ComponentDescriptor, ComponentKind, ComponentRecord};
use crate::error::Result;
use crate::persist::{atomic_read_json, atomic_write_json};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Difference between two consecutive registry snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    /// Number of records after the update.
    pub count: usize,
}

impl RegistryDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    records: HashMap<String, ComponentRecord>,
    /// Directory name -> id, for components whose manifest renames them.
    aliases: HashMap<String, String>,
    /// Persisted pause list. May name ids that are not discovered (yet).
    paused: BTreeSet<String>,
}

impl RegistryState {
    fn resolve<'a>(&'a self, id_or_alias: &'a str) -> Option<&'a str> {
        if self.records.contains_key(id_or_alias) {
            return Some(id_or_alias);
        }
        self.aliases.get(id_or_alias).map(String::as_str)
    }
}

/// Registry of one component kind.
#[derive(Debug)]
pub struct ComponentRegistry {
    kind: ComponentKind,
    pause_list_path: PathBuf,
    state: RwLock<RegistryState>,
}

impl ComponentRegistry {
    /// Create an empty registry, loading the kind's pause list from `data_dir`.
    pub fn new(kind: ComponentKind, data_dir: &Path) -> Self {
        let pause_list_path = data_dir.join(format!("paused_{}.json", kind.plural()));
        let paused = match atomic_read_json::<Vec<String>>(&pause_list_path) {
            Ok(Some(ids)) => ids.into_iter().collect(),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!(
                    "Ignoring unreadable pause list {}: {}",
                    pause_list_path.display(),
                    e
                );
                BTreeSet::new()
            }
        };

        Self {
            kind,
            pause_list_path,
            state: RwLock::new(RegistryState {
                paused,
                ..RegistryState::default()
            }),
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn pause_list_path(&self) -> &Path {
        &self.pause_list_path
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically replace every record with a fresh scan result.
    ///
    /// Pause state is re-applied from the pause list. Records whose id was
    /// already taken by an earlier record are dropped.
    pub fn replace(&self, records: Vec<ComponentRecord>) -> RegistryDelta {
        let mut state = self.write();

        let mut next: HashMap<String, ComponentRecord> = HashMap::with_capacity(records.len());
        let mut aliases = HashMap::new();
        for mut record in records {
            if next.contains_key(record.id()) {
                warn!(
                    kind = %self.kind,
                    id = %record.id(),
                    path = %record.descriptor.path.display(),
                    "Duplicate component id, keeping the first one"
                );
                continue;
            }
            record.is_paused = state.paused.contains(record.id());
            if record.descriptor.dir_name != record.descriptor.id {
                aliases.insert(
                    record.descriptor.dir_name.clone(),
                    record.descriptor.id.clone(),
                );
            }
            next.insert(record.id().to_string(), record);
        }

        let mut delta = RegistryDelta {
            count: next.len(),
            ..RegistryDelta::default()
        };
        for (id, record) in &next {
            match state.records.get(id) {
                None => delta.added.push(id.clone()),
                Some(previous) if previous.descriptor != record.descriptor => {
                    delta.changed.push(id.clone())
                }
                Some(_) => {}
            }
        }
        for id in state.records.keys() {
            if !next.contains_key(id) {
                delta.removed.push(id.clone());
            }
        }
        delta.added.sort();
        delta.removed.sort();
        delta.changed.sort();

        state.records = next;
        state.aliases = aliases;

        debug!(
            kind = %self.kind,
            count = delta.count,
            added = delta.added.len(),
            removed = delta.removed.len(),
            changed = delta.changed.len(),
            "Registry replaced"
        );
        delta
    }

    /// Look up a record by id or directory alias.
    pub fn get(&self, id_or_alias: &str) -> Option<ComponentRecord> {
        let state = self.read();
        let id = state.resolve(id_or_alias)?;
        state.records.get(id).cloned()
    }

    pub fn descriptor(&self, id_or_alias: &str) -> Option<ComponentDescriptor> {
        self.get(id_or_alias).map(|record| record.descriptor)
    }

    /// Canonical id for an id or directory alias.
    pub fn resolve_id(&self, id_or_alias: &str) -> Option<String> {
        self.read().resolve(id_or_alias).map(str::to_string)
    }

    /// Id of the record living in `dir`, if any.
    pub fn id_for_dir(&self, dir: &Path) -> Option<String> {
        self.read()
            .records
            .values()
            .find(|record| record.descriptor.path == dir)
            .map(|record| record.descriptor.id.clone())
    }

    pub fn contains(&self, id_or_alias: &str) -> bool {
        self.read().resolve(id_or_alias).is_some()
    }

    /// Snapshot of every record, sorted by id.
    pub fn list(&self) -> Vec<ComponentRecord> {
        let mut records: Vec<_> = self.read().records.values().cloned().collect();
        records.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        records
    }

    pub fn count(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_paused(&self, id_or_alias: &str) -> bool {
        let state = self.read();
        let id = state.resolve(id_or_alias).unwrap_or(id_or_alias);
        state.paused.contains(id)
    }

    /// Paused ids, including ones not currently discovered.
    pub fn paused_ids(&self) -> Vec<String> {
        self.read().paused.iter().cloned().collect()
    }

    /// Update the pause flag and persist the pause list.
    ///
    /// The file is written under the write lock, so the last write on disk
    /// always holds the latest list.
    pub fn set_paused(&self, id_or_alias: &str, paused: bool) -> Result<()> {
        let mut state = self.write();
        let id = state
            .resolve(id_or_alias)
            .unwrap_or(id_or_alias)
            .to_string();
        if paused {
            state.paused.insert(id.clone());
        } else {
            state.paused.remove(&id);
        }
        if let Some(record) = state.records.get_mut(&id) {
            record.is_paused = paused;
        }
        let ids: Vec<String> = state.paused.iter().cloned().collect();
        atomic_write_json(&self.pause_list_path, &ids, false)?;
        drop(state);

        info!(
            kind = %self.kind,
            id = %id,
            paused,
            "Pause state saved"
        );
        Ok(())
    }

    /// Update install state after a reconciler run. Returns false when the
    /// record is unknown.
    pub fn set_installed(
        &self,
        id_or_alias: &str,
        installed: bool,
        fingerprint: Option<String>,
    ) -> bool {
        let mut state = self.write();
        let Some(id) = state.resolve(id_or_alias).map(str::to_string) else {
            return false;
        };
        match state.records.get_mut(&id) {
            Some(record) => {
                record.is_installed = installed;
                record.dependency_fingerprint = fingerprint;
                true
            }
            None => false,
        }
    }

    /// Drop a record (and its alias) without touching the pause list.
    pub fn remove(&self, id_or_alias: &str) -> Option<ComponentRecord> {
        let mut state = self.write();
        let id = state.resolve(id_or_alias)?.to_string();
        state.aliases.retain(|_, target| target != &id);
        state.records.remove(&id)
    }
}
