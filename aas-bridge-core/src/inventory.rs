//! Inventory store: what the synchroniser remembers between cycles.
//!
//! Entries are indexed by [`StableId`] plus a parent index for cascading deletes. All
//! writes go through one lock; a multi-entry [`Inventory::commit`] swaps the whole change
//! set in at once, so readers observe either the pre-cycle or the post-cycle state.
//!
//! When a path is configured the full snapshot is persisted as JSON before the in-memory
//! state changes (write to a temp file in the same directory, then rename).

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::InventoryError;
use crate::model::InventoryEntry;
use crate::reference::StableId;

/// One change inside a [`Inventory::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryChange {
    Upsert(InventoryEntry),
    Remove(StableId),
}

#[derive(Debug, Default, Clone)]
struct State {
    entries: BTreeMap<StableId, InventoryEntry>,
    children: BTreeMap<StableId, BTreeSet<StableId>>,
}

impl State {
    fn from_entries(entries: impl IntoIterator<Item = InventoryEntry>) -> Self {
        let mut state = State::default();
        for entry in entries {
            state.insert(entry);
        }
        state
    }

    fn insert(&mut self, entry: InventoryEntry) {
        if let Some(previous) = self.entries.get(&entry.id) {
            if previous.parent_id != entry.parent_id {
                let (id, parent) = (previous.id.clone(), previous.parent_id.clone());
                self.unlink(&id, parent.as_ref());
            }
        }
        if let Some(parent) = &entry.parent_id {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(entry.id.clone());
        }
        self.entries.insert(entry.id.clone(), entry);
    }

    fn remove(&mut self, id: &StableId) -> Option<InventoryEntry> {
        let removed = self.entries.remove(id)?;
        self.unlink(id, removed.parent_id.as_ref());
        Some(removed)
    }

    fn unlink(&mut self, id: &StableId, parent: Option<&StableId>) {
        if let Some(parent) = parent {
            if let Some(siblings) = self.children.get_mut(parent) {
                siblings.remove(id);
                if siblings.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<InventoryEntry>,
}

/// Durable or in-memory map from [`StableId`] to [`InventoryEntry`].
#[derive(Debug)]
pub struct Inventory {
    state: RwLock<State>,
    path: Option<PathBuf>,
}

impl Inventory {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(State::default()),
            path: None,
        }
    }

    /// Loads the snapshot at `path` if it exists; otherwise starts empty and creates it on
    /// the first commit.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, InventoryError> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => {
                let snapshot: Snapshot =
                    serde_json::from_slice(&bytes).map_err(|source| InventoryError::Decode {
                        path: path.clone(),
                        source,
                    })?;
                info!(
                    path = %path.display(),
                    entries = snapshot.entries.len(),
                    "Loaded inventory snapshot"
                );
                State::from_entries(snapshot.entries)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No inventory snapshot yet, starting empty");
                State::default()
            }
            Err(source) => return Err(InventoryError::Read { path, source }),
        };
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All entries ordered by id.
    pub fn list(&self) -> Vec<InventoryEntry> {
        self.read().entries.values().cloned().collect()
    }

    pub fn get(&self, id: &StableId) -> Option<InventoryEntry> {
        self.read().entries.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub fn children_of(&self, id: &StableId) -> Vec<StableId> {
        self.read()
            .children
            .get(id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every transitive child of `id`, deepest first, without `id` itself.
    pub fn descendants(&self, id: &StableId) -> Vec<StableId> {
        let state = self.read();
        let mut ordered = Vec::new();
        let mut worklist = vec![id.clone()];
        while let Some(current) = worklist.pop() {
            if let Some(children) = state.children.get(&current) {
                for child in children {
                    ordered.push(child.clone());
                    worklist.push(child.clone());
                }
            }
        }
        ordered.reverse();
        ordered
    }

    pub fn upsert(&self, entry: InventoryEntry) -> Result<(), InventoryError> {
        self.commit(vec![InventoryChange::Upsert(entry)])
    }

    pub fn remove(&self, id: &StableId) -> Result<Option<InventoryEntry>, InventoryError> {
        let removed = self.get(id);
        self.commit(vec![InventoryChange::Remove(id.clone())])?;
        Ok(removed)
    }

    /// Applies all changes at once. Persists first; the in-memory state is only swapped
    /// if the snapshot was written.
    pub fn commit(&self, changes: Vec<InventoryChange>) -> Result<(), InventoryError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut guard = self.write();
        let mut next = guard.clone();
        let count = changes.len();
        for change in changes {
            match change {
                InventoryChange::Upsert(entry) => next.insert(entry),
                InventoryChange::Remove(id) => {
                    next.remove(&id);
                }
            }
        }
        if let Some(path) = &self.path {
            persist(path, &next)?;
        }
        *guard = next;
        debug!(changes = count, entries = guard.entries.len(), "Inventory committed");
        Ok(())
    }
}

fn persist(path: &Path, state: &State) -> Result<(), InventoryError> {
    let snapshot = Snapshot {
        entries: state.entries.values().cloned().collect(),
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let write_err = |source| InventoryError::Write {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(&dir).map_err(write_err)?;
    let mut file = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
    file.write_all(&bytes).map_err(write_err)?;
    file.as_file().sync_all().map_err(write_err)?;
    file.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
