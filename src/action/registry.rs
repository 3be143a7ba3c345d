//! Execution Registry
//!
//! Concurrent map from execution id to the live state of that execution.
//! Entries are added by prepare (store-if-absent) and removed by stop
//! (load-and-delete). Removal hands ownership of the state to the caller so the
//! revert runs without holding any map shard lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Shared handle to one execution's state
pub type StateHandle<S> = Arc<Mutex<S>>;

#[derive(Debug)]
pub struct ExecutionRegistry<S> {
    entries: DashMap<Uuid, StateHandle<S>>,
}

impl<S> Default for ExecutionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ExecutionRegistry<S> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store the state unless the id is already live
    ///
    /// Returns the handle on success, `None` if an entry already exists.
    pub fn insert_if_absent(&self, id: Uuid, state: S) -> Option<StateHandle<S>> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let handle = Arc::new(Mutex::new(state));
                slot.insert(handle.clone());
                Some(handle)
            }
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<StateHandle<S>> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Remove and return the entry; idempotent
    pub fn remove(&self, id: &Uuid) -> Option<StateHandle<S>> {
        self.entries.remove(id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
