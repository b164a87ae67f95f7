#![forbid(unsafe_code)]

//! Which main databases are currently served from memory.
//!
//! The provider answers existence queries for these names without touching
//! the file system. Each memory-backed open takes a [`RegistryLease`]; the
//! entry disappears when the last lease for its name is released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Location of an open memory-backed main database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MainDbEntry {
    /// Address of the region backing the database.
    pub address: usize,
    /// Capacity of that region.
    pub capacity: u64,
    /// Number of handles currently open under the name.
    pub opens: usize,
}

/// Shared map from database name to its memory-backed entry.
#[derive(Clone, Default, Debug)]
pub struct Registry {
    entries: Arc<Mutex<HashMap<String, MainDbEntry>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an open of `name`. A later open of the same name replaces the
    /// location and adds to the open count.
    pub fn register(&self, name: &str, address: usize, capacity: u64) -> RegistryLease {
        let mut entries = self.entries.lock();
        let entry = entries.entry(name.to_owned()).or_insert(MainDbEntry {
            address,
            capacity,
            opens: 0,
        });
        entry.address = address;
        entry.capacity = capacity;
        entry.opens += 1;
        debug!(name, address = format_args!("{address:#x}"), opens = entry.opens, "registry.register");
        RegistryLease {
            registry: self.clone(),
            name: name.to_owned(),
            released: false,
        }
    }

    /// Whether `name` is an open memory-backed main database.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    /// The entry for `name`, if open.
    pub fn get(&self, name: &str) -> Option<MainDbEntry> {
        self.entries.lock().get(name).copied()
    }

    /// Number of distinct names registered.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn release(&self, name: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            return;
        };
        entry.opens = entry.opens.saturating_sub(1);
        debug!(name, opens = entry.opens, "registry.release");
        if entry.opens == 0 {
            entries.remove(name);
        }
    }
}

/// Keeps a registry entry alive for one open handle.
#[derive(Debug)]
pub struct RegistryLease {
    registry: Registry,
    name: String,
    released: bool,
}

impl RegistryLease {
    /// Name the lease was taken for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the lease now rather than on drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(&self.name);
        }
    }
}

impl Drop for RegistryLease {
    fn drop(&mut self) {
        self.release_once();
    }
}
