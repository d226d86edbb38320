//! Process-lifetime memo of probe-derived metadata.
//!
//! Entries are keyed by absolute file path and never expire: a file replaced
//! in place keeps its old answer until restart. Each key has its own slot
//! lock, so concurrent requests for the same uncached file wait for a single
//! computation while other keys proceed independently.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};

type Slot<V> = Arc<Mutex<Option<V>>>;

pub struct MetadataCache<V> {
    slots: RwLock<HashMap<PathBuf, Slot<V>>>,
}

impl<V: Clone> MetadataCache<V> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached value for `key`, computing it on a miss.
    ///
    /// Only `Some` results are stored; a failed computation is retried by the
    /// next caller.
    pub fn get_or_compute<F>(&self, key: &Path, compute: F) -> Option<V>
    where
        F: FnOnce() -> Option<V>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock();
        if let Some(value) = guard.as_ref() {
            tracing::debug!(key = %key.display(), "metadata cache hit");
            return Some(value.clone());
        }

        tracing::debug!(key = %key.display(), "metadata cache miss");
        let value = compute()?;
        *guard = Some(value.clone());
        Some(value)
    }

    pub fn get(&self, key: &Path) -> Option<V> {
        let slot = self.slots.read().get(key).cloned()?;
        slot.lock().clone()
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.lock().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &Path) -> Slot<V> {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }
        Arc::clone(
            self.slots
                .write()
                .entry(key.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }
}

impl<V: Clone> Default for MetadataCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The two probe caches kept by the service.
#[derive(Default)]
pub struct ProbeCache {
    /// `WIDTHxHEIGHT`, keyed by the probed media file.
    pub resolution: MetadataCache<String>,
    /// Container duration in seconds, keyed by the probed file.
    pub duration: MetadataCache<f64>,
}
