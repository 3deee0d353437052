//! Stamp-validated metadata cache.
//!
//! Entries remember the [`Stamp`] of the catalog row they were built from.
//! A lookup whose freshness check fails drops the entry, so the caller
//! rebuilds it from the current catalog state.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;

use tracing::debug;

use crate::catalog::Stamp;
use crate::error::{Result, RouteError};

struct Entry<V> {
    value: V,
    stamp: Stamp,
}

pub struct StampedCache<K, V> {
    name: &'static str,
    entries: HashMap<K, Entry<V>>,
    building: HashSet<K>,
}

impl<K, V> StampedCache<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: HashMap::new(),
            building: HashSet::new(),
        }
    }

    /// Returns the cached value if `is_fresh` accepts it. A stale entry is
    /// removed.
    pub fn lookup(&mut self, key: &K, is_fresh: impl FnOnce(&V, Stamp) -> bool) -> Option<V> {
        let entry = self.entries.get(key)?;
        if is_fresh(&entry.value, entry.stamp) {
            return Some(entry.value.clone());
        }
        debug!(cache = self.name, key = %key, "stale cache entry dropped");
        self.entries.remove(key);
        None
    }

    pub fn insert(&mut self, key: K, value: V, stamp: Stamp) -> Result<()> {
        if self.entries.contains_key(&key) {
            return Err(RouteError::Internal(format!(
                "{} {key} already in cache",
                self.name
            )));
        }
        self.entries.insert(key, Entry { value, stamp });
        Ok(())
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Marks `key` as under construction. Fails if it already is.
    pub fn begin_build(&mut self, key: &K) -> Result<()> {
        if !self.building.insert(key.clone()) {
            return Err(RouteError::Internal(format!(
                "{} {key} is already being compiled",
                self.name
            )));
        }
        Ok(())
    }

    pub fn end_build(&mut self, key: &K) {
        self.building.remove(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
