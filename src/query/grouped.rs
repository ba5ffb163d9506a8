//! GroupedMap - ordered grouping key to partial result mapping.
//!
//! The unit of per-shard and cross-shard merge state. Keys are kept in canonical
//! `Datum` order so serialization and merging are deterministic. There is no
//! tombstone representation: removing a key erases its entry.

use super::datum::Datum;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap, Entry};

/// The implicit key used by ungrouped queries.
pub const UNGROUPED_KEY: Datum = Datum::Null;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupedMap<T> {
    m: BTreeMap<Datum, T>,
}

impl<T> Default for GroupedMap<T> {
    fn default() -> Self {
        GroupedMap { m: BTreeMap::new() }
    }
}

impl<T> GroupedMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map holding a single entry under the implicit ungrouped key.
    pub fn ungrouped(value: T) -> Self {
        let mut m = BTreeMap::new();
        m.insert(UNGROUPED_KEY, value);
        GroupedMap { m }
    }

    pub fn len(&self) -> usize {
        self.m.len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }

    pub fn get(&self, key: &Datum) -> Option<&T> {
        self.m.get(key)
    }

    pub fn get_mut(&mut self, key: &Datum) -> Option<&mut T> {
        self.m.get_mut(key)
    }

    pub fn contains_key(&self, key: &Datum) -> bool {
        self.m.contains_key(key)
    }

    /// Returns the previous value for the key, if any.
    pub fn insert(&mut self, key: Datum, value: T) -> Option<T> {
        self.m.insert(key, value)
    }

    pub fn remove(&mut self, key: &Datum) -> Option<T> {
        self.m.remove(key)
    }

    pub fn entry(&mut self, key: Datum) -> Entry<'_, Datum, T> {
        self.m.entry(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Datum, T> {
        self.m.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, Datum, T> {
        self.m.iter_mut()
    }

    pub fn keys(&self) -> btree_map::Keys<'_, Datum, T> {
        self.m.keys()
    }

    pub fn clear(&mut self) {
        self.m.clear();
    }

    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&Datum, &mut T) -> bool,
    {
        self.m.retain(f);
    }

    pub fn swap(&mut self, other: &mut GroupedMap<T>) {
        std::mem::swap(&mut self.m, &mut other.m);
    }

    /// Take the sole ungrouped entry out of the map, if that is all it holds.
    pub fn take_ungrouped(&mut self) -> Option<T> {
        if self.m.len() == 1 && self.m.contains_key(&UNGROUPED_KEY) {
            self.m.remove(&UNGROUPED_KEY)
        } else {
            None
        }
    }

    pub fn map_values<U, F>(self, mut f: F) -> GroupedMap<U>
    where
        F: FnMut(T) -> U,
    {
        GroupedMap {
            m: self.m.into_iter().map(|(k, v)| (k, f(v))).collect(),
        }
    }
}

impl<T: Default> GroupedMap<T> {
    /// Value slot for `key`, default-initialized on first access.
    pub fn slot(&mut self, key: Datum) -> &mut T {
        self.m.entry(key).or_default()
    }
}

impl<T: Serialize> GroupedMap<T> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

impl<T: DeserializeOwned> GroupedMap<T> {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl<T> IntoIterator for GroupedMap<T> {
    type Item = (Datum, T);
    type IntoIter = btree_map::IntoIter<Datum, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.m.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a GroupedMap<T> {
    type Item = (&'a Datum, &'a T);
    type IntoIter = btree_map::Iter<'a, Datum, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.m.iter()
    }
}

impl<T> FromIterator<(Datum, T)> for GroupedMap<T> {
    fn from_iter<I: IntoIterator<Item = (Datum, T)>>(iter: I) -> Self {
        GroupedMap {
            m: iter.into_iter().collect(),
        }
    }
}
