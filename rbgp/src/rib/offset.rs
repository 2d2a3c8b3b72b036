//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::sync::Arc;

// Maps the contributors of a destination to slots of a parallel value
// vector.
//
// Slots are handed out in insertion order and never move while the
// contributor set only grows. Removing a contributor compacts the table:
// every slot after the removed one shifts down by one. The key layout is
// reference counted so that destinations learned from the same routers in the
// same order share a single table (see [`OffsetTables`]).
#[derive(Debug)]
pub struct OffsetTable<K> {
    // Keys in slot order.
    keys: Arc<[K]>,
    // Slot numbers sorted by key, for binary search.
    index: Arc<[u32]>,
}

// Interning cache for offset tables.
#[derive(Debug)]
pub struct OffsetTables<K> {
    tree: BTreeMap<Arc<[K]>, OffsetTable<K>>,
}

// ===== impl OffsetTable =====

impl<K> OffsetTable<K>
where
    K: Clone + Ord,
{
    fn from_keys(keys: Arc<[K]>) -> OffsetTable<K> {
        let mut index = (0..keys.len() as u32).collect::<Vec<_>>();
        index.sort_by(|a, b| keys[*a as usize].cmp(&keys[*b as usize]));
        OffsetTable {
            keys,
            index: index.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    // Returns the slot assigned to the given key.
    pub fn offset_of(&self, key: &K) -> Option<usize> {
        self.index
            .binary_search_by(|slot| self.keys[*slot as usize].cmp(key))
            .ok()
            .map(|pos| self.index[pos] as usize)
    }

    pub fn key(&self, offset: usize) -> Option<&K> {
        self.keys.get(offset)
    }

    // Keys in slot order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.keys.iter()
    }

    // Returns a table with the given key appended, along with the slot
    // assigned to it. An existing key keeps its slot.
    pub fn with(&self, key: K) -> (OffsetTable<K>, usize) {
        if let Some(offset) = self.offset_of(&key) {
            return (self.clone(), offset);
        }
        let offset = self.keys.len();
        let keys = self
            .keys
            .iter()
            .cloned()
            .chain(std::iter::once(key))
            .collect::<Arc<[K]>>();
        (OffsetTable::from_keys(keys), offset)
    }

    // Returns a table with the given key removed, along with the slot it
    // used to occupy. The caller must remove the same slot from its values.
    pub fn without(&self, key: &K) -> Option<(OffsetTable<K>, usize)> {
        let offset = self.offset_of(key)?;
        let keys = self
            .keys
            .iter()
            .enumerate()
            .filter(|(slot, _)| *slot != offset)
            .map(|(_, key)| key.clone())
            .collect::<Arc<[K]>>();
        Some((OffsetTable::from_keys(keys), offset))
    }

    // Migrates a value vector laid out for this table's predecessor,
    // appending the values of the newly allocated slots.
    pub fn expand<V>(
        &self,
        mut values: Vec<V>,
        extra: impl IntoIterator<Item = V>,
    ) -> Vec<V> {
        values.reserve_exact(self.len().saturating_sub(values.len()));
        values.extend(extra);
        debug_assert_eq!(values.len(), self.len());
        values
    }
}

impl<K> Clone for OffsetTable<K> {
    fn clone(&self) -> OffsetTable<K> {
        OffsetTable {
            keys: Arc::clone(&self.keys),
            index: Arc::clone(&self.index),
        }
    }
}

impl<K> Default for OffsetTable<K> {
    fn default() -> OffsetTable<K> {
        OffsetTable {
            keys: Arc::new([]),
            index: Arc::new([]),
        }
    }
}

impl<K: PartialEq> PartialEq for OffsetTable<K> {
    fn eq(&self, other: &Self) -> bool {
        self.keys == other.keys
    }
}

// ===== impl OffsetTables =====

impl<K> OffsetTables<K>
where
    K: Clone + Ord,
{
    // Returns the shared table equivalent to `table` with `key` appended.
    pub fn with(
        &mut self,
        table: &OffsetTable<K>,
        key: K,
    ) -> (OffsetTable<K>, usize) {
        let (table, offset) = table.with(key);
        (self.intern(table), offset)
    }

    // Returns the shared table equivalent to `table` with `key` removed.
    pub fn without(
        &mut self,
        table: &OffsetTable<K>,
        key: &K,
    ) -> Option<(OffsetTable<K>, usize)> {
        let (table, offset) = table.without(key)?;
        Some((self.intern(table), offset))
    }

    fn intern(&mut self, table: OffsetTable<K>) -> OffsetTable<K> {
        if table.is_empty() {
            return table;
        }
        self.tree
            .entry(Arc::clone(&table.keys))
            .or_insert(table)
            .clone()
    }

    // Drops layouts no longer referenced by any destination.
    pub fn gc(&mut self) {
        // The cache holds two references to each key slice: the map key and
        // the cached table.
        self.tree.retain(|_, table| Arc::strong_count(&table.keys) > 2);
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }
}

impl<K> Default for OffsetTables<K> {
    fn default() -> OffsetTables<K> {
        OffsetTables {
            tree: Default::default(),
        }
    }
}

// ===== unit tests =====
