// Copyright 2026 lapse Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt::Debug, hash::Hash, sync::Arc};

use equivalent::Equivalent;
use hashbrown::hash_table::{Entry as HashTableEntry, HashTable};
use itertools::Itertools;
use parking_lot::RwLock;

use crate::{
    code::{Key, Value},
    slot::Slot,
    utils::scope::Scope,
};

struct Shard<K, V>
where
    K: Key,
    V: Value,
{
    slots: HashTable<Arc<Slot<K, V>>>,
}

impl<K, V> Default for Shard<K, V>
where
    K: Key,
    V: Value,
{
    fn default() -> Self {
        Self {
            slots: HashTable::new(),
        }
    }
}

/// Sharded key to slot mapping.
///
/// The shard write lock is the only synchronization point; all atomicity the
/// memoizer relies on (insert-if-absent, conditional remove) is established
/// here and nowhere else.
pub struct Store<K, V>
where
    K: Key,
    V: Value,
{
    shards: Vec<RwLock<Shard<K, V>>>,
}

impl<K, V> Debug for Store<K, V>
where
    K: Key,
    V: Value,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("shards", &self.shards.len()).finish()
    }
}

impl<K, V> Store<K, V>
where
    K: Key,
    V: Value,
{
    pub fn new(shards: usize) -> Self {
        assert!(shards > 0, "shards must be greater than zero.");

        Self {
            shards: (0..shards).map(|_| RwLock::new(Shard::default())).collect_vec(),
        }
    }

    pub fn get<Q>(&self, hash: u64, key: &Q) -> Option<Arc<Slot<K, V>>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.shard(hash)
            .read()
            .with(|shard| shard.slots.find(hash, |s| key.equivalent(s.key())).cloned())
    }

    /// Install `slot` unless a slot for the same key is already present.
    ///
    /// Returns the slot now mapped for the key, and whether it is the one
    /// just offered. Exactly one concurrent caller per key observes `true`
    /// and with it the responsibility to run the computation.
    pub fn insert_if_absent(&self, slot: Arc<Slot<K, V>>) -> (Arc<Slot<K, V>>, bool) {
        let mut shard = self.shard(slot.hash()).write();
        match shard
            .slots
            .entry(slot.hash(), |s| s.key() == slot.key(), |s| s.hash())
        {
            HashTableEntry::Occupied(o) => (o.get().clone(), false),
            HashTableEntry::Vacant(v) => {
                v.insert(slot.clone());
                (slot, true)
            }
        }
    }

    pub fn remove<Q>(&self, hash: u64, key: &Q) -> Option<Arc<Slot<K, V>>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let mut shard = self.shard(hash).write();
        match shard.slots.entry(hash, |s| key.equivalent(s.key()), |s| s.hash()) {
            HashTableEntry::Occupied(o) => {
                let (slot, _) = o.remove();
                Some(slot)
            }
            HashTableEntry::Vacant(_) => None,
        }
    }

    /// Remove the slot for the key only if its hit counter holds `expected`
    /// at the moment of the check.
    ///
    /// The check and the removal happen under the shard write lock, so no
    /// insert or remove can interleave; a concurrent read can still bump the
    /// counter right after the check, which mirrors the counter-based
    /// eviction this store exists to serve.
    pub fn remove_if_hits<Q>(&self, hash: u64, key: &Q, expected: u64) -> Option<Arc<Slot<K, V>>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let mut shard = self.shard(hash).write();
        match shard.slots.entry(hash, |s| key.equivalent(s.key()), |s| s.hash()) {
            HashTableEntry::Occupied(o) if o.get().hits() == expected => {
                let (slot, _) = o.remove();
                Some(slot)
            }
            _ => None,
        }
    }

    /// Point-in-time snapshot of all resident slots.
    ///
    /// Shards are captured one by one under their read locks; slots inserted
    /// or removed elsewhere while the walk proceeds do not disturb the slots
    /// already captured.
    pub fn snapshot(&self) -> Vec<Arc<Slot<K, V>>> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().with(|shard| shard.slots.iter().cloned().collect_vec()))
            .collect_vec()
    }

    /// Drain all shards, returning the drained slots for event reporting.
    pub fn clear(&self) -> Vec<Arc<Slot<K, V>>> {
        self.shards
            .iter()
            .flat_map(|shard| shard.write().with(|mut shard| shard.slots.drain().collect_vec()))
            .collect_vec()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().slots.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shards(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, hash: u64) -> &RwLock<Shard<K, V>> {
        &self.shards[hash as usize % self.shards.len()]
    }
}

#[cfg(test)]
mod tests {
    use std::hash::BuildHasher;

    use super::*;

    fn slot_for_test(key: u64) -> Arc<Slot<u64, u64>> {
        let hash = ahash::RandomState::with_seeds(7, 7, 7, 7).hash_one(key);
        Arc::new(Slot::new(key, hash))
    }

    #[test_log::test]
    fn test_insert_if_absent_keeps_first() {
        let store: Store<u64, u64> = Store::new(4);

        let first = slot_for_test(1);
        let (installed, won) = store.insert_if_absent(first.clone());
        assert!(won);
        assert!(Arc::ptr_eq(&installed, &first));

        let second = slot_for_test(1);
        let (existing, won) = store.insert_if_absent(second);
        assert!(!won);
        assert!(Arc::ptr_eq(&existing, &first));

        assert_eq!(store.len(), 1);
    }

    #[test_log::test]
    fn test_get_and_remove() {
        let store: Store<u64, u64> = Store::new(4);
        let slot = slot_for_test(1);
        store.insert_if_absent(slot.clone());

        let found = store.get(slot.hash(), slot.key()).unwrap();
        assert!(Arc::ptr_eq(&found, &slot));

        let removed = store.remove(slot.hash(), slot.key()).unwrap();
        assert!(Arc::ptr_eq(&removed, &slot));
        assert!(store.get(slot.hash(), slot.key()).is_none());
        assert!(store.is_empty());
    }

    #[test_log::test]
    fn test_remove_if_hits() {
        let store: Store<u64, u64> = Store::new(4);
        let slot = slot_for_test(1);
        store.insert_if_absent(slot.clone());

        assert!(store.remove_if_hits(slot.hash(), slot.key(), 1).is_none());
        assert_eq!(store.len(), 1);

        slot.run_once(|| Ok(0));
        slot.touch();
        assert!(store.remove_if_hits(slot.hash(), slot.key(), 1).is_some());
        assert!(store.is_empty());
    }

    #[test_log::test]
    fn test_snapshot_is_stable_under_mutation() {
        let store: Store<u64, u64> = Store::new(4);
        let slots = (0..16).map(slot_for_test).collect_vec();
        for slot in slots.iter() {
            store.insert_if_absent(slot.clone());
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 16);

        // Mutating the store does not disturb the captured snapshot.
        for slot in slots.iter().take(8) {
            store.remove(slot.hash(), slot.key());
        }
        assert_eq!(store.len(), 8);
        assert_eq!(snapshot.len(), 16);
    }

    #[test_log::test]
    fn test_clear_drains_all_shards() {
        let store: Store<u64, u64> = Store::new(4);
        for key in 0..16 {
            store.insert_if_absent(slot_for_test(key));
        }

        let drained = store.clear();
        assert_eq!(drained.len(), 16);
        assert!(store.is_empty());
    }
}
