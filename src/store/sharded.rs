use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;
use ahash::{AHashMap, RandomState};
use parking_lot::RwLock;

// ---------------------------------------------------------------------------
// Shard
// ---------------------------------------------------------------------------

/// Cache-line padding to prevent false sharing between shards.
#[repr(align(64))]
pub(crate) struct Shard<K, V> {
    pub(crate) map: RwLock<AHashMap<K, Arc<V>>>,
}

// ---------------------------------------------------------------------------
// ShardedStore
// ---------------------------------------------------------------------------

/// A thread-safe key-value store backed by `N` independently-locked shards.
///
/// Reads use a shared lock, writes use an exclusive lock, both per-shard.
/// Values are handed out as `Arc<V>` so callers never hold a shard lock
/// while they work with an entry.
pub struct ShardedStore<K, V> {
    shards: Box<[Shard<K, V>]>,
    /// Always `shards.len() - 1`; shards.len() is a power of two.
    shard_mask: usize,
    /// Hasher used only to compute shard indices.
    build_hasher: RandomState,
}

impl<K: Hash + Eq + Clone, V> ShardedStore<K, V> {
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards.is_power_of_two());
        let shards = (0..num_shards)
            .map(|_| Shard {
                map: RwLock::new(AHashMap::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        ShardedStore {
            shards,
            shard_mask: num_shards - 1,
            build_hasher: RandomState::new(),
        }
    }

    #[inline]
    fn shard<Q>(&self, key: &Q) -> &Shard<K, V>
    where
        Q: Hash + ?Sized,
    {
        let h = self.build_hasher.hash_one(key);
        // Use the high bits (better avalanche from ahash).
        &self.shards[((h >> 32) as usize) & self.shard_mask]
    }

    // -----------------------------------------------------------------------
    // Core operations
    // -----------------------------------------------------------------------

    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).map.read().get(key).map(Arc::clone)
    }

    /// Returns the value for `key`, inserting `make()` if there is none.
    ///
    /// The flag is `true` only for the call that actually inserted.  `make`
    /// runs under the shard's write lock, so at most one value is ever built
    /// per absent key.
    pub fn get_or_insert_with<Q, F>(&self, key: &Q, make: F) -> (Arc<V>, bool)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: FnOnce() -> V,
    {
        let shard = self.shard(key);
        // Optimistic read first; most lookups hit an existing entry.
        if let Some(v) = shard.map.read().get(key) {
            return (Arc::clone(v), false);
        }
        let mut map = shard.map.write();
        if let Some(v) = map.get(key) {
            return (Arc::clone(v), false);
        }
        let value = Arc::new(make());
        map.insert(key.to_owned(), Arc::clone(&value));
        (value, true)
    }

    /// Inserts an already shared value.  Returns the previous value, if any.
    pub fn insert(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        self.shard(&key).map.write().insert(key, value)
    }

    /// Removes the entry for `key`.  Returns the removed value, if any.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.shard(key).map.write().remove(key)
    }

    /// Removes the entry for `key` only if `pred` holds for its current value.
    ///
    /// The check and the removal happen under one write lock, so two racing
    /// callers can never both receive the same value.
    pub fn remove_if<F>(&self, key: &K, pred: F) -> Option<Arc<V>>
    where
        F: FnOnce(&Arc<V>) -> bool,
    {
        let mut map = self.shard(key).map.write();
        match map.get(key) {
            Some(v) if pred(v) => map.remove(key),
            _ => None,
        }
    }

    /// Returns `true` if the key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.shard(key).map.read().contains_key(key)
    }

    /// Returns the total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.map.read().is_empty())
    }

    /// Removes all entries from every shard.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.map.write().clear();
        }
    }

    /// Point-in-time copy of every value.  Shards are visited one at a time,
    /// so the result is not an atomic snapshot of the whole store.
    pub fn values(&self) -> Vec<Arc<V>> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            out.extend(shard.map.read().values().map(Arc::clone));
        }
        out
    }

    /// Like [`values`](Self::values), paired with the keys.
    pub fn entries(&self) -> Vec<(K, Arc<V>)> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            out.extend(
                shard
                    .map
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), Arc::clone(v))),
            );
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
