use crate::entry::Slot;

use core::fmt;
use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

/// A helper function to hash a key using a `BuildHasher`.
#[inline]
pub(crate) fn hash_key<K: Hash, H: BuildHasher>(hasher: &H, key: &K) -> u64 {
  let mut state = hasher.build_hasher();
  key.hash(&mut state);
  state.finish()
}

/// A single, independently locked partition of the slot map.
pub(crate) struct Shard<K, V, H> {
  pub(crate) map: RwLock<HashMap<K, Arc<Slot<K, V>>, H>>,
}

/// The key→slot map, partitioned into multiple, independently locked shards.
///
/// Operations on different keys are unlikely to contend for the same lock.
/// The shard lock only guards map membership; state transitions of a slot
/// are serialized by the slot's own mutex.
pub(crate) struct ShardedStore<K, V, H> {
  pub(crate) shards: Box<[CachePadded<Shard<K, V, H>>]>,
  pub(crate) hasher: H,
}

impl<K, V, H> fmt::Debug for ShardedStore<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ShardedStore")
      .field("num_shards", &self.shards.len())
      .finish()
  }
}

impl<K, V, H> ShardedStore<K, V, H>
where
  K: Eq + Hash,
  H: BuildHasher + Clone,
{
  /// Creates a new store. `num_shards` is rounded up to a power of two for
  /// fast bitwise index selection.
  pub(crate) fn new(num_shards: usize, hasher: H) -> Self {
    let num_shards = num_shards.max(1).next_power_of_two();
    let mut shards = Vec::with_capacity(num_shards);
    for _ in 0..num_shards {
      shards.push(CachePadded::new(Shard {
        map: RwLock::new(HashMap::with_hasher(hasher.clone())),
      }));
    }
    Self {
      shards: shards.into_boxed_slice(),
      hasher,
    }
  }

  #[inline]
  pub(crate) fn get_shard(&self, key: &K) -> &Shard<K, V, H> {
    let hash = hash_key(&self.hasher, key);
    let index = hash as usize & (self.shards.len() - 1);
    &self.shards[index]
  }

  /// Looks up the slot for a key, if one exists.
  #[inline]
  pub(crate) fn slot(&self, key: &K) -> Option<Arc<Slot<K, V>>> {
    self.get_shard(key).map.read().get(key).cloned()
  }

  /// Removes the slot for a key, but only if it still is the given one.
  /// A slot that was concurrently replaced stays untouched.
  pub(crate) fn remove_slot(&self, key: &K, slot: &Arc<Slot<K, V>>) {
    let shard = self.get_shard(key);
    let mut guard = shard.map.write();
    if let Some(current) = guard.get(key) {
      if Arc::ptr_eq(current, slot) {
        guard.remove(key);
      }
    }
  }

  pub(crate) fn iter_shards(&self) -> impl Iterator<Item = &Shard<K, V, H>> {
    self.shards.iter().map(|padded| &**padded)
  }
}
