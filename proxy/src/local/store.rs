use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

/// A stored value and the instant it stops being visible.
#[derive(Debug, Clone)]
pub(crate) struct StoredValue<V> {
  pub(crate) value: V,
  pub(crate) expires_at: Option<Instant>,
}

impl<V> StoredValue<V> {
  pub(crate) fn new(value: V, ttl: Option<Duration>) -> Self {
    Self {
      value,
      expires_at: ttl.map(|ttl| Instant::now() + ttl),
    }
  }

  #[inline]
  pub(crate) fn is_expired(&self, now: Instant) -> bool {
    self.expires_at.is_some_and(|at| at <= now)
  }

  /// Restarts the lifetime with `ttl`, if one is given.
  pub(crate) fn touch(&mut self, ttl: Option<Duration>) {
    if let Some(ttl) = ttl {
      self.expires_at = Some(Instant::now() + ttl);
    }
  }
}

pub(crate) type Shard<K, V, H> = RwLock<HashMap<K, StoredValue<V>, H>>;

/// A map partitioned into independently locked shards.
///
/// Shards double as partitions: a partition-restricted scan reads exactly
/// one shard.
pub(crate) struct ShardedStore<K, V, H = ahash::RandomState> {
  shards: Box<[CachePadded<Shard<K, V, H>>]>,
  hasher: H,
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
  /// Creates a store with `num_shards` shards. `num_shards` must be positive.
  pub(crate) fn new(num_shards: usize, hasher: H) -> Self {
    let shards: Vec<_> = (0..num_shards)
      .map(|_| CachePadded::new(RwLock::new(HashMap::with_hasher(hasher.clone()))))
      .collect();

    Self {
      shards: shards.into_boxed_slice(),
      hasher,
    }
  }

  #[inline]
  pub(crate) fn shard_index(&self, key: &K) -> usize {
    self.hasher.hash_one(key) as usize % self.shards.len()
  }

  /// The shard holding `key`.
  #[inline]
  pub(crate) fn shard_for(&self, key: &K) -> &Shard<K, V, H> {
    &self.shards[self.shard_index(key)]
  }

  pub(crate) fn shard(&self, index: usize) -> Option<&Shard<K, V, H>> {
    self.shards.get(index).map(|padded| &**padded)
  }

  pub(crate) fn num_shards(&self) -> usize {
    self.shards.len()
  }

  pub(crate) fn iter_shards(&self) -> impl Iterator<Item = &Shard<K, V, H>> {
    self.shards.iter().map(|padded| &**padded)
  }

  /// Number of stored values, including expired ones not yet purged.
  pub(crate) fn len(&self) -> usize {
    self.iter_shards().map(|shard| shard.read().len()).sum()
  }
}
