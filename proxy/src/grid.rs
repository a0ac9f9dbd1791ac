//! Contracts of the grid collaborators a proxy delegates to.
//!
//! The proxy never stores or computes cache data itself. It admits the call,
//! checks what it has to check, and forwards to a [`GridCache`] together with
//! the caller's [`OperationContext`].

use crate::context::OperationContext;
use crate::error::GridError;
use crate::future::GridFuture;
use crate::query::SqlValue;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Restricts which storage tiers a local lookup or count considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeekMode {
  /// Every tier.
  All,
  /// Entries this node owns as primary.
  Primary,
  /// Entries this node holds as backup.
  Backup,
  /// Entries in the on-heap tier.
  OnHeap,
  /// Entries in the off-heap tier.
  OffHeap,
  /// Entries in the near cache.
  Near,
}

/// A predicate over cache entries, used by scans and cache loading.
pub type EntryPredicate<K, V> = Arc<dyn Fn(&K, &V) -> bool + Send + Sync>;

/// A single-shot, type-erased entry processor.
pub type EntryProcessor<K, V> = Box<dyn for<'a> FnOnce(&mut MutableEntry<'a, K, V>) + Send>;

/// A reusable, type-erased entry processor applied to many keys.
pub type SharedEntryProcessor<K, V> = Arc<dyn for<'a> Fn(&mut MutableEntry<'a, K, V>) + Send + Sync>;

/// What an entry processor decided to do with its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome<V> {
  Unchanged,
  Set(V),
  Removed,
}

/// The view of one cache entry given to an entry processor.
///
/// Changes are recorded, not applied; the delegate commits the resulting
/// [`EntryOutcome`] atomically after the processor returns.
pub struct MutableEntry<'a, K, V> {
  key: &'a K,
  value: Option<V>,
  outcome: EntryOutcome<()>,
}

impl<'a, K, V> MutableEntry<'a, K, V> {
  /// Creates the view for `key`, currently mapped to `value`.
  pub fn new(key: &'a K, value: Option<V>) -> Self {
    Self {
      key,
      value,
      outcome: EntryOutcome::Unchanged,
    }
  }

  pub fn key(&self) -> &K {
    self.key
  }

  /// The current value, reflecting any change made by this processor.
  pub fn value(&self) -> Option<&V> {
    self.value.as_ref()
  }

  pub fn exists(&self) -> bool {
    self.value.is_some()
  }

  pub fn set_value(&mut self, value: V) {
    self.value = Some(value);
    self.outcome = EntryOutcome::Set(());
  }

  pub fn remove(&mut self) {
    self.value = None;
    self.outcome = EntryOutcome::Removed;
  }

  /// Consumes the view, returning what should be committed.
  pub fn into_outcome(self) -> EntryOutcome<V> {
    match (self.outcome, self.value) {
      (EntryOutcome::Set(()), Some(value)) => EntryOutcome::Set(value),
      (EntryOutcome::Removed, _) => EntryOutcome::Removed,
      _ => EntryOutcome::Unchanged,
    }
  }
}

impl<K: fmt::Debug, V> fmt::Debug for MutableEntry<'_, K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutableEntry")
      .field("key", self.key)
      .field("exists", &self.exists())
      .finish_non_exhaustive()
  }
}

/// The underlying cache implementation a proxy delegates to.
///
/// Operations with both a blocking and a non-blocking flavour return a
/// [`GridFuture`]; the proxy decides whether to wait on it. Node-local
/// operations return their result directly.
pub trait GridCache<K, V>: Send + Sync {
  fn name(&self) -> &str;

  fn get(&self, ctx: &OperationContext, key: K) -> GridFuture<Option<V>>;

  fn get_all(&self, ctx: &OperationContext, keys: Vec<K>) -> GridFuture<HashMap<K, V>>;

  fn contains_key(&self, ctx: &OperationContext, key: K) -> GridFuture<bool>;

  fn contains_keys(&self, ctx: &OperationContext, keys: Vec<K>) -> GridFuture<bool>;

  /// Stores `value`, resolving to `true` if the cache was modified.
  fn put(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<bool>;

  fn get_and_put(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<Option<V>>;

  fn put_all(&self, ctx: &OperationContext, entries: HashMap<K, V>) -> GridFuture<()>;

  fn put_if_absent(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<bool>;

  fn get_and_put_if_absent(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<Option<V>>;

  fn remove(&self, ctx: &OperationContext, key: K) -> GridFuture<bool>;

  /// Removes `key` only if it is currently mapped to `expected`.
  fn remove_exact(&self, ctx: &OperationContext, key: K, expected: V) -> GridFuture<bool>;

  fn get_and_remove(&self, ctx: &OperationContext, key: K) -> GridFuture<Option<V>>;

  fn replace(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<bool>;

  /// Replaces the value of `key` only if it is currently mapped to `expected`.
  fn replace_exact(&self, ctx: &OperationContext, key: K, expected: V, value: V) -> GridFuture<bool>;

  fn get_and_replace(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<Option<V>>;

  /// Removes `keys`, or every entry when `None`. Removals are visible to the
  /// backing store and to continuous queries.
  fn remove_all(&self, ctx: &OperationContext, keys: Option<Vec<K>>) -> GridFuture<()>;

  /// Clears `keys`, or every entry when `None`, without notifying the
  /// backing store.
  fn clear(&self, ctx: &OperationContext, keys: Option<Vec<K>>) -> GridFuture<()>;

  /// Clears `keys` on this node only.
  fn clear_locally(&self, ctx: &OperationContext, keys: &[K]);

  fn invoke(&self, ctx: &OperationContext, key: K, processor: EntryProcessor<K, V>) -> GridFuture<()>;

  fn invoke_all(
    &self,
    ctx: &OperationContext,
    keys: Vec<K>,
    processor: SharedEntryProcessor<K, V>,
  ) -> GridFuture<()>;

  fn size(&self, ctx: &OperationContext, modes: &[PeekMode]) -> GridFuture<usize>;

  fn local_size(&self, ctx: &OperationContext, modes: &[PeekMode]) -> Result<usize, GridError>;

  fn local_peek(&self, ctx: &OperationContext, key: &K, modes: &[PeekMode]) -> Result<Option<V>, GridError>;

  fn local_entries(&self, ctx: &OperationContext, modes: &[PeekMode]) -> Result<Vec<(K, V)>, GridError>;

  /// Every entry visible to this node, used for whole-cache iteration.
  fn entries(&self, ctx: &OperationContext) -> Result<Vec<(K, V)>, GridError>;

  fn random_entry(&self, ctx: &OperationContext) -> Option<(K, V)>;

  fn evict_all(&self, ctx: &OperationContext, keys: &[K]);

  /// Moves `keys` from the swap tier back into memory.
  fn promote_all(&self, ctx: &OperationContext, keys: &[K]) -> Result<(), GridError>;

  /// Loads the whole cache from the backing store on every node.
  fn load_cache(
    &self,
    ctx: &OperationContext,
    filter: Option<EntryPredicate<K, V>>,
    args: Vec<SqlValue>,
  ) -> GridFuture<()>;

  /// Loads the whole cache from the backing store on this node only.
  fn local_load_cache(
    &self,
    ctx: &OperationContext,
    filter: Option<EntryPredicate<K, V>>,
    args: Vec<SqlValue>,
  ) -> GridFuture<()>;

  /// Loads `keys` from the backing store, overwriting cached values only when
  /// `replace_existing` is set.
  fn load_all(&self, ctx: &OperationContext, keys: Vec<K>, replace_existing: bool) -> GridFuture<()>;
}

/// Cache-level lifecycle operations provided by the grid.
pub trait CacheLifecycle: Send + Sync {
  /// Stops the cache on this node. Resolves once the cache is stopped.
  ///
  /// Resolves to `true` only for the call that started the stop; concurrent
  /// or repeated calls resolve to `false`.
  fn close_cache(&self, name: &str) -> GridFuture<bool>;

  /// Stops the cache on every node and discards its data.
  ///
  /// Resolves to `true` only for the call that started the stop.
  fn destroy_cache(&self, name: &str) -> GridFuture<bool>;

  /// Whether the named cache has been stopped on this node.
  fn is_closed(&self, name: &str) -> bool;

  /// Triggers rebalancing of the named cache's partitions.
  fn rebalance(&self, name: &str) -> GridFuture<()>;
}
