use crate::context::OperationContext;
use crate::error::GridError;
use crate::future::GridFuture;
use crate::grid::{EntryOutcome, EntryPredicate, EntryProcessor, GridCache, MutableEntry, PeekMode, SharedEntryProcessor};
use crate::local::continuous::LocalContinuousQueries;
use crate::local::store::{ShardedStore, StoredValue};
use crate::query::continuous::{CacheEntryEvent, EventType};
use crate::query::SqlValue;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use rand::Rng;
use tracing::{debug, trace};

/// An external store a [`LocalCache`] reads through to and writes through to.
pub trait CacheStore<K, V>: Send + Sync {
  fn load(&self, key: &K) -> Result<Option<V>, GridError>;

  fn write(&self, key: &K, value: &V) -> Result<(), GridError>;

  fn delete(&self, key: &K) -> Result<(), GridError>;

  /// Streams every entry the store holds into `sink`.
  fn load_cache(&self, _args: &[SqlValue], _sink: &mut dyn FnMut(K, V)) -> Result<(), GridError> {
    Ok(())
  }
}

/// What a mutation decided to do with an entry.
enum Decision<V> {
  Keep,
  Set(V),
  Remove,
}

/// The storage tiers a peek mode selects.
#[derive(Debug, Clone, Copy)]
struct Tiers {
  heap: bool,
  swap: bool,
}

impl Tiers {
  fn of(modes: &[PeekMode]) -> Self {
    if modes.is_empty() {
      return Tiers { heap: true, swap: true };
    }
    let mut tiers = Tiers { heap: false, swap: false };
    for mode in modes {
      match mode {
        PeekMode::All | PeekMode::Primary => {
          tiers.heap = true;
          tiers.swap = true;
        }
        PeekMode::OnHeap => tiers.heap = true,
        PeekMode::OffHeap => tiers.swap = true,
        // A single node has no backups and no near cache.
        PeekMode::Backup | PeekMode::Near => {}
      }
    }
    tiers
  }
}

/// A position within a shard-by-shard scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ScanCursor {
  first_shard: usize,
  shard_index: usize,
  items_seen_in_shard: usize,
  items_seen_in_swap: usize,
  swap_done: bool,
}

impl ScanCursor {
  pub(crate) fn at_shard(shard_index: usize) -> Self {
    Self {
      first_shard: shard_index,
      shard_index,
      items_seen_in_shard: 0,
      items_seen_in_swap: 0,
      swap_done: false,
    }
  }
}

/// A single-node cache over a sharded in-memory map.
///
/// Entries evicted with [`GridCache::evict_all`] move to a swap tier and are
/// promoted back on access. The backing store, when configured, is bypassed
/// for operations whose overlay sets `skip_store`.
pub struct LocalCache<K: Send, V: Send> {
  name: Arc<str>,
  store: ShardedStore<K, V>,
  swap: Mutex<HashMap<K, StoredValue<V>>>,
  backing: Option<Arc<dyn CacheStore<K, V>>>,
  read_through: bool,
  write_through: bool,
  events: Arc<LocalContinuousQueries<K, V>>,
}

impl<K: Send, V: Send> fmt::Debug for LocalCache<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LocalCache")
      .field("name", &self.name)
      .field("store", &self.store)
      .field("has_backing_store", &self.backing.is_some())
      .finish_non_exhaustive()
  }
}

impl<K, V> LocalCache<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  pub(crate) fn new(
    name: Arc<str>,
    num_shards: usize,
    backing: Option<Arc<dyn CacheStore<K, V>>>,
    read_through: bool,
    write_through: bool,
    events: Arc<LocalContinuousQueries<K, V>>,
  ) -> Self {
    Self {
      name,
      store: ShardedStore::new(num_shards.max(1), ahash::RandomState::new()),
      swap: Mutex::new(HashMap::new()),
      backing,
      read_through,
      write_through,
      events,
    }
  }

  pub(crate) fn num_partitions(&self) -> usize {
    self.store.num_shards()
  }

  /// Whether no entry is held in memory or swap, expired ones included.
  pub fn is_empty(&self) -> bool {
    self.store.len() == 0 && self.swap.lock().is_empty()
  }

  fn backing_for(&self, ctx: &OperationContext, enabled: bool) -> Option<&dyn CacheStore<K, V>> {
    if !enabled || ctx.skip_store() {
      return None;
    }
    self.backing.as_deref()
  }

  /// Reads `key`, promoting it from swap and reading through on a miss.
  fn read(&self, ctx: &OperationContext, key: &K) -> Result<Option<V>, GridError> {
    let access_ttl = ctx.expiry_policy().and_then(|p| p.access);
    let now = Instant::now();
    let mut expired = false;

    {
      let shard = self.store.shard_for(key);
      if access_ttl.is_some() {
        let mut guard = shard.write();
        if let Some(stored) = guard.get_mut(key) {
          if stored.is_expired(now) {
            expired = true;
          } else {
            stored.touch(access_ttl);
            return Ok(Some(stored.value.clone()));
          }
        }
      } else {
        let guard = shard.read();
        if let Some(stored) = guard.get(key) {
          if stored.is_expired(now) {
            expired = true;
          } else {
            return Ok(Some(stored.value.clone()));
          }
        }
      }
    }

    if expired {
      self.purge_expired(key);
    }

    if let Some(value) = self.promote_one(key) {
      return Ok(Some(value));
    }

    if let Some(backing) = self.backing_for(ctx, self.read_through) {
      if let Some(value) = backing.load(key)? {
        trace!(cache = %self.name, "read-through hit");
        let loaded = value.clone();
        self.update(ctx, key.clone(), false, move |_, current| match current {
          Some(_) => (Decision::Keep, ()),
          None => (Decision::Set(loaded), ()),
        })?;
        return Ok(Some(value));
      }
    }
    Ok(None)
  }

  /// Looks `key` up in the selected tiers without side effects.
  fn peek(&self, key: &K, tiers: Tiers) -> Option<V> {
    let now = Instant::now();
    if tiers.heap {
      if let Some(stored) = self.store.shard_for(key).read().get(key) {
        if !stored.is_expired(now) {
          return Some(stored.value.clone());
        }
      }
    }
    if tiers.swap {
      if let Some(stored) = self.swap.lock().get(key) {
        if !stored.is_expired(now) {
          return Some(stored.value.clone());
        }
      }
    }
    None
  }

  fn purge_expired(&self, key: &K) {
    let removed = {
      let mut guard = self.store.shard_for(key).write();
      let expired = guard.get(key).is_some_and(|stored| stored.is_expired(Instant::now()));
      if expired {
        guard.remove(key)
      } else {
        None
      }
    };
    if let Some(stored) = removed {
      self.publish(CacheEntryEvent::new(EventType::Expired, key.clone(), None, Some(stored.value)));
    }
  }

  fn promote_one(&self, key: &K) -> Option<V> {
    let mut guard = self.store.shard_for(key).write();
    if let Some(stored) = guard.get(key) {
      return Some(stored.value.clone());
    }
    let stored = self.swap.lock().remove(key)?;
    if stored.is_expired(Instant::now()) {
      return None;
    }
    let value = stored.value.clone();
    guard.insert(key.clone(), stored);
    Some(value)
  }

  /// Atomically applies `decide` to the current value of `key`.
  ///
  /// With `propagate`, the change is written to the backing store first and
  /// a store failure leaves the entry untouched. Listeners are notified after
  /// the shard lock is released.
  fn update<R>(
    &self,
    ctx: &OperationContext,
    key: K,
    propagate: bool,
    decide: impl FnOnce(&K, Option<&V>) -> (Decision<V>, R),
  ) -> Result<R, GridError> {
    let policy = ctx.expiry_policy().copied();
    let backing = if propagate {
      self.backing_for(ctx, self.write_through)
    } else {
      None
    };
    let now = Instant::now();
    let mut events = Vec::with_capacity(2);

    let result = {
      let mut guard = self.store.shard_for(&key).write();

      // Values parked in swap take part in the decision like in-memory ones.
      if !guard.contains_key(&key) {
        if let Some(stored) = self.swap.lock().remove(&key) {
          guard.insert(key.clone(), stored);
        }
      }

      if guard.get(&key).is_some_and(|stored| stored.is_expired(now)) {
        if let Some(stale) = guard.remove(&key) {
          events.push(CacheEntryEvent::new(EventType::Expired, key.clone(), None, Some(stale.value)));
        }
      }

      let (decision, result) = decide(&key, guard.get(&key).map(|stored| &stored.value));
      match decision {
        Decision::Keep => {}
        Decision::Set(value) => {
          if let Some(backing) = backing {
            backing.write(&key, &value)?;
          }
          match guard.get_mut(&key) {
            Some(stored) => {
              let old = std::mem::replace(&mut stored.value, value.clone());
              stored.touch(policy.and_then(|p| p.update));
              events.push(CacheEntryEvent::new(EventType::Updated, key.clone(), Some(value), Some(old)));
            }
            None => {
              guard.insert(key.clone(), StoredValue::new(value.clone(), policy.and_then(|p| p.creation)));
              events.push(CacheEntryEvent::new(EventType::Created, key.clone(), Some(value), None));
            }
          }
        }
        Decision::Remove => {
          if let Some(backing) = backing {
            backing.delete(&key)?;
          }
          if let Some(stored) = guard.remove(&key) {
            events.push(CacheEntryEvent::new(EventType::Removed, key.clone(), None, Some(stored.value)));
          }
        }
      }
      result
    }; // Shard lock released here.

    for event in events {
      self.publish(event);
    }
    Ok(result)
  }

  fn publish(&self, event: CacheEntryEvent<K, V>) {
    self.events.publish(&self.name, event);
  }

  fn all_keys(&self) -> Vec<K> {
    let mut keys: Vec<K> = self
      .store
      .iter_shards()
      .flat_map(|shard| shard.read().keys().cloned().collect::<Vec<_>>())
      .collect();
    keys.extend(self.swap.lock().keys().cloned());
    keys
  }

  fn apply_processor(
    key: &K,
    current: Option<&V>,
    processor: impl FnOnce(&mut MutableEntry<'_, K, V>),
  ) -> (Decision<V>, ()) {
    let mut entry = MutableEntry::new(key, current.cloned());
    processor(&mut entry);
    let decision = match entry.into_outcome() {
      EntryOutcome::Unchanged => Decision::Keep,
      EntryOutcome::Set(value) => Decision::Set(value),
      EntryOutcome::Removed if current.is_some() => Decision::Remove,
      EntryOutcome::Removed => Decision::Keep,
    };
    (decision, ())
  }

  fn load_into(&self, ctx: &OperationContext, filter: Option<EntryPredicate<K, V>>, args: &[SqlValue]) -> Result<(), GridError> {
    let Some(backing) = self.backing_for(ctx, true) else {
      return Ok(());
    };
    let mut loaded = Vec::new();
    backing.load_cache(args, &mut |key, value| {
      if filter.as_ref().map_or(true, |f| f(&key, &value)) {
        loaded.push((key, value));
      }
    })?;
    debug!(cache = %self.name, entries = loaded.len(), "loaded cache from backing store");
    for (key, value) in loaded {
      self.update(ctx, key, false, move |_, _| (Decision::Set(value), ()))?;
    }
    Ok(())
  }

  /// Fetches up to `limit` live entries from `cursor` onwards, stopping at
  /// shard `end`. Holds one shard lock at a time.
  ///
  /// Once the shards are done the swap tier is scanned for entries whose key
  /// falls in the same shard range.
  pub(crate) fn scan_page(
    &self,
    cursor: &mut ScanCursor,
    end: usize,
    limit: usize,
    filter: Option<&EntryPredicate<K, V>>,
  ) -> VecDeque<(K, V)> {
    let now = Instant::now();
    let end = end.min(self.store.num_shards());
    let mut page = VecDeque::with_capacity(limit);

    while cursor.shard_index < end && page.len() < limit {
      let Some(shard) = self.store.shard(cursor.shard_index) else {
        break;
      };
      let guard = shard.read();
      if cursor.items_seen_in_shard >= guard.len() {
        cursor.shard_index += 1;
        cursor.items_seen_in_shard = 0;
        continue;
      }

      for (key, stored) in guard.iter().skip(cursor.items_seen_in_shard) {
        if page.len() >= limit {
          break;
        }
        cursor.items_seen_in_shard += 1;
        if stored.is_expired(now) {
          continue;
        }
        if filter.map_or(true, |f| f(key, &stored.value)) {
          page.push_back((key.clone(), stored.value.clone()));
        }
      }
    } // Lock on shard is released here

    if cursor.shard_index >= end && !cursor.swap_done && page.len() < limit {
      let swap = self.swap.lock();
      for (key, stored) in swap.iter().skip(cursor.items_seen_in_swap) {
        if page.len() >= limit {
          break;
        }
        cursor.items_seen_in_swap += 1;
        let shard = self.store.shard_index(key);
        if shard < cursor.first_shard || shard >= end || stored.is_expired(now) {
          continue;
        }
        if filter.map_or(true, |f| f(key, &stored.value)) {
          page.push_back((key.clone(), stored.value.clone()));
        }
      }
      cursor.swap_done = cursor.items_seen_in_swap >= swap.len();
    }

    page
  }

  /// Drops every entry, including swapped ones, without notifying anyone.
  pub(crate) fn destroy(&self) {
    for shard in self.store.iter_shards() {
      shard.write().clear();
    }
    self.swap.lock().clear();
  }

  fn ready<T: Send + 'static>(outcome: Result<T, GridError>) -> GridFuture<T> {
    GridFuture::from_result(outcome)
  }
}

impl<K, V> GridCache<K, V> for LocalCache<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  fn name(&self) -> &str {
    &self.name
  }

  fn get(&self, ctx: &OperationContext, key: K) -> GridFuture<Option<V>> {
    Self::ready(self.read(ctx, &key))
  }

  fn get_all(&self, ctx: &OperationContext, keys: Vec<K>) -> GridFuture<HashMap<K, V>> {
    let mut found = HashMap::with_capacity(keys.len());
    for key in keys {
      match self.read(ctx, &key) {
        Ok(Some(value)) => {
          found.insert(key, value);
        }
        Ok(None) => {}
        Err(e) => return GridFuture::failed(e),
      }
    }
    GridFuture::ready(found)
  }

  fn contains_key(&self, _ctx: &OperationContext, key: K) -> GridFuture<bool> {
    GridFuture::ready(self.peek(&key, Tiers::of(&[])).is_some())
  }

  fn contains_keys(&self, _ctx: &OperationContext, keys: Vec<K>) -> GridFuture<bool> {
    let tiers = Tiers::of(&[]);
    GridFuture::ready(keys.iter().all(|key| self.peek(key, tiers).is_some()))
  }

  fn put(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<bool> {
    Self::ready(self.update(ctx, key, true, |_, _| (Decision::Set(value), true)))
  }

  fn get_and_put(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<Option<V>> {
    Self::ready(self.update(ctx, key, true, |_, current| (Decision::Set(value), current.cloned())))
  }

  fn put_all(&self, ctx: &OperationContext, entries: HashMap<K, V>) -> GridFuture<()> {
    for (key, value) in entries {
      if let Err(e) = self.update(ctx, key, true, |_, _| (Decision::Set(value), ())) {
        return GridFuture::failed(e);
      }
    }
    GridFuture::ready(())
  }

  fn put_if_absent(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<bool> {
    Self::ready(self.update(ctx, key, true, |_, current| match current {
      Some(_) => (Decision::Keep, false),
      None => (Decision::Set(value), true),
    }))
  }

  fn get_and_put_if_absent(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<Option<V>> {
    Self::ready(self.update(ctx, key, true, |_, current| match current {
      Some(existing) => (Decision::Keep, Some(existing.clone())),
      None => (Decision::Set(value), None),
    }))
  }

  fn remove(&self, ctx: &OperationContext, key: K) -> GridFuture<bool> {
    Self::ready(self.update(ctx, key, true, |_, current| match current {
      Some(_) => (Decision::Remove, true),
      None => (Decision::Keep, false),
    }))
  }

  fn remove_exact(&self, ctx: &OperationContext, key: K, expected: V) -> GridFuture<bool> {
    Self::ready(self.update(ctx, key, true, |_, current| match current {
      Some(existing) if *existing == expected => (Decision::Remove, true),
      _ => (Decision::Keep, false),
    }))
  }

  fn get_and_remove(&self, ctx: &OperationContext, key: K) -> GridFuture<Option<V>> {
    Self::ready(self.update(ctx, key, true, |_, current| match current {
      Some(existing) => (Decision::Remove, Some(existing.clone())),
      None => (Decision::Keep, None),
    }))
  }

  fn replace(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<bool> {
    Self::ready(self.update(ctx, key, true, |_, current| match current {
      Some(_) => (Decision::Set(value), true),
      None => (Decision::Keep, false),
    }))
  }

  fn replace_exact(&self, ctx: &OperationContext, key: K, expected: V, value: V) -> GridFuture<bool> {
    Self::ready(self.update(ctx, key, true, |_, current| match current {
      Some(existing) if *existing == expected => (Decision::Set(value), true),
      _ => (Decision::Keep, false),
    }))
  }

  fn get_and_replace(&self, ctx: &OperationContext, key: K, value: V) -> GridFuture<Option<V>> {
    Self::ready(self.update(ctx, key, true, |_, current| match current {
      Some(existing) => (Decision::Set(value), Some(existing.clone())),
      None => (Decision::Keep, None),
    }))
  }

  fn remove_all(&self, ctx: &OperationContext, keys: Option<Vec<K>>) -> GridFuture<()> {
    let keys = keys.unwrap_or_else(|| self.all_keys());
    for key in keys {
      let removed = self.update(ctx, key, true, |_, current| match current {
        Some(_) => (Decision::Remove, ()),
        None => (Decision::Keep, ()),
      });
      if let Err(e) = removed {
        return GridFuture::failed(e);
      }
    }
    GridFuture::ready(())
  }

  fn clear(&self, ctx: &OperationContext, keys: Option<Vec<K>>) -> GridFuture<()> {
    match keys {
      Some(keys) => self.clear_locally(ctx, &keys),
      None => self.destroy(),
    }
    GridFuture::ready(())
  }

  fn clear_locally(&self, _ctx: &OperationContext, keys: &[K]) {
    for key in keys {
      self.store.shard_for(key).write().remove(key);
      self.swap.lock().remove(key);
    }
  }

  fn invoke(&self, ctx: &OperationContext, key: K, processor: EntryProcessor<K, V>) -> GridFuture<()> {
    Self::ready(self.update(ctx, key, true, |key, current| {
      Self::apply_processor(key, current, processor)
    }))
  }

  fn invoke_all(&self, ctx: &OperationContext, keys: Vec<K>, processor: SharedEntryProcessor<K, V>) -> GridFuture<()> {
    for key in keys {
      let applied = self.update(ctx, key, true, |key, current| {
        Self::apply_processor(key, current, |entry| processor(entry))
      });
      if let Err(e) = applied {
        return GridFuture::failed(e);
      }
    }
    GridFuture::ready(())
  }

  fn size(&self, ctx: &OperationContext, modes: &[PeekMode]) -> GridFuture<usize> {
    Self::ready(self.local_size(ctx, modes))
  }

  fn local_size(&self, _ctx: &OperationContext, modes: &[PeekMode]) -> Result<usize, GridError> {
    let tiers = Tiers::of(modes);
    let now = Instant::now();
    let mut count = 0;
    if tiers.heap {
      for shard in self.store.iter_shards() {
        count += shard.read().values().filter(|stored| !stored.is_expired(now)).count();
      }
    }
    if tiers.swap {
      count += self.swap.lock().values().filter(|stored| !stored.is_expired(now)).count();
    }
    Ok(count)
  }

  fn local_peek(&self, _ctx: &OperationContext, key: &K, modes: &[PeekMode]) -> Result<Option<V>, GridError> {
    Ok(self.peek(key, Tiers::of(modes)))
  }

  fn local_entries(&self, _ctx: &OperationContext, modes: &[PeekMode]) -> Result<Vec<(K, V)>, GridError> {
    let tiers = Tiers::of(modes);
    let now = Instant::now();
    let mut entries = Vec::new();
    if tiers.heap {
      for shard in self.store.iter_shards() {
        let guard = shard.read();
        entries.extend(
          guard
            .iter()
            .filter(|(_, stored)| !stored.is_expired(now))
            .map(|(key, stored)| (key.clone(), stored.value.clone())),
        );
      }
    }
    if tiers.swap {
      let swap = self.swap.lock();
      entries.extend(
        swap
          .iter()
          .filter(|(_, stored)| !stored.is_expired(now))
          .map(|(key, stored)| (key.clone(), stored.value.clone())),
      );
    }
    Ok(entries)
  }

  fn entries(&self, ctx: &OperationContext) -> Result<Vec<(K, V)>, GridError> {
    self.local_entries(ctx, &[PeekMode::All])
  }

  fn random_entry(&self, _ctx: &OperationContext) -> Option<(K, V)> {
    let mut rng = rand::rng();
    let shards = self.store.num_shards();
    let start = rng.random_range(0..shards);
    let now = Instant::now();

    (0..shards).find_map(|offset| {
      let shard = self.store.shard((start + offset) % shards)?;
      let guard = shard.read();
      guard
        .iter()
        .filter(|(_, stored)| !stored.is_expired(now))
        .choose(&mut rng)
        .map(|(key, stored)| (key.clone(), stored.value.clone()))
    })
  }

  fn evict_all(&self, _ctx: &OperationContext, keys: &[K]) {
    for key in keys {
      let mut guard = self.store.shard_for(key).write();
      if let Some(stored) = guard.remove(key) {
        self.swap.lock().insert(key.clone(), stored);
      }
    }
  }

  fn promote_all(&self, _ctx: &OperationContext, keys: &[K]) -> Result<(), GridError> {
    for key in keys {
      self.promote_one(key);
    }
    Ok(())
  }

  fn load_cache(&self, ctx: &OperationContext, filter: Option<EntryPredicate<K, V>>, args: Vec<SqlValue>) -> GridFuture<()> {
    Self::ready(self.load_into(ctx, filter, &args))
  }

  fn local_load_cache(
    &self,
    ctx: &OperationContext,
    filter: Option<EntryPredicate<K, V>>,
    args: Vec<SqlValue>,
  ) -> GridFuture<()> {
    Self::ready(self.load_into(ctx, filter, &args))
  }

  fn load_all(&self, ctx: &OperationContext, keys: Vec<K>, replace_existing: bool) -> GridFuture<()> {
    let Some(backing) = self.backing_for(ctx, true) else {
      return GridFuture::ready(());
    };
    for key in keys {
      let value = match backing.load(&key) {
        Ok(Some(value)) => value,
        Ok(None) => continue,
        Err(e) => return GridFuture::failed(e),
      };
      let loaded = self.update(ctx, key, false, |_, current| match current {
        Some(_) if !replace_existing => (Decision::Keep, ()),
        _ => (Decision::Set(value), ()),
      });
      if let Err(e) = loaded {
        return GridFuture::failed(e);
      }
    }
    GridFuture::ready(())
  }
}
