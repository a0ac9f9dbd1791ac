//! The public cache handle.

use crate::config::CacheConfig;
use crate::context::{ExpiryPolicy, OperationContext, SubjectId};
use crate::dispatch::{Blocking, Deferred, Dispatch};
use crate::error::{CacheError, GridError, Result};
use crate::future::{CacheFuture, GridFuture};
use crate::gateway::{GatewayGuard, ProxyGate};
use crate::grid::{EntryPredicate, EntryProcessor, GridCache, MutableEntry, PeekMode, SharedEntryProcessor};
use crate::metrics::{self, MetricsSnapshot};
use crate::query::continuous::EntryListenerConfig;
use crate::query::router::QueryRouter;
use crate::query::{Query, QueryCursor, Row, SqlFieldsQuery, SqlValue};
use crate::runtime::CacheRuntime;

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

/// Notified once `load_all` finishes.
pub type CompletionListener = Box<dyn FnOnce(Result<()>) + Send + 'static>;

struct ProxyInner<K, V> {
  runtime: Arc<CacheRuntime<K, V>>,
  delegate: Arc<dyn GridCache<K, V>>,
  op_ctx: OperationContext,
  lock: bool,
  gate: ProxyGate,
}

impl<K, V> ProxyInner<K, V> {
  fn derive(&self, op_ctx: OperationContext, lock: bool) -> Self {
    Self {
      runtime: self.runtime.clone(),
      delegate: self.delegate.clone(),
      op_ctx,
      lock,
      gate: ProxyGate::new(self.runtime.gateway.clone()),
    }
  }
}

/// A handle on one cache.
///
/// Every operation is admitted by the cache's gateway, runs with this proxy's
/// [`OperationContext`] and is forwarded to the grid. The dispatch mode `M`
/// decides what dual-mode operations return: the value itself for
/// [`Blocking`], a [`CacheFuture`] for [`Deferred`].
///
/// Proxies are cheap to clone; clones share their overlay and their closed
/// state. The `with_*` methods derive new proxies and never modify this one.
pub struct CacheProxy<K, V, M = Blocking> {
  inner: Arc<ProxyInner<K, V>>,
  _mode: PhantomData<M>,
}

/// A proxy whose dual-mode operations return futures.
pub type AsyncCacheProxy<K, V> = CacheProxy<K, V, Deferred>;

impl<K, V, M> Clone for CacheProxy<K, V, M> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
      _mode: PhantomData,
    }
  }
}

impl<K, V, M: Dispatch> fmt::Debug for CacheProxy<K, V, M> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheProxy")
      .field("name", &self.inner.runtime.config.name)
      .field("deferred", &M::DEFERRED)
      .field("lock", &self.inner.lock)
      .field("context", &self.inner.op_ctx)
      .field("closed", &self.inner.gate.is_poisoned())
      .finish_non_exhaustive()
  }
}

impl<K, V> CacheProxy<K, V, Blocking>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  /// Creates a blocking proxy with an empty overlay.
  pub fn new(runtime: Arc<CacheRuntime<K, V>>) -> Self {
    let lock = runtime.config.locking;
    let gate = ProxyGate::new(runtime.gateway.clone());
    Self {
      inner: Arc::new(ProxyInner {
        delegate: runtime.delegate.clone(),
        runtime,
        op_ctx: OperationContext::new(),
        lock,
        gate,
      }),
      _mode: PhantomData,
    }
  }
}

impl<K, V, M> CacheProxy<K, V, M>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  M: Dispatch,
{
  // --- Admission ---

  fn enter(&self) -> Result<GatewayGuard<'_>> {
    let inner = &*self.inner;
    match inner.gate.enter(&inner.op_ctx, inner.lock) {
      Ok(guard) => {
        metrics::bump(&inner.runtime.metrics.admitted);
        Ok(guard)
      }
      Err(e) => {
        metrics::bump(&inner.runtime.metrics.rejected);
        Err(e)
      }
    }
  }

  /// Runs a dual-mode operation inside the gateway bracket.
  fn dispatch<T, F>(&self, call: F) -> Result<M::Output<T>>
  where
    T: Send + 'static,
    F: FnOnce(&dyn GridCache<K, V>, &OperationContext) -> GridFuture<T>,
  {
    let guard = self.enter()?;
    let future = call(&*self.inner.delegate, guard.context());
    let counter = if M::DEFERRED {
      &self.inner.runtime.metrics.deferred_dispatches
    } else {
      &self.inner.runtime.metrics.blocking_dispatches
    };
    metrics::bump(counter);
    // Blocking waits here, so the operation stays admitted until it is done.
    let output = M::complete(future);
    drop(guard);
    output
  }

  /// Runs a node-local operation inside the gateway bracket.
  fn guarded<R, F>(&self, call: F) -> Result<R>
  where
    F: FnOnce(&dyn GridCache<K, V>, &OperationContext) -> std::result::Result<R, GridError>,
  {
    let guard = self.enter()?;
    Ok(call(&*self.inner.delegate, guard.context())?)
  }

  fn with_inner(&self, inner: ProxyInner<K, V>) -> Self {
    Self {
      inner: Arc::new(inner),
      _mode: PhantomData,
    }
  }

  /// Derives a proxy with `op_ctx`, or returns a clone of this one if the
  /// overlay would not change.
  fn derive_context(&self, op_ctx: OperationContext) -> Result<Self> {
    let _guard = self.enter()?;
    if op_ctx == self.inner.op_ctx {
      return Ok(self.clone());
    }
    Ok(self.with_inner(self.inner.derive(op_ctx, self.inner.lock)))
  }

  // --- Derivation ---

  /// Operations through the returned proxy bypass the backing store.
  pub fn with_skip_store(&self) -> Result<Self> {
    self.derive_context(self.inner.op_ctx.with_skip_store())
  }

  /// Operations through the returned proxy are not retried on topology changes.
  pub fn with_no_retries(&self) -> Result<Self> {
    self.derive_context(self.inner.op_ctx.with_no_retries())
  }

  /// Entries written through the returned proxy use `policy`.
  pub fn with_expiry_policy(&self, policy: ExpiryPolicy) -> Result<Self> {
    self.derive_context(self.inner.op_ctx.with_expiry_policy(policy))
  }

  /// Queries through the returned proxy keep values in their stored form.
  pub fn with_keep_raw(&self) -> Result<Self> {
    self.derive_context(self.inner.op_ctx.with_keep_raw())
  }

  /// Operations through the returned proxy are authorized as `subject`.
  pub fn with_subject_id(&self, subject: SubjectId) -> Result<Self> {
    self.derive_context(self.inner.op_ctx.with_subject_id(subject))
  }

  /// A proxy that does (`true`) or does not (`false`) count its operations
  /// as in flight.
  ///
  /// A non-locking proxy must only be used while the caller already holds
  /// an admission for the same cache, otherwise a concurrent close may stop
  /// the cache underneath it.
  pub fn with_locking(&self, lock: bool) -> Self {
    if lock == self.inner.lock {
      return self.clone();
    }
    self.with_inner(self.inner.derive(self.inner.op_ctx.clone(), lock))
  }

  /// The same proxy with dual-mode operations returning futures.
  pub fn with_async(&self) -> CacheProxy<K, V, Deferred> {
    CacheProxy {
      inner: self.inner.clone(),
      _mode: PhantomData,
    }
  }

  /// The same proxy with dual-mode operations blocking until done.
  pub fn with_sync(&self) -> CacheProxy<K, V, Blocking> {
    CacheProxy {
      inner: self.inner.clone(),
      _mode: PhantomData,
    }
  }

  // --- Introspection ---

  pub fn name(&self) -> &str {
    &self.inner.runtime.config.name
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.runtime.config
  }

  pub fn operation_context(&self) -> &OperationContext {
    &self.inner.op_ctx
  }

  pub fn is_async(&self) -> bool {
    M::DEFERRED
  }

  pub fn is_locking(&self) -> bool {
    self.inner.lock
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.inner.runtime.metrics.snapshot()
  }

  // --- Reads ---

  pub fn get(&self, key: K) -> Result<M::Output<Option<V>>> {
    self.dispatch(|d, ctx| d.get(ctx, key))
  }

  pub fn get_all(&self, keys: Vec<K>) -> Result<M::Output<HashMap<K, V>>> {
    self.dispatch(|d, ctx| d.get_all(ctx, keys))
  }

  pub fn contains_key(&self, key: K) -> Result<M::Output<bool>> {
    self.dispatch(|d, ctx| d.contains_key(ctx, key))
  }

  pub fn contains_keys(&self, keys: Vec<K>) -> Result<M::Output<bool>> {
    self.dispatch(|d, ctx| d.contains_keys(ctx, keys))
  }

  /// Counts entries across the grid.
  pub fn size(&self, modes: &[PeekMode]) -> Result<M::Output<usize>> {
    self.dispatch(|d, ctx| d.size(ctx, modes))
  }

  // --- Writes ---

  pub fn put(&self, key: K, value: V) -> Result<M::Output<()>> {
    self.dispatch(|d, ctx| d.put(ctx, key, value).map(|_| ()))
  }

  pub fn get_and_put(&self, key: K, value: V) -> Result<M::Output<Option<V>>> {
    self.dispatch(|d, ctx| d.get_and_put(ctx, key, value))
  }

  pub fn put_all(&self, entries: HashMap<K, V>) -> Result<M::Output<()>> {
    self.dispatch(|d, ctx| d.put_all(ctx, entries))
  }

  pub fn put_if_absent(&self, key: K, value: V) -> Result<M::Output<bool>> {
    self.dispatch(|d, ctx| d.put_if_absent(ctx, key, value))
  }

  pub fn get_and_put_if_absent(&self, key: K, value: V) -> Result<M::Output<Option<V>>> {
    self.dispatch(|d, ctx| d.get_and_put_if_absent(ctx, key, value))
  }

  pub fn remove(&self, key: K) -> Result<M::Output<bool>> {
    self.dispatch(|d, ctx| d.remove(ctx, key))
  }

  /// Removes `key` only if it is mapped to `expected`.
  pub fn remove_exact(&self, key: K, expected: V) -> Result<M::Output<bool>> {
    self.dispatch(|d, ctx| d.remove_exact(ctx, key, expected))
  }

  pub fn get_and_remove(&self, key: K) -> Result<M::Output<Option<V>>> {
    self.dispatch(|d, ctx| d.get_and_remove(ctx, key))
  }

  pub fn replace(&self, key: K, value: V) -> Result<M::Output<bool>> {
    self.dispatch(|d, ctx| d.replace(ctx, key, value))
  }

  /// Replaces the value of `key` only if it is mapped to `expected`.
  pub fn replace_exact(&self, key: K, expected: V, value: V) -> Result<M::Output<bool>> {
    self.dispatch(|d, ctx| d.replace_exact(ctx, key, expected, value))
  }

  pub fn get_and_replace(&self, key: K, value: V) -> Result<M::Output<Option<V>>> {
    self.dispatch(|d, ctx| d.get_and_replace(ctx, key, value))
  }

  pub fn remove_keys(&self, keys: Vec<K>) -> Result<M::Output<()>> {
    self.dispatch(|d, ctx| d.remove_all(ctx, Some(keys)))
  }

  pub fn remove_all(&self) -> Result<M::Output<()>> {
    self.dispatch(|d, ctx| d.remove_all(ctx, None))
  }

  /// Clears `key` without touching the backing store.
  pub fn clear_key(&self, key: K) -> Result<M::Output<()>> {
    self.dispatch(|d, ctx| d.clear(ctx, Some(vec![key])))
  }

  pub fn clear_keys(&self, keys: Vec<K>) -> Result<M::Output<()>> {
    self.dispatch(|d, ctx| d.clear(ctx, Some(keys)))
  }

  pub fn clear(&self) -> Result<M::Output<()>> {
    self.dispatch(|d, ctx| d.clear(ctx, None))
  }

  // --- Entry processors ---

  /// Applies `processor` atomically to the entry of `key` and returns what
  /// it returned.
  pub fn invoke<T, F>(&self, key: K, processor: F) -> Result<M::Output<T>>
  where
    T: Send + 'static,
    F: for<'e> FnOnce(&mut MutableEntry<'e, K, V>) -> T + Send + 'static,
  {
    let slot = Arc::new(Mutex::new(None));
    let out = slot.clone();
    let erased: EntryProcessor<K, V> = Box::new(move |entry: &mut MutableEntry<'_, K, V>| {
      *out.lock() = Some(processor(entry));
    });
    self.dispatch(move |d, ctx| {
      d.invoke(ctx, key, erased).then(move |outcome| {
        outcome?;
        slot
          .lock()
          .take()
          .ok_or_else(|| GridError::EntryProcessor("processor was not applied".to_string()))
      })
    })
  }

  /// Applies `processor` to each of `keys`, returning the per-key results.
  pub fn invoke_all<T, F>(&self, keys: Vec<K>, processor: F) -> Result<M::Output<HashMap<K, T>>>
  where
    T: Send + 'static,
    F: for<'e> Fn(&mut MutableEntry<'e, K, V>) -> T + Send + Sync + 'static,
  {
    let results = Arc::new(Mutex::new(HashMap::with_capacity(keys.len())));
    let sink = results.clone();
    let erased: SharedEntryProcessor<K, V> = Arc::new(move |entry: &mut MutableEntry<'_, K, V>| {
      let value = processor(entry);
      sink.lock().insert(entry.key().clone(), value);
    });
    self.dispatch(move |d, ctx| {
      d.invoke_all(ctx, keys, erased)
        .then(move |outcome| outcome.map(|()| std::mem::take(&mut *results.lock())))
    })
  }

  // --- Loading ---

  /// Loads the cache from the backing store on every node.
  pub fn load_cache(&self, filter: Option<EntryPredicate<K, V>>, args: Vec<SqlValue>) -> Result<M::Output<()>> {
    self.dispatch(|d, ctx| d.load_cache(ctx, filter, args))
  }

  /// Loads the cache from the backing store on this node only.
  pub fn local_load_cache(
    &self,
    filter: Option<EntryPredicate<K, V>>,
    args: Vec<SqlValue>,
  ) -> Result<M::Output<()>> {
    self.dispatch(|d, ctx| d.local_load_cache(ctx, filter, args))
  }

  /// Starts loading `keys` from the backing store and returns immediately.
  /// `listener`, if any, is notified with the outcome.
  pub fn load_all(&self, keys: Vec<K>, replace_existing: bool, listener: Option<CompletionListener>) -> Result<()> {
    let future = {
      let guard = self.enter()?;
      self.inner.delegate.load_all(guard.context(), keys, replace_existing)
    };
    if let Some(listener) = listener {
      self
        .inner
        .runtime
        .spawner
        .spawn_blocking(Box::new(move || listener(future.wait().map_err(CacheError::from))));
    }
    Ok(())
  }

  // --- Node-local operations ---

  pub fn local_peek(&self, key: &K, modes: &[PeekMode]) -> Result<Option<V>> {
    self.guarded(|d, ctx| d.local_peek(ctx, key, modes))
  }

  pub fn local_size(&self, modes: &[PeekMode]) -> Result<usize> {
    self.guarded(|d, ctx| d.local_size(ctx, modes))
  }

  pub fn local_entries(&self, modes: &[PeekMode]) -> Result<Vec<(K, V)>> {
    self.guarded(|d, ctx| d.local_entries(ctx, modes))
  }

  pub fn local_clear(&self, key: &K) -> Result<()> {
    self.guarded(|d, ctx| {
      d.clear_locally(ctx, std::slice::from_ref(key));
      Ok(())
    })
  }

  pub fn local_clear_all(&self, keys: &[K]) -> Result<()> {
    self.guarded(|d, ctx| {
      d.clear_locally(ctx, keys);
      Ok(())
    })
  }

  pub fn local_evict(&self, keys: &[K]) -> Result<()> {
    self.guarded(|d, ctx| {
      d.evict_all(ctx, keys);
      Ok(())
    })
  }

  pub fn local_promote(&self, keys: &[K]) -> Result<()> {
    self.guarded(|d, ctx| d.promote_all(ctx, keys))
  }

  pub fn random_entry(&self) -> Result<Option<(K, V)>> {
    self.guarded(|d, ctx| Ok(d.random_entry(ctx)))
  }

  /// Iterates every entry visible to this node.
  pub fn iter(&self) -> Result<QueryCursor<(K, V)>> {
    let rows = self.guarded(|d, ctx| d.entries(ctx))?;
    Ok(QueryCursor::from_rows(rows))
  }

  // --- Queries ---

  /// Runs a scan, text, SPI, SQL or continuous query.
  ///
  /// Fields queries go through [`query_fields`](Self::query_fields).
  pub fn query(&self, query: impl Into<Query<K, V>>) -> Result<QueryCursor<(K, V)>> {
    let guard = self.enter()?;
    QueryRouter::new(&self.inner.runtime, guard.context()).query(query.into())
  }

  pub fn query_fields(&self, query: SqlFieldsQuery) -> Result<QueryCursor<Row>> {
    let guard = self.enter()?;
    QueryRouter::new(&self.inner.runtime, guard.context()).query_fields(query)
  }

  // --- Entry listeners ---

  /// Registers a standing listener for changes committed to this cache.
  ///
  /// Fails with [`CacheError::ListenerAlreadyRegistered`] if `config`, or a
  /// clone of it, is already registered.
  pub fn register_entry_listener(&self, config: &EntryListenerConfig<K, V>) -> Result<()> {
    let _guard = self.enter()?;
    let runtime = &self.inner.runtime;
    runtime
      .listeners
      .register(self.name(), config, runtime.continuous.as_ref(), &runtime.metrics)?;
    Ok(())
  }

  /// Stops a listener registered with
  /// [`register_entry_listener`](Self::register_entry_listener). Returns
  /// `false` if it is not registered.
  pub fn deregister_entry_listener(&self, config: &EntryListenerConfig<K, V>) -> Result<bool> {
    let _guard = self.enter()?;
    let runtime = &self.inner.runtime;
    runtime
      .listeners
      .deregister(self.name(), config.id(), runtime.continuous.as_ref(), &runtime.metrics)
  }

  // --- Lifecycle ---

  /// Stops the cache on this node and closes this proxy.
  ///
  /// Returns `true` only when this call stopped the cache. When the cache or
  /// this proxy is already closed, or another call is stopping the cache,
  /// returns `false`.
  pub fn close(&self) -> Result<bool> {
    let inner = &*self.inner;
    let future = {
      let Some(_guard) = inner.gate.enter_if_not_stopped(&inner.op_ctx, inner.lock) else {
        debug!(cache = %self.name(), "close ignored: cache already stopped");
        return Ok(false);
      };
      inner.runtime.lifecycle.close_cache(self.name())
    };
    // Waiting outside the bracket: the stop waits for in-flight operations.
    let performed = future.wait()?;
    self.close_proxy();
    Ok(performed)
  }

  /// Destroys the cache on every node and closes this proxy.
  ///
  /// Returns `true` only when this call destroyed the cache.
  pub fn destroy(&self) -> Result<bool> {
    let inner = &*self.inner;
    let future = {
      let Some(_guard) = inner.gate.enter_if_not_stopped(&inner.op_ctx, inner.lock) else {
        debug!(cache = %self.name(), "destroy ignored: cache already stopped");
        return Ok(false);
      };
      inner.runtime.lifecycle.destroy_cache(self.name())
    };
    let performed = future.wait()?;
    self.close_proxy();
    Ok(performed)
  }

  /// Whether the cache is closed, as far as this proxy can tell.
  pub fn is_closed(&self) -> bool {
    let inner = &*self.inner;
    match inner.gate.enter_if_not_stopped(&inner.op_ctx, inner.lock) {
      Some(_guard) => inner.runtime.lifecycle.is_closed(self.name()),
      None => true,
    }
  }

  /// Makes this proxy and its clones permanently inert without stopping
  /// the cache. Other proxies of the cache keep working.
  pub fn close_proxy(&self) {
    if self.inner.gate.poison() {
      info!(cache = %self.name(), "cache proxy closed");
    }
  }

  pub fn is_proxy_closed(&self) -> bool {
    self.inner.gate.is_poisoned()
  }

  /// Triggers rebalancing of the cache's partitions.
  pub fn rebalance(&self) -> CacheFuture<()> {
    CacheFuture::new(self.inner.runtime.lifecycle.rebalance(self.name()))
  }

  /// Whether this proxy shares its gateway with `other`.
  pub fn same_cache<M2: Dispatch>(&self, other: &CacheProxy<K, V, M2>) -> bool {
    Arc::ptr_eq(self.inner.gate.gateway(), other.inner.gate.gateway())
  }
}
