//! Continuous query subscriptions.
//!
//! A continuous query registers a listener that is notified of every matching
//! update committed after the subscription was registered, optionally paired
//! with an initial query over the data already in the cache. Both halves are
//! exposed through one [`QueryCursor`]: iterating it yields the initial
//! results, closing (or dropping) it tears the subscription down.

use crate::cluster::ClusterGroup;
use crate::error::{CacheError, GridError, Result};
use crate::future::GridFuture;
use crate::metrics::{self, ProxyMetrics};
use crate::query::cursor::{QueryCursor, RowSource};
use crate::query::Query;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Identity of a registered continuous query routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutineId(Uuid);

impl RoutineId {
  pub fn random() -> Self {
    Self(Uuid::new_v4())
  }
}

impl fmt::Display for RoutineId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

/// Identity of an [`EntryListenerConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(Uuid);

impl ListenerId {
  pub fn random() -> Self {
    Self(Uuid::new_v4())
  }
}

impl fmt::Display for ListenerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
  Created,
  Updated,
  Removed,
  Expired,
}

/// A single committed change delivered to a continuous query listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryEvent<K, V> {
  event_type: EventType,
  key: K,
  value: Option<V>,
  old_value: Option<V>,
}

impl<K, V> CacheEntryEvent<K, V> {
  pub fn new(event_type: EventType, key: K, value: Option<V>, old_value: Option<V>) -> Self {
    Self {
      event_type,
      key,
      value,
      old_value,
    }
  }

  pub fn event_type(&self) -> EventType {
    self.event_type
  }

  pub fn key(&self) -> &K {
    &self.key
  }

  /// The value after the change. `None` for removals and expirations.
  pub fn value(&self) -> Option<&V> {
    self.value.as_ref()
  }

  pub fn old_value(&self) -> Option<&V> {
    self.old_value.as_ref()
  }
}

/// Receives batches of committed changes on the subscriber's node.
pub trait EntryUpdatedListener<K, V>: Send + Sync {
  fn on_updated(&self, events: Vec<CacheEntryEvent<K, V>>);
}

impl<K, V, F> EntryUpdatedListener<K, V> for F
where
  F: Fn(Vec<CacheEntryEvent<K, V>>) + Send + Sync,
{
  fn on_updated(&self, events: Vec<CacheEntryEvent<K, V>>) {
    self(events)
  }
}

/// Decides, where the change happens, whether an event is sent at all.
pub trait EntryEventFilter<K, V>: Send + Sync {
  fn evaluate(&self, event: &CacheEntryEvent<K, V>) -> bool;
}

impl<K, V, F> EntryEventFilter<K, V> for F
where
  F: Fn(&CacheEntryEvent<K, V>) -> bool + Send + Sync,
{
  fn evaluate(&self, event: &CacheEntryEvent<K, V>) -> bool {
    self(event)
  }
}

/// A continuous query descriptor.
pub struct ContinuousQuery<K, V> {
  pub(crate) local_listener: Option<Arc<dyn EntryUpdatedListener<K, V>>>,
  pub(crate) remote_filter: Option<Arc<dyn EntryEventFilter<K, V>>>,
  pub(crate) initial_query: Option<Box<Query<K, V>>>,
  pub(crate) page_size: Option<usize>,
  pub(crate) time_interval: Option<Duration>,
  pub(crate) auto_unsubscribe: Option<bool>,
  pub(crate) local: bool,
}

impl<K, V> ContinuousQuery<K, V> {
  pub fn new() -> Self {
    Self {
      local_listener: None,
      remote_filter: None,
      initial_query: None,
      page_size: None,
      time_interval: None,
      auto_unsubscribe: None,
      local: false,
    }
  }

  /// Sets the listener notified of matching updates. Required.
  pub fn local_listener(mut self, listener: impl EntryUpdatedListener<K, V> + 'static) -> Self {
    self.local_listener = Some(Arc::new(listener));
    self
  }

  pub fn remote_filter(mut self, filter: impl EntryEventFilter<K, V> + 'static) -> Self {
    self.remote_filter = Some(Arc::new(filter));
    self
  }

  /// Runs `query` once the subscription is registered; its results are what
  /// the returned cursor iterates. Must not itself be a continuous query.
  pub fn initial_query(mut self, query: impl Into<Query<K, V>>) -> Self {
    self.initial_query = Some(Box::new(query.into()));
    self
  }

  /// Number of events buffered before the listener is notified.
  pub fn page_size(mut self, page_size: usize) -> Self {
    self.page_size = Some(page_size);
    self
  }

  /// Maximum time a partial buffer waits before the listener is notified.
  pub fn time_interval(mut self, interval: Duration) -> Self {
    self.time_interval = Some(interval);
    self
  }

  /// Whether the routine is stopped automatically when the subscribing node
  /// leaves or the cache is closed.
  pub fn auto_unsubscribe(mut self, auto_unsubscribe: bool) -> Self {
    self.auto_unsubscribe = Some(auto_unsubscribe);
    self
  }

  /// Listen to updates on this node only.
  pub fn local(mut self, local: bool) -> Self {
    self.local = local;
    self
  }
}

impl<K, V> Default for ContinuousQuery<K, V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V> fmt::Debug for ContinuousQuery<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ContinuousQuery")
      .field("has_listener", &self.local_listener.is_some())
      .field("has_filter", &self.remote_filter.is_some())
      .field("initial_query", &self.initial_query)
      .field("page_size", &self.page_size)
      .field("time_interval", &self.time_interval)
      .field("auto_unsubscribe", &self.auto_unsubscribe)
      .field("local", &self.local)
      .finish()
  }
}

/// A standing entry listener, registered with
/// [`CacheProxy::register_entry_listener`](crate::CacheProxy::register_entry_listener).
///
/// Clones share the id, so a clone deregisters the listener its original
/// registered. Events are delivered one at a time, as soon as they commit.
pub struct EntryListenerConfig<K, V> {
  id: ListenerId,
  pub(crate) listener: Arc<dyn EntryUpdatedListener<K, V>>,
  pub(crate) filter: Option<Arc<dyn EntryEventFilter<K, V>>>,
}

impl<K, V> EntryListenerConfig<K, V> {
  pub fn new(listener: impl EntryUpdatedListener<K, V> + 'static) -> Self {
    Self {
      id: ListenerId::random(),
      listener: Arc::new(listener),
      filter: None,
    }
  }

  /// Only events accepted by `filter` reach the listener.
  pub fn filter(mut self, filter: impl EntryEventFilter<K, V> + 'static) -> Self {
    self.filter = Some(Arc::new(filter));
    self
  }

  pub fn id(&self) -> ListenerId {
    self.id
  }
}

impl<K, V> Clone for EntryListenerConfig<K, V> {
  fn clone(&self) -> Self {
    Self {
      id: self.id,
      listener: self.listener.clone(),
      filter: self.filter.clone(),
    }
  }
}

impl<K, V> fmt::Debug for EntryListenerConfig<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EntryListenerConfig")
      .field("id", &self.id)
      .field("has_filter", &self.filter.is_some())
      .finish()
  }
}

/// Everything a continuous query processor needs to register a routine.
pub struct Subscription<K, V> {
  pub listener: Arc<dyn EntryUpdatedListener<K, V>>,
  pub filter: Option<Arc<dyn EntryEventFilter<K, V>>>,
  pub page_size: usize,
  pub time_interval: Duration,
  pub auto_unsubscribe: bool,
  /// Nodes to listen on; `None` means every data node.
  pub target: Option<ClusterGroup>,
}

impl<K, V> fmt::Debug for Subscription<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("page_size", &self.page_size)
      .field("time_interval", &self.time_interval)
      .field("auto_unsubscribe", &self.auto_unsubscribe)
      .field("target", &self.target)
      .finish_non_exhaustive()
  }
}

/// The grid's continuous query processor.
pub trait ContinuousQueries<K, V>: Send + Sync {
  /// Registers a routine. Every update committed after this returns is
  /// delivered to the subscription's listener.
  fn execute_query(&self, cache: &str, subscription: Subscription<K, V>) -> Result<RoutineId, GridError>;

  /// Unregisters a routine. Resolves once no further events will be delivered.
  fn stop_routine(&self, id: RoutineId) -> GridFuture<()>;
}

/// The entry listeners registered on one cache, by the routine serving each.
#[derive(Debug, Default)]
pub(crate) struct ListenerRegistry {
  routines: Mutex<HashMap<ListenerId, RoutineId>>,
}

impl ListenerRegistry {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Registers a routine for `config`. Fails if its id is already registered.
  pub(crate) fn register<K, V>(
    &self,
    cache: &str,
    config: &EntryListenerConfig<K, V>,
    processor: &dyn ContinuousQueries<K, V>,
    metrics: &ProxyMetrics,
  ) -> Result<RoutineId> {
    // Held across registration so the same id can't race in twice.
    let mut routines = self.routines.lock();
    if routines.contains_key(&config.id) {
      return Err(CacheError::ListenerAlreadyRegistered(config.id));
    }
    let subscription = Subscription {
      listener: config.listener.clone(),
      filter: config.filter.clone(),
      page_size: 1,
      time_interval: Duration::ZERO,
      auto_unsubscribe: true,
      target: None,
    };
    let routine = processor.execute_query(cache, subscription)?;
    routines.insert(config.id, routine);
    metrics::bump(&metrics.subscriptions_started);
    info!(cache, listener = %config.id, routine = %routine, "entry listener registered");
    Ok(routine)
  }

  /// Stops the routine serving `id`. Returns `false` if `id` is not registered.
  pub(crate) fn deregister<K, V>(
    &self,
    cache: &str,
    id: ListenerId,
    processor: &dyn ContinuousQueries<K, V>,
    metrics: &ProxyMetrics,
  ) -> Result<bool> {
    let Some(routine) = self.routines.lock().remove(&id) else {
      debug!(cache, listener = %id, "entry listener is not registered");
      return Ok(false);
    };
    metrics::bump(&metrics.subscriptions_stopped);
    processor.stop_routine(routine).wait()?;
    info!(cache, listener = %id, routine = %routine, "entry listener deregistered");
    Ok(true)
  }
}

/// The cursor source of a live subscription.
pub(crate) struct ContinuousSession<K, V> {
  cache: Arc<str>,
  initial: Option<QueryCursor<(K, V)>>,
  routine: Option<RoutineId>,
  id: RoutineId,
  processor: Arc<dyn ContinuousQueries<K, V>>,
  metrics: Arc<ProxyMetrics>,
}

impl<K, V> ContinuousSession<K, V> {
  pub(crate) fn new(
    cache: Arc<str>,
    id: RoutineId,
    initial: Option<QueryCursor<(K, V)>>,
    processor: Arc<dyn ContinuousQueries<K, V>>,
    metrics: Arc<ProxyMetrics>,
  ) -> Self {
    Self {
      cache,
      initial,
      routine: Some(id),
      id,
      processor,
      metrics,
    }
  }
}

impl<K: Send, V: Send> RowSource<(K, V)> for ContinuousSession<K, V> {
  fn next_row(&mut self) -> Result<Option<(K, V)>> {
    match self.initial.as_mut() {
      Some(cursor) => cursor.next().transpose(),
      None => Ok(None),
    }
  }

  /// Closes the initial cursor, then stops the routine and waits for it.
  /// The routine is stopped even when closing the cursor fails.
  fn close(&mut self) -> Result<()> {
    let cursor = match self.initial.as_mut() {
      Some(cursor) => cursor.close(),
      None => Ok(()),
    };

    let routine = match self.routine.take() {
      Some(id) => {
        metrics::bump(&self.metrics.subscriptions_stopped);
        let stopped = self.processor.stop_routine(id).wait().map_err(CacheError::from);
        info!(cache = %self.cache, routine = %id, ok = stopped.is_ok(), "continuous query stopped");
        stopped
      }
      None => Ok(()),
    };

    match (cursor, routine) {
      (Ok(()), Ok(())) => Ok(()),
      (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
      (Err(cursor), Err(routine)) => {
        debug!(cache = %self.cache, "both continuous query teardown steps failed");
        Err(CacheError::Teardown {
          cursor: Box::new(cursor),
          routine: Box::new(routine),
        })
      }
    }
  }

  fn close_on_exhaustion(&self) -> bool {
    false
  }

  fn routine_id(&self) -> Option<RoutineId> {
    Some(self.id)
  }
}
