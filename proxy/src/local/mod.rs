//! A complete single-node grid behind the proxy.
//!
//! [`LocalGrid`] wires a sharded in-memory [`LocalCache`], its query engine,
//! continuous query processor and lifecycle into a [`CacheRuntime`]. It is
//! what the proxy runs against when no cluster is involved, and what the
//! crate's own tests exercise.

pub mod cache;
pub mod cluster;
pub mod continuous;
pub mod lifecycle;
pub mod query;
mod store;

pub use cache::{CacheStore, LocalCache};
pub use cluster::SingleNodeCluster;
pub use continuous::LocalContinuousQueries;
pub use lifecycle::LocalLifecycle;
pub use query::{LocalQueryEngine, SpiHandler, TextMatcher};

use crate::cluster::ClusterResolver;
use crate::config::CacheConfig;
use crate::dispatch::Blocking;
use crate::error::BuildError;
use crate::gateway::Gateway;
use crate::grid::EntryPredicate;
use crate::proxy::CacheProxy;
use crate::query::SqlValue;
use crate::runtime::{CacheRuntime, TaskSpawner, ThreadSpawner};
use crate::security::SecurityContext;

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::info;

const DEFAULT_SHARDS: usize = 16;
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A single-node cache together with everything its proxies need.
pub struct LocalGrid<K: Send, V: Send> {
  runtime: Arc<CacheRuntime<K, V>>,
  cache: Arc<LocalCache<K, V>>,
  continuous: Arc<LocalContinuousQueries<K, V>>,
}

impl<K: Send, V: Send> fmt::Debug for LocalGrid<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LocalGrid")
      .field("runtime", &self.runtime)
      .field("cache", &self.cache)
      .finish_non_exhaustive()
  }
}

impl<K, V> LocalGrid<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  pub fn builder(config: CacheConfig) -> LocalGridBuilder<K, V> {
    LocalGridBuilder::new(config)
  }

  /// A blocking proxy with an empty overlay.
  pub fn proxy(&self) -> CacheProxy<K, V, Blocking> {
    self.runtime.proxy()
  }

  pub fn runtime(&self) -> &Arc<CacheRuntime<K, V>> {
    &self.runtime
  }

  pub fn gateway(&self) -> &Arc<Gateway> {
    self.runtime.gateway()
  }

  pub fn cache(&self) -> &Arc<LocalCache<K, V>> {
    &self.cache
  }

  pub fn continuous(&self) -> &Arc<LocalContinuousQueries<K, V>> {
    &self.continuous
  }
}

/// Builds a [`LocalGrid`].
pub struct LocalGridBuilder<K: Send, V: Send> {
  config: CacheConfig,
  store: Option<Arc<dyn CacheStore<K, V>>>,
  text_matcher: Option<TextMatcher<K, V>>,
  spi_handler: Option<SpiHandler<K, V>>,
  security: Option<Arc<dyn SecurityContext>>,
  spawner: Option<Arc<dyn TaskSpawner>>,
  shards: usize,
  channel_capacity: usize,
}

impl<K: Send, V: Send> fmt::Debug for LocalGridBuilder<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LocalGridBuilder")
      .field("config", &self.config)
      .field("has_store", &self.store.is_some())
      .field("shards", &self.shards)
      .field("channel_capacity", &self.channel_capacity)
      .finish_non_exhaustive()
  }
}

impl<K, V> LocalGridBuilder<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  pub fn new(config: CacheConfig) -> Self {
    Self {
      config,
      store: None,
      text_matcher: None,
      spi_handler: None,
      security: None,
      spawner: None,
      shards: DEFAULT_SHARDS,
      channel_capacity: DEFAULT_CHANNEL_CAPACITY,
    }
  }

  /// The backing store used for read-through, write-through and loading.
  pub fn store(mut self, store: Arc<dyn CacheStore<K, V>>) -> Self {
    self.store = Some(store);
    self
  }

  /// Enables text queries.
  pub fn text_matcher<F>(mut self, matcher: F) -> Self
  where
    F: Fn(&str, &str, &K, &V) -> bool + Send + Sync + 'static,
  {
    self.text_matcher = Some(Arc::new(matcher));
    self
  }

  /// Enables SPI queries. The handler turns query arguments into a filter.
  pub fn spi_handler<F>(mut self, handler: F) -> Self
  where
    F: Fn(&[SqlValue]) -> Result<EntryPredicate<K, V>, crate::error::GridError> + Send + Sync + 'static,
  {
    self.spi_handler = Some(Arc::new(handler));
    self
  }

  pub fn security(mut self, security: Arc<dyn SecurityContext>) -> Self {
    self.security = Some(security);
    self
  }

  pub fn spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
    self.spawner = Some(spawner);
    self
  }

  /// Number of shards, which are also the cache's partitions.
  pub fn shards(mut self, shards: usize) -> Self {
    self.shards = shards;
    self
  }

  /// Capacity of each continuous query's event channel.
  pub fn channel_capacity(mut self, capacity: usize) -> Self {
    self.channel_capacity = capacity;
    self
  }

  pub fn build(self) -> Result<LocalGrid<K, V>, BuildError> {
    self.config.validate()?;
    if self.shards == 0 {
      return Err(BuildError::InvalidConfig("shards must be positive".into()));
    }
    if (self.config.read_through || self.config.write_through) && self.store.is_none() {
      return Err(BuildError::MissingCollaborator("cache store"));
    }

    let name = self.config.name.clone();
    let cluster = SingleNodeCluster::new();
    let continuous = Arc::new(LocalContinuousQueries::new(cluster.local_node(), self.channel_capacity));
    let cache = Arc::new(LocalCache::new(
      Arc::from(name.as_str()),
      self.shards,
      self.store,
      self.config.read_through,
      self.config.write_through,
      continuous.clone(),
    ));
    let gateway = Arc::new(Gateway::new(name.as_str()));
    let spawner: Arc<dyn TaskSpawner> = self
      .spawner
      .unwrap_or_else(|| Arc::new(ThreadSpawner::named(format!("fibre-proxy-{name}"))));

    let queries = LocalQueryEngine::new(cache.clone(), cluster.local_node(), self.text_matcher, self.spi_handler);
    let lifecycle = LocalLifecycle::new(gateway.clone(), spawner.clone(), cache.clone(), continuous.clone());

    let mut builder = CacheRuntime::<K, V>::builder(self.config)
      .gateway(gateway)
      .delegate(cache.clone())
      .query_engine(Arc::new(queries))
      .continuous_queries(continuous.clone())
      .cluster(Arc::new(cluster))
      .lifecycle(Arc::new(lifecycle))
      .spawner(spawner);
    if let Some(security) = self.security {
      builder = builder.security(security);
    }
    let runtime = builder.build()?;

    info!(cache = %name, shards = self.shards, "local grid started");
    Ok(LocalGrid {
      runtime,
      cache,
      continuous,
    })
  }
}
