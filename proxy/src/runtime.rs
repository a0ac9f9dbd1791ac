//! The per-cache runtime shared by every proxy of one cache.

use crate::cluster::ClusterResolver;
use crate::config::CacheConfig;
use crate::dispatch::Blocking;
use crate::error::BuildError;
use crate::gateway::Gateway;
use crate::grid::{CacheLifecycle, GridCache};
use crate::metrics::ProxyMetrics;
use crate::proxy::CacheProxy;
use crate::query::continuous::{ContinuousQueries, ListenerRegistry};
use crate::query::engine::QueryEngine;
use crate::security::{AllowAll, SecurityContext};

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::thread;

use tracing::error;

/// A job run off the caller's thread.
pub type BlockingJob = Box<dyn FnOnce() + Send + 'static>;

/// A trait for running blocking work off the calling thread.
pub trait TaskSpawner: Send + Sync + 'static {
  /// Runs `job` on some other thread. The job may block.
  ///
  /// A spawner that cannot start the job drops it and never runs it on the
  /// calling thread. Jobs complete a promise, so dropping one resolves its
  /// future with [`GridError::Abandoned`](crate::GridError::Abandoned).
  fn spawn_blocking(&self, job: BlockingJob);
}

/// Runs every job on a freshly spawned, named OS thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadSpawner {
  name: Option<String>,
}

impl ThreadSpawner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Names the threads this spawner creates.
  pub fn named(name: impl Into<String>) -> Self {
    Self { name: Some(name.into()) }
  }
}

impl TaskSpawner for ThreadSpawner {
  fn spawn_blocking(&self, job: BlockingJob) {
    let mut builder = thread::Builder::new();
    if let Some(name) = &self.name {
      builder = builder.name(name.clone());
    }
    // On failure the builder drops the job along with its promise.
    if let Err(e) = builder.spawn(job) {
      error!(error = %e, "failed to spawn worker thread, job abandoned");
    }
  }
}

#[cfg(feature = "tokio")]
pub struct TokioSpawner(tokio::runtime::Handle);

#[cfg(feature = "tokio")]
impl TokioSpawner {
  /// Creates a spawner that uses the current Tokio runtime context.
  /// Panics if called outside of a Tokio runtime.
  pub fn new() -> Self {
    Self(tokio::runtime::Handle::current())
  }

  pub fn from_handle(handle: tokio::runtime::Handle) -> Self {
    Self(handle)
  }
}

#[cfg(feature = "tokio")]
impl TaskSpawner for TokioSpawner {
  fn spawn_blocking(&self, job: BlockingJob) {
    // Fire-and-forget; the job reports its own outcome.
    drop(self.0.spawn_blocking(job));
  }
}

/// Everything a proxy needs besides its own overlay: the cache's gateway,
/// configuration and grid collaborators.
pub struct CacheRuntime<K, V> {
  pub(crate) config: CacheConfig,
  pub(crate) gateway: Arc<Gateway>,
  pub(crate) delegate: Arc<dyn GridCache<K, V>>,
  pub(crate) queries: Arc<dyn QueryEngine<K, V>>,
  pub(crate) continuous: Arc<dyn ContinuousQueries<K, V>>,
  pub(crate) security: Arc<dyn SecurityContext>,
  pub(crate) cluster: Arc<dyn ClusterResolver>,
  pub(crate) lifecycle: Arc<dyn CacheLifecycle>,
  pub(crate) spawner: Arc<dyn TaskSpawner>,
  pub(crate) metrics: Arc<ProxyMetrics>,
  pub(crate) listeners: ListenerRegistry,
}

impl<K, V> fmt::Debug for CacheRuntime<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheRuntime")
      .field("name", &self.config.name)
      .field("mode", &self.config.mode)
      .field("gateway", &self.gateway)
      .finish_non_exhaustive()
  }
}

impl<K, V> CacheRuntime<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub fn builder(config: CacheConfig) -> CacheRuntimeBuilder<K, V> {
    CacheRuntimeBuilder::new(config)
  }

  /// Creates a blocking proxy with an empty overlay.
  pub fn proxy(self: &Arc<Self>) -> CacheProxy<K, V, Blocking> {
    CacheProxy::new(self.clone())
  }
}

impl<K, V> CacheRuntime<K, V> {
  pub fn name(&self) -> &str {
    &self.config.name
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  pub fn gateway(&self) -> &Arc<Gateway> {
    &self.gateway
  }

  pub fn metrics(&self) -> &Arc<ProxyMetrics> {
    &self.metrics
  }

  /// Whether this node belongs to a replicated cache's data nodes.
  pub(crate) fn is_replicated_data_node(&self) -> bool {
    self.config.mode == crate::config::CacheMode::Replicated && self.cluster.is_data_node(&self.config.name)
  }
}

/// A builder for a [`CacheRuntime`].
pub struct CacheRuntimeBuilder<K, V> {
  config: CacheConfig,
  gateway: Option<Arc<Gateway>>,
  delegate: Option<Arc<dyn GridCache<K, V>>>,
  queries: Option<Arc<dyn QueryEngine<K, V>>>,
  continuous: Option<Arc<dyn ContinuousQueries<K, V>>>,
  security: Option<Arc<dyn SecurityContext>>,
  cluster: Option<Arc<dyn ClusterResolver>>,
  lifecycle: Option<Arc<dyn CacheLifecycle>>,
  spawner: Option<Arc<dyn TaskSpawner>>,
}

impl<K, V> fmt::Debug for CacheRuntimeBuilder<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheRuntimeBuilder")
      .field("config", &self.config)
      .field("has_delegate", &self.delegate.is_some())
      .finish_non_exhaustive()
  }
}

impl<K, V> CacheRuntimeBuilder<K, V> {
  pub fn new(config: CacheConfig) -> Self {
    Self {
      config,
      gateway: None,
      delegate: None,
      queries: None,
      continuous: None,
      security: None,
      cluster: None,
      lifecycle: None,
      spawner: None,
    }
  }

  /// Shares an existing gateway instead of creating one.
  pub fn gateway(mut self, gateway: Arc<Gateway>) -> Self {
    self.gateway = Some(gateway);
    self
  }

  pub fn delegate(mut self, delegate: Arc<dyn GridCache<K, V>>) -> Self {
    self.delegate = Some(delegate);
    self
  }

  pub fn query_engine(mut self, queries: Arc<dyn QueryEngine<K, V>>) -> Self {
    self.queries = Some(queries);
    self
  }

  pub fn continuous_queries(mut self, continuous: Arc<dyn ContinuousQueries<K, V>>) -> Self {
    self.continuous = Some(continuous);
    self
  }

  /// Defaults to [`AllowAll`].
  pub fn security(mut self, security: Arc<dyn SecurityContext>) -> Self {
    self.security = Some(security);
    self
  }

  pub fn cluster(mut self, cluster: Arc<dyn ClusterResolver>) -> Self {
    self.cluster = Some(cluster);
    self
  }

  pub fn lifecycle(mut self, lifecycle: Arc<dyn CacheLifecycle>) -> Self {
    self.lifecycle = Some(lifecycle);
    self
  }

  /// Defaults to a [`ThreadSpawner`].
  pub fn spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
    self.spawner = Some(spawner);
    self
  }

  pub fn build(self) -> Result<Arc<CacheRuntime<K, V>>, BuildError> {
    self.config.validate()?;

    let delegate = self.delegate.ok_or(BuildError::MissingDelegate)?;
    let queries = self.queries.ok_or(BuildError::MissingCollaborator("query engine"))?;
    let continuous = self
      .continuous
      .ok_or(BuildError::MissingCollaborator("continuous query processor"))?;
    let cluster = self.cluster.ok_or(BuildError::MissingCollaborator("cluster resolver"))?;
    let lifecycle = self.lifecycle.ok_or(BuildError::MissingCollaborator("cache lifecycle"))?;

    if delegate.name() != self.config.name {
      return Err(BuildError::InvalidConfig(format!(
        "delegate cache '{}' does not match configured cache '{}'",
        delegate.name(),
        self.config.name
      )));
    }

    let gateway = self
      .gateway
      .unwrap_or_else(|| Arc::new(Gateway::new(self.config.name.as_str())));
    let spawner = self
      .spawner
      .unwrap_or_else(|| Arc::new(ThreadSpawner::named(format!("fibre-proxy-{}", self.config.name))));

    Ok(Arc::new(CacheRuntime {
      config: self.config,
      gateway,
      delegate,
      queries,
      continuous,
      security: self.security.unwrap_or_else(|| Arc::new(AllowAll)),
      cluster,
      lifecycle,
      spawner,
      metrics: Arc::new(ProxyMetrics::new()),
      listeners: ListenerRegistry::new(),
    }))
  }
}
