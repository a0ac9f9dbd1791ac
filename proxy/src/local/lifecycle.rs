use crate::error::GridError;
use crate::future::GridFuture;
use crate::gateway::Gateway;
use crate::grid::CacheLifecycle;
use crate::local::cache::LocalCache;
use crate::local::continuous::LocalContinuousQueries;
use crate::runtime::TaskSpawner;

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

/// Stops and destroys a [`LocalCache`].
///
/// Stopping runs on the spawner: it waits for the gateway to drain, so it
/// must never run on a thread that is itself inside the gateway.
pub struct LocalLifecycle<K: Send, V: Send> {
  gateway: Arc<Gateway>,
  spawner: Arc<dyn TaskSpawner>,
  cache: Arc<LocalCache<K, V>>,
  continuous: Arc<LocalContinuousQueries<K, V>>,
  /// Set by the first stop request; later requests resolve to `false`.
  stopping: Arc<AtomicBool>,
  closed: Arc<AtomicBool>,
}

impl<K: Send, V: Send> fmt::Debug for LocalLifecycle<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LocalLifecycle")
      .field("gateway", &self.gateway)
      .field("stopping", &self.stopping.load(Ordering::Acquire))
      .field("closed", &self.closed.load(Ordering::Acquire))
      .finish_non_exhaustive()
  }
}

impl<K, V> LocalLifecycle<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  pub(crate) fn new(
    gateway: Arc<Gateway>,
    spawner: Arc<dyn TaskSpawner>,
    cache: Arc<LocalCache<K, V>>,
    continuous: Arc<LocalContinuousQueries<K, V>>,
  ) -> Self {
    Self {
      gateway,
      spawner,
      cache,
      continuous,
      stopping: Arc::new(AtomicBool::new(false)),
      closed: Arc::new(AtomicBool::new(false)),
    }
  }

  fn stop(&self, name: &str, destroy: bool) -> GridFuture<bool> {
    if name != self.gateway.name() {
      return GridFuture::failed(GridError::Topology(format!("cache '{name}' is not started on this node")));
    }
    if self.stopping.swap(true, Ordering::AcqRel) {
      debug!(cache = %name, destroy, "stop already requested");
      return GridFuture::ready(false);
    }

    let claim = StopClaim {
      stopping: self.stopping.clone(),
      done: false,
    };
    let (future, promise) = GridFuture::pending();
    let gateway = self.gateway.clone();
    let cache = self.cache.clone();
    let continuous = self.continuous.clone();
    let closed = self.closed.clone();
    let name = name.to_string();

    self.spawner.spawn_blocking(Box::new(move || {
      debug!(cache = %name, destroy, "waiting for in-flight operations before stop");
      gateway.stop();
      closed.store(true, Ordering::Release);
      continuous.on_cache_stopped(&name);
      if destroy {
        cache.destroy();
        info!(cache = %name, "cache destroyed");
      } else {
        info!(cache = %name, "cache closed");
      }
      claim.keep();
      promise.complete(Ok(true));
    }));
    future
  }
}

/// Releases the stop claim if the stop job is dropped without running.
struct StopClaim {
  stopping: Arc<AtomicBool>,
  done: bool,
}

impl StopClaim {
  fn keep(mut self) {
    self.done = true;
  }
}

impl Drop for StopClaim {
  fn drop(&mut self) {
    if !self.done {
      self.stopping.store(false, Ordering::Release);
    }
  }
}

impl<K, V> CacheLifecycle for LocalLifecycle<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  fn close_cache(&self, name: &str) -> GridFuture<bool> {
    self.stop(name, false)
  }

  fn destroy_cache(&self, name: &str) -> GridFuture<bool> {
    self.stop(name, true)
  }

  fn is_closed(&self, name: &str) -> bool {
    name == self.gateway.name() && self.closed.load(Ordering::Acquire)
  }

  fn rebalance(&self, _name: &str) -> GridFuture<()> {
    // One node owns every partition.
    GridFuture::ready(())
  }
}
