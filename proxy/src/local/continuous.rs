use crate::cluster::NodeId;
use crate::error::GridError;
use crate::future::GridFuture;
use crate::query::continuous::{
  CacheEntryEvent, ContinuousQueries, EntryEventFilter, EntryUpdatedListener, RoutineId, Subscription,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fibre::mpsc;
use fibre::TryRecvError;
use parking_lot::RwLock;
use tracing::{debug, info};

/// Longest a notifier sleeps while a partial page waits for its interval.
const POLL_SLICE: Duration = Duration::from_millis(5);

/// A registered routine as seen by the publishing side.
struct Routine<K: Send, V: Send> {
  cache: Arc<str>,
  filter: Option<Arc<dyn EntryEventFilter<K, V>>>,
  sender: mpsc::BoundedSender<CacheEntryEvent<K, V>>,
  auto_unsubscribe: bool,
  /// Whether this node is among the nodes the routine listens on.
  listening: bool,
}

/// Single-node continuous query processor.
///
/// Each routine gets a bounded channel and a notifier thread that hands
/// events to the listener in pages of `page_size`, flushing a partial page
/// once `time_interval` has passed since its first event.
pub struct LocalContinuousQueries<K: Send, V: Send> {
  routines: RwLock<HashMap<RoutineId, Routine<K, V>>>,
  local_node: NodeId,
  channel_capacity: usize,
}

impl<K: Send, V: Send> fmt::Debug for LocalContinuousQueries<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LocalContinuousQueries")
      .field("routines", &self.routines.read().len())
      .field("local_node", &self.local_node)
      .finish()
  }
}

impl<K, V> LocalContinuousQueries<K, V>
where
  K: Clone + Send + Sync + 'static,
  V: Clone + Send + Sync + 'static,
{
  pub(crate) fn new(local_node: NodeId, channel_capacity: usize) -> Self {
    Self {
      routines: RwLock::new(HashMap::new()),
      local_node,
      channel_capacity: channel_capacity.max(1),
    }
  }

  pub fn active_routines(&self) -> usize {
    self.routines.read().len()
  }

  /// Hands a committed change to every matching routine of `cache`.
  pub(crate) fn publish(&self, cache: &str, event: CacheEntryEvent<K, V>) {
    let routines = self.routines.read();
    for (id, routine) in routines.iter() {
      if !routine.listening || &*routine.cache != cache {
        continue;
      }
      if routine.filter.as_ref().is_some_and(|f| !f.evaluate(&event)) {
        continue;
      }
      if routine.sender.send(event.clone()).is_err() {
        debug!(routine = %id, "continuous query notifier is gone, dropping event");
      }
    }
  }

  /// Stops every auto-unsubscribing routine of `cache`.
  pub(crate) fn on_cache_stopped(&self, cache: &str) {
    let mut routines = self.routines.write();
    let before = routines.len();
    routines.retain(|_, routine| !(routine.auto_unsubscribe && &*routine.cache == cache));
    let stopped = before - routines.len();
    if stopped > 0 {
      info!(cache, stopped, "continuous queries unsubscribed on cache stop");
    }
  }

  fn spawn_notifier(
    id: RoutineId,
    receiver: mpsc::BoundedReceiver<CacheEntryEvent<K, V>>,
    listener: Arc<dyn EntryUpdatedListener<K, V>>,
    page_size: usize,
    interval: Duration,
  ) -> std::io::Result<()> {
    let page_size = page_size.max(1);
    thread::Builder::new()
      .name(format!("fibre-cq-{id}"))
      .spawn(move || {
        let mut page = Vec::with_capacity(page_size);
        let mut first_at = Instant::now();

        loop {
          if page.is_empty() || interval.is_zero() {
            match receiver.recv() {
              Ok(event) => {
                if page.is_empty() {
                  first_at = Instant::now();
                }
                page.push(event);
              }
              Err(_) => break,
            }
          } else {
            match receiver.try_recv() {
              Ok(event) => page.push(event),
              Err(TryRecvError::Empty) => {
                let elapsed = first_at.elapsed();
                if elapsed >= interval {
                  listener.on_updated(std::mem::take(&mut page));
                } else {
                  thread::park_timeout((interval - elapsed).min(POLL_SLICE));
                }
                continue;
              }
              Err(TryRecvError::Disconnected) => break,
            }
          }

          if page.len() >= page_size {
            listener.on_updated(std::mem::replace(&mut page, Vec::with_capacity(page_size)));
          }
        }

        // The routine was stopped; deliver what is buffered.
        if !page.is_empty() {
          listener.on_updated(page);
        }
        debug!(routine = %id, "continuous query notifier exited");
      })
      .map(|_| ())
  }
}

impl<K, V> ContinuousQueries<K, V> for LocalContinuousQueries<K, V>
where
  K: Clone + Send + Sync + 'static,
  V: Clone + Send + Sync + 'static,
{
  fn execute_query(&self, cache: &str, subscription: Subscription<K, V>) -> Result<RoutineId, GridError> {
    let id = RoutineId::random();
    let (sender, receiver) = mpsc::bounded(self.channel_capacity);

    Self::spawn_notifier(
      id,
      receiver,
      subscription.listener,
      subscription.page_size,
      subscription.time_interval,
    )
    .map_err(|e| GridError::Internal(format!("failed to start continuous query notifier: {e}")))?;

    let listening = subscription
      .target
      .as_ref()
      .map_or(true, |group| group.contains(&self.local_node));

    // Registered before returning, so every later commit is published to it.
    self.routines.write().insert(
      id,
      Routine {
        cache: Arc::from(cache),
        filter: subscription.filter,
        sender,
        auto_unsubscribe: subscription.auto_unsubscribe,
        listening,
      },
    );
    debug!(cache, routine = %id, "continuous query routine registered");
    Ok(id)
  }

  fn stop_routine(&self, id: RoutineId) -> GridFuture<()> {
    // Dropping the sender lets the notifier drain and exit. A routine that is
    // already gone, e.g. unsubscribed when its cache stopped, counts as stopped.
    if self.routines.write().remove(&id).is_none() {
      debug!(routine = %id, "continuous query routine already stopped");
    }
    GridFuture::ready(())
  }
}
