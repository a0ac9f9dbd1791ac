//! Lifecycle admission control for cache operations.
//!
//! Every public proxy operation is bracketed by [`Gateway::enter`] and the
//! drop of the returned [`GatewayGuard`]. The gateway state and the number of
//! operations in flight live in a single atomic word, so admission is a
//! compare-and-swap on the fast path and the `Active -> Stopping -> Stopped`
//! transition is linearizable with respect to every caller.

use crate::context::OperationContext;
use crate::error::{CacheError, Result};
use crate::sync::{self, Waiter};

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, info};

const STATE_SHIFT: u32 = 62;
const COUNT_MASK: u64 = (1 << STATE_SHIFT) - 1;

const ACTIVE: u64 = 0;
const STOPPING: u64 = 1;
const STOPPED: u64 = 2;

#[inline]
fn state_of(word: u64) -> u64 {
  word >> STATE_SHIFT
}

#[inline]
fn count_of(word: u64) -> u64 {
  word & COUNT_MASK
}

/// The lifecycle state of a cache as seen by its gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
  /// Operations are admitted.
  Active,
  /// A stop was requested; new operations are rejected while in-flight ones drain.
  Stopping,
  /// Terminal. Every `enter` fails immediately.
  Stopped,
}

impl GatewayState {
  fn from_bits(bits: u64) -> Self {
    match bits {
      ACTIVE => GatewayState::Active,
      STOPPING => GatewayState::Stopping,
      _ => GatewayState::Stopped,
    }
  }
}

impl fmt::Display for GatewayState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      GatewayState::Active => write!(f, "active"),
      GatewayState::Stopping => write!(f, "stopping"),
      GatewayState::Stopped => write!(f, "stopped"),
    }
  }
}

/// The admission-control gate guarding a cache's lifecycle.
///
/// A gateway is owned by the cache runtime; proxies hold shared references.
pub struct Gateway {
  name: Arc<str>,
  /// Two state bits on top of the in-flight counter.
  word: CachePadded<AtomicU64>,
  /// Threads and tasks waiting for `Stopped`.
  stop_waiters: Mutex<VecDeque<Waiter>>,
}

impl fmt::Debug for Gateway {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Gateway")
      .field("name", &self.name)
      .field("state", &self.state())
      .field("in_flight", &self.in_flight())
      .finish()
  }
}

impl Gateway {
  /// Creates an active gateway for the cache called `name`.
  pub fn new(name: impl Into<Arc<str>>) -> Self {
    Self {
      name: name.into(),
      word: CachePadded::new(AtomicU64::new(ACTIVE << STATE_SHIFT)),
      stop_waiters: Mutex::new(VecDeque::new()),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> GatewayState {
    GatewayState::from_bits(state_of(self.word.load(Ordering::Acquire)))
  }

  /// The number of locking entrants that have not yet left.
  pub fn in_flight(&self) -> usize {
    count_of(self.word.load(Ordering::Acquire)) as usize
  }

  pub fn is_stopped(&self) -> bool {
    self.state() == GatewayState::Stopped
  }

  /// Admits a locking operation carrying `context`.
  ///
  /// The in-flight counter is incremented before this returns, so a
  /// concurrent stop cannot complete until the returned guard is dropped.
  /// Fails with [`CacheError::Stopped`] once a stop has been requested.
  pub fn enter<'a>(&'a self, context: &'a OperationContext) -> Result<GatewayGuard<'a>> {
    match self.try_admit() {
      Ok(()) => Ok(GatewayGuard {
        gateway: self,
        context,
        locked: true,
      }),
      Err(state) => Err(self.rejected(state)),
    }
  }

  /// Admits an operation without participating in the in-flight counter.
  ///
  /// Only for callers that already hold an equivalent admission from an
  /// enclosing scope; a stop can complete while the returned guard is alive.
  pub fn enter_no_lock<'a>(&'a self, context: &'a OperationContext) -> Result<GatewayGuard<'a>> {
    let state = state_of(self.word.load(Ordering::Acquire));
    if state != ACTIVE {
      return Err(self.rejected(state));
    }
    Ok(GatewayGuard {
      gateway: self,
      context,
      locked: false,
    })
  }

  /// Non-failing admission for lifecycle operations.
  ///
  /// Returns `None` instead of an error when the gateway is no longer active.
  pub fn enter_if_not_stopped<'a>(&'a self, context: &'a OperationContext) -> Option<GatewayGuard<'a>> {
    self.enter(context).ok()
  }

  /// Non-locking variant of [`enter_if_not_stopped`](Self::enter_if_not_stopped).
  pub fn enter_if_not_stopped_no_lock<'a>(
    &'a self,
    context: &'a OperationContext,
  ) -> Option<GatewayGuard<'a>> {
    self.enter_no_lock(context).ok()
  }

  /// Requests a stop without waiting for it to complete.
  ///
  /// Returns `true` if this call moved the gateway out of `Active`. If no
  /// operation is in flight the gateway becomes `Stopped` immediately.
  pub fn request_stop(&self) -> bool {
    let mut current = self.word.load(Ordering::Acquire);
    loop {
      if state_of(current) != ACTIVE {
        return false;
      }
      let next = (STOPPING << STATE_SHIFT) | count_of(current);
      match self
        .word
        .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => {
          info!(cache = %self.name, in_flight = count_of(current), "cache gateway stopping");
          if count_of(current) == 0 {
            self.finish_stop();
          }
          return true;
        }
        Err(actual) => current = actual,
      }
    }
  }

  /// Requests a stop and blocks the current thread until every in-flight
  /// operation has left and the gateway is `Stopped`.
  ///
  /// Calling this from inside a locking bracket on the same gateway never
  /// returns.
  pub fn stop(&self) {
    self.request_stop();

    let mut waiters = self.stop_waiters.lock();
    loop {
      if self.is_stopped() {
        return;
      }
      sync::park_with(waiters, |w| w);
      waiters = self.stop_waiters.lock(); // Re-lock after being unparked.
    }
  }

  /// Requests a stop and returns a future resolving once the gateway is `Stopped`.
  pub fn stop_async(&self) -> StopFuture<'_> {
    self.request_stop();
    StopFuture { gateway: self }
  }

  fn try_admit(&self) -> std::result::Result<(), u64> {
    let mut current = self.word.load(Ordering::Acquire);
    loop {
      let state = state_of(current);
      if state != ACTIVE {
        return Err(state);
      }
      debug_assert!(count_of(current) < COUNT_MASK, "gateway in-flight counter overflow");
      match self
        .word
        .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => return Ok(()),
        Err(actual) => current = actual,
      }
    }
  }

  fn release(&self) {
    let previous = self.word.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(count_of(previous) > 0, "gateway left more often than entered");

    // The last entrant out of a stopping gateway completes the transition.
    if previous == (STOPPING << STATE_SHIFT) | 1 {
      self.finish_stop();
    }
  }

  fn finish_stop(&self) {
    if self
      .word
      .compare_exchange(
        STOPPING << STATE_SHIFT,
        STOPPED << STATE_SHIFT,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok()
    {
      info!(cache = %self.name, "cache gateway stopped");
      let drained: Vec<Waiter> = self.stop_waiters.lock().drain(..).collect();
      sync::wake_all(drained);
    }
  }

  fn rejected(&self, state: u64) -> CacheError {
    debug!(cache = %self.name, state = %GatewayState::from_bits(state), "operation rejected by gateway");
    CacheError::Stopped {
      name: self.name.to_string(),
    }
  }
}

/// An admitted operation. Dropping the guard leaves the gateway.
///
/// The guard carries the overlay the operation was admitted with; nested
/// calls receive their own guard, so leaving always restores the caller's
/// overlay without any ambient per-thread state.
#[must_use = "dropping the guard immediately leaves the gateway"]
pub struct GatewayGuard<'a> {
  gateway: &'a Gateway,
  context: &'a OperationContext,
  locked: bool,
}

impl<'a> GatewayGuard<'a> {
  /// The overlay active for the duration of this bracket.
  pub fn context(&self) -> &'a OperationContext {
    self.context
  }

  /// Whether this admission is counted as in flight.
  pub fn is_locked(&self) -> bool {
    self.locked
  }

  /// Leaves the gateway. Equivalent to dropping the guard.
  pub fn leave(self) {}
}

impl fmt::Debug for GatewayGuard<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GatewayGuard")
      .field("cache", &self.gateway.name)
      .field("locked", &self.locked)
      .finish()
  }
}

impl Drop for GatewayGuard<'_> {
  fn drop(&mut self) {
    if self.locked {
      self.gateway.release();
    }
  }
}

/// The `Future` returned by [`Gateway::stop_async`].
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct StopFuture<'a> {
  gateway: &'a Gateway,
}

impl Future for StopFuture<'_> {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    if self.gateway.is_stopped() {
      return Poll::Ready(());
    }

    let mut waiters = self.gateway.stop_waiters.lock();
    // Re-check under the lock to avoid a lost wakeup.
    if self.gateway.is_stopped() {
      return Poll::Ready(());
    }
    sync::register_async(&mut waiters, cx.waker());
    Poll::Pending
  }
}

/// A proxy instance's handle on the shared gateway.
///
/// Closing a proxy poisons its slot: from then on every admission through
/// this slot fails with [`CacheError::Closed`] without touching the shared
/// gateway, while other proxies of the same cache are unaffected.
pub(crate) struct ProxyGate {
  gateway: Arc<Gateway>,
  poisoned: AtomicBool,
}

impl ProxyGate {
  pub(crate) fn new(gateway: Arc<Gateway>) -> Self {
    Self {
      gateway,
      poisoned: AtomicBool::new(false),
    }
  }

  pub(crate) fn enter<'a>(&'a self, context: &'a OperationContext, lock: bool) -> Result<GatewayGuard<'a>> {
    if self.is_poisoned() {
      return Err(CacheError::Closed {
        name: self.gateway.name().to_string(),
      });
    }
    if lock {
      self.gateway.enter(context)
    } else {
      self.gateway.enter_no_lock(context)
    }
  }

  pub(crate) fn enter_if_not_stopped<'a>(
    &'a self,
    context: &'a OperationContext,
    lock: bool,
  ) -> Option<GatewayGuard<'a>> {
    if self.is_poisoned() {
      return None;
    }
    if lock {
      self.gateway.enter_if_not_stopped(context)
    } else {
      self.gateway.enter_if_not_stopped_no_lock(context)
    }
  }

  /// Poisons the slot. Returns `true` if this call did it.
  pub(crate) fn poison(&self) -> bool {
    !self.poisoned.swap(true, Ordering::AcqRel)
  }

  pub(crate) fn is_poisoned(&self) -> bool {
    self.poisoned.load(Ordering::Acquire)
  }

  pub(crate) fn gateway(&self) -> &Arc<Gateway> {
    &self.gateway
  }
}
