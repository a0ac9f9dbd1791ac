//! Completion handles for grid operations.
//!
//! [`GridFuture`] is what grid collaborators return: it can be waited on from a
//! plain thread or awaited from a task, so the same delegate serves both the
//! blocking and the deferred proxy. [`CacheFuture`] is the user-facing wrapper
//! handed out by asynchronous proxies; it converts internal failures into
//! [`CacheError`] only when it is resolved.

use crate::error::{CacheError, GridError, Result};
use crate::sync::{self, Waiter};

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;

type Outcome<T> = std::result::Result<T, GridError>;

/// A source of a single eventual outcome.
trait Completion<T>: Send {
  fn poll_done(&mut self, cx: &mut Context<'_>) -> Poll<Outcome<T>>;
  fn wait_done(&mut self) -> Outcome<T>;
  fn is_done(&self) -> bool;
}

fn polled_twice() -> GridError {
  GridError::Internal("future polled after completion".to_string())
}

// --- Ready ---

struct Ready<T>(Option<Outcome<T>>);

impl<T: Send> Completion<T> for Ready<T> {
  fn poll_done(&mut self, _cx: &mut Context<'_>) -> Poll<Outcome<T>> {
    Poll::Ready(self.0.take().unwrap_or_else(|| Err(polled_twice())))
  }

  fn wait_done(&mut self) -> Outcome<T> {
    self.0.take().unwrap_or_else(|| Err(polled_twice()))
  }

  fn is_done(&self) -> bool {
    true
  }
}

// --- Slot ---

enum SlotState<T> {
  Pending,
  Done(Outcome<T>),
  Taken,
}

struct SlotInner<T> {
  state: SlotState<T>,
  waiters: VecDeque<Waiter>,
}

/// Shared state between a [`Promise`] and its [`GridFuture`].
struct Slot<T> {
  inner: Mutex<SlotInner<T>>,
}

impl<T> Slot<T> {
  fn take(inner: &mut SlotInner<T>) -> Option<Outcome<T>> {
    match std::mem::replace(&mut inner.state, SlotState::Taken) {
      SlotState::Done(outcome) => Some(outcome),
      SlotState::Taken => Some(Err(polled_twice())),
      SlotState::Pending => {
        inner.state = SlotState::Pending;
        None
      }
    }
  }
}

struct SlotHandle<T>(Arc<Slot<T>>);

impl<T: Send> Completion<T> for SlotHandle<T> {
  fn poll_done(&mut self, cx: &mut Context<'_>) -> Poll<Outcome<T>> {
    let mut inner = self.0.inner.lock();
    match Slot::take(&mut inner) {
      Some(outcome) => Poll::Ready(outcome),
      None => {
        sync::register_async(&mut inner.waiters, cx.waker());
        Poll::Pending
      }
    }
  }

  fn wait_done(&mut self) -> Outcome<T> {
    let mut inner = self.0.inner.lock();
    loop {
      if let Some(outcome) = Slot::take(&mut inner) {
        return outcome;
      }
      sync::park_with(inner, |i| &mut i.waiters);
      inner = self.0.inner.lock();
    }
  }

  fn is_done(&self) -> bool {
    !matches!(self.0.inner.lock().state, SlotState::Pending)
  }
}

// --- Mapped ---

type MapFn<S, T> = Box<dyn FnOnce(Outcome<S>) -> Outcome<T> + Send>;

struct Mapped<S, T> {
  source: GridFuture<S>,
  map: Option<MapFn<S, T>>,
}

impl<S: Send, T: Send> Mapped<S, T> {
  fn apply(&mut self, outcome: Outcome<S>) -> Outcome<T> {
    match self.map.take() {
      Some(map) => map(outcome),
      None => Err(polled_twice()),
    }
  }
}

impl<S: Send, T: Send> Completion<T> for Mapped<S, T> {
  fn poll_done(&mut self, cx: &mut Context<'_>) -> Poll<Outcome<T>> {
    match self.source.inner.poll_done(cx) {
      Poll::Ready(outcome) => Poll::Ready(self.apply(outcome)),
      Poll::Pending => Poll::Pending,
    }
  }

  fn wait_done(&mut self) -> Outcome<T> {
    let outcome = self.source.inner.wait_done();
    self.apply(outcome)
  }

  fn is_done(&self) -> bool {
    self.source.inner.is_done()
  }
}

/// The eventual outcome of a grid operation.
///
/// Resolve it with [`wait`](GridFuture::wait) from synchronous code or
/// `.await` it from asynchronous code. Either way it yields exactly once.
#[must_use = "futures do nothing unless you .await or wait on them"]
pub struct GridFuture<T> {
  inner: Box<dyn Completion<T>>,
}

impl<T> fmt::Debug for GridFuture<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GridFuture")
      .field("done", &self.inner.is_done())
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static> GridFuture<T> {
  /// A future that is already resolved with `value`.
  pub fn ready(value: T) -> Self {
    Self::from_result(Ok(value))
  }

  /// A future that is already resolved with `error`.
  pub fn failed(error: GridError) -> Self {
    Self::from_result(Err(error))
  }

  pub fn from_result(outcome: Outcome<T>) -> Self {
    Self {
      inner: Box::new(Ready(Some(outcome))),
    }
  }

  /// Creates an unresolved future and the [`Promise`] that completes it.
  pub fn pending() -> (Self, Promise<T>) {
    let slot = Arc::new(Slot {
      inner: Mutex::new(SlotInner {
        state: SlotState::Pending,
        waiters: VecDeque::new(),
      }),
    });
    let future = Self {
      inner: Box::new(SlotHandle(slot.clone())),
    };
    (future, Promise { slot: Some(slot) })
  }

  /// Chains a transformation of the whole outcome. `f` runs once, on the
  /// thread that resolves the returned future.
  pub fn then<U, F>(self, f: F) -> GridFuture<U>
  where
    U: Send + 'static,
    F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
  {
    GridFuture {
      inner: Box::new(Mapped {
        source: self,
        map: Some(Box::new(f)),
      }),
    }
  }

  /// Chains a transformation of the successful value.
  pub fn map<U, F>(self, f: F) -> GridFuture<U>
  where
    U: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    self.then(move |outcome| outcome.map(f))
  }

  /// Blocks the current thread until the outcome is available.
  pub fn wait(mut self) -> Outcome<T> {
    self.inner.wait_done()
  }

  pub fn is_done(&self) -> bool {
    self.inner.is_done()
  }
}

impl<T> Future for GridFuture<T> {
  type Output = Outcome<T>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.inner.poll_done(cx)
  }
}

/// The completing side of a pending [`GridFuture`].
///
/// Dropping a promise without completing it resolves the future with
/// [`GridError::Abandoned`].
pub struct Promise<T> {
  slot: Option<Arc<Slot<T>>>,
}

impl<T> fmt::Debug for Promise<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Promise").finish_non_exhaustive()
  }
}

impl<T> Promise<T> {
  /// Resolves the paired future with `outcome`, waking every waiter.
  pub fn complete(mut self, outcome: Outcome<T>) {
    self.fulfil(outcome);
  }

  fn fulfil(&mut self, outcome: Outcome<T>) {
    if let Some(slot) = self.slot.take() {
      let drained: Vec<Waiter> = {
        let mut inner = slot.inner.lock();
        inner.state = SlotState::Done(outcome);
        inner.waiters.drain(..).collect()
      };
      sync::wake_all(drained);
    }
  }
}

impl<T> Drop for Promise<T> {
  fn drop(&mut self) {
    if self.slot.is_some() {
      self.fulfil(Err(GridError::Abandoned));
    }
  }
}

/// The future handed out by asynchronous proxy operations.
///
/// Failures are reported as [`CacheError`]; the conversion from the grid's
/// internal error happens when the future is resolved.
#[must_use = "futures do nothing unless you .await or get them"]
pub struct CacheFuture<T> {
  inner: GridFuture<Result<T>>,
}

impl<T> fmt::Debug for CacheFuture<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheFuture")
      .field("done", &self.inner.is_done())
      .finish_non_exhaustive()
  }
}

fn flatten<T>(outcome: Outcome<Result<T>>) -> Result<T> {
  outcome.unwrap_or_else(|e| Err(CacheError::from(e)))
}

impl<T: Send + 'static> CacheFuture<T> {
  pub(crate) fn new(future: GridFuture<T>) -> Self {
    Self {
      inner: future.then(|outcome| Ok(outcome.map_err(CacheError::from))),
    }
  }

  /// Blocks until the operation completes.
  pub fn get(self) -> Result<T> {
    flatten(self.inner.wait())
  }

  pub fn is_done(&self) -> bool {
    self.inner.is_done()
  }

  /// Chains `f` onto the outcome of this operation.
  pub fn chain<U, F>(self, f: F) -> CacheFuture<U>
  where
    U: Send + 'static,
    F: FnOnce(Result<T>) -> Result<U> + Send + 'static,
  {
    CacheFuture {
      inner: self.inner.then(move |outcome| Ok(f(flatten(outcome)))),
    }
  }

  /// Erases the future's type, for storing heterogeneous operations together.
  pub fn boxed(self) -> BoxFuture<'static, Result<T>> {
    FutureExt::boxed(self)
  }
}

impl<T> Future for CacheFuture<T> {
  type Output = Result<T>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match Pin::new(&mut self.inner).poll(cx) {
      Poll::Ready(outcome) => Poll::Ready(flatten(outcome)),
      Poll::Pending => Poll::Pending,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;
  use std::time::Duration;

  #[test]
  fn ready_future_resolves_immediately() {
    let fut = GridFuture::ready(7);
    assert!(fut.is_done());
    assert_eq!(fut.wait(), Ok(7));
  }

  #[test]
  fn pending_future_wakes_blocked_thread() {
    let (fut, promise) = GridFuture::<u32>::pending();
    assert!(!fut.is_done());

    let handle = thread::spawn(move || fut.wait());
    thread::sleep(Duration::from_millis(20));
    promise.complete(Ok(42));

    assert_eq!(handle.join().unwrap(), Ok(42));
  }

  #[test]
  fn dropped_promise_abandons_future() {
    let (fut, promise) = GridFuture::<u32>::pending();
    drop(promise);
    assert_eq!(fut.wait(), Err(GridError::Abandoned));
  }

  #[test]
  fn map_discards_value() {
    let fut = GridFuture::ready(true).map(|_| ());
    assert_eq!(fut.wait(), Ok(()));
  }

  #[test]
  fn then_sees_failure() {
    let fut = GridFuture::<u8>::failed(GridError::Cancelled)
      .then(|outcome| Ok(outcome.is_err()));
    assert_eq!(fut.wait(), Ok(true));
  }

  #[test]
  fn cache_future_converts_error_on_get() {
    let fut = CacheFuture::new(GridFuture::<()>::failed(GridError::Store("disk".into())));
    match fut.get() {
      Err(CacheError::Operation(GridError::Store(msg))) => assert_eq!(msg, "disk"),
      other => panic!("unexpected outcome: {other:?}"),
    }
  }

  #[test]
  fn cache_future_is_awaitable() {
    let (fut, promise) = GridFuture::pending();
    let fut = CacheFuture::new(fut).chain(|r: Result<u32>| r.map(|v| v * 2));
    promise.complete(Ok(21));
    assert_eq!(futures_executor::block_on(fut).unwrap(), 42);
  }

  #[test]
  fn boxed_futures_join() {
    let futures = vec![
      CacheFuture::new(GridFuture::ready(1u32)).boxed(),
      CacheFuture::new(GridFuture::ready(2u32)).boxed(),
    ];
    let results = futures_executor::block_on(futures_util::future::join_all(futures));
    assert_eq!(results.into_iter().map(|r| r.unwrap()).sum::<u32>(), 3);
  }
}
