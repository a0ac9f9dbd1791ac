use std::collections::VecDeque;
use std::task::Waker;
use std::thread::{self, Thread};

use parking_lot::MutexGuard;

/// A parked party waiting on a state change: either a blocked thread or a
/// pending task.
pub(crate) enum Waiter {
  Sync(Thread),
  Async(Waker),
}

impl Waiter {
  /// Wakes the underlying thread or task.
  pub(crate) fn wake(self) {
    match self {
      Waiter::Sync(thread) => thread.unpark(),
      Waiter::Async(waker) => waker.wake(),
    }
  }

  /// Checks if this waiter would be woken by the given waker.
  /// Used to prevent duplicate wakers for the same task in the queue.
  pub(crate) fn will_wake(&self, waker: &Waker) -> bool {
    match self {
      Waiter::Async(self_waker) => self_waker.will_wake(waker),
      Waiter::Sync(_) => false,
    }
  }
}

/// Registers `waker` unless an equivalent one is already queued.
pub(crate) fn register_async(waiters: &mut VecDeque<Waiter>, waker: &Waker) {
  if !waiters.iter().any(|w| w.will_wake(waker)) {
    waiters.push_back(Waiter::Async(waker.clone()));
  }
}

/// Queues the current thread, releases `guard` and parks.
///
/// The caller must re-acquire its lock and re-check its condition afterwards,
/// since parking may return spuriously.
pub(crate) fn park_with<T>(mut guard: MutexGuard<'_, T>, queue: impl FnOnce(&mut T) -> &mut VecDeque<Waiter>) {
  queue(&mut guard).push_back(Waiter::Sync(thread::current()));
  drop(guard); // Unlock before parking.
  thread::park();
}

/// Wakes every waiter drained from `waiters`.
pub(crate) fn wake_all(waiters: impl IntoIterator<Item = Waiter>) {
  for waiter in waiters {
    waiter.wake();
  }
}
