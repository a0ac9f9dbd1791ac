use crate::error::Result;
use crate::future::{CacheFuture, GridFuture};

mod private {
  pub trait Sealed {}
}

/// Selects how a proxy hands the result of a dual-mode operation back.
///
/// Every cache operation that exists in both a blocking and a non-blocking
/// flavour is issued against the delegate once, as a [`GridFuture`]. The
/// dispatch mode then decides what the caller gets: [`Blocking`] resolves the
/// future while the operation is still admitted by the gateway, [`Deferred`]
/// returns it untouched as a [`CacheFuture`].
pub trait Dispatch: private::Sealed + Send + Sync + 'static {
  /// What a dual-mode operation producing `T` returns.
  type Output<T: Send + 'static>;

  /// `true` for modes that return before the operation completes.
  const DEFERRED: bool;

  fn complete<T: Send + 'static>(future: GridFuture<T>) -> Result<Self::Output<T>>;
}

/// Operations block until the delegate finishes and return the value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blocking;

/// Operations return a [`CacheFuture`] as soon as the delegate accepted them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deferred;

impl private::Sealed for Blocking {}
impl private::Sealed for Deferred {}

impl Dispatch for Blocking {
  type Output<T: Send + 'static> = T;

  const DEFERRED: bool = false;

  fn complete<T: Send + 'static>(future: GridFuture<T>) -> Result<T> {
    Ok(future.wait()?)
  }
}

impl Dispatch for Deferred {
  type Output<T: Send + 'static> = CacheFuture<T>;

  const DEFERRED: bool = true;

  fn complete<T: Send + 'static>(future: GridFuture<T>) -> Result<CacheFuture<T>> {
    Ok(CacheFuture::new(future))
  }
}
