use crate::error::{CacheError, Result};
use crate::query::continuous::RoutineId;

use std::fmt;

use tracing::warn;

/// The producing side of a [`QueryCursor`].
pub trait RowSource<T>: Send {
  /// Fetches the next row, or `None` once the source is exhausted.
  fn next_row(&mut self) -> Result<Option<T>>;

  /// Releases whatever the source holds. Called at most once.
  fn close(&mut self) -> Result<()>;

  /// Whether running out of rows should release the source immediately.
  ///
  /// Sources that outlive their rows, such as a continuous query
  /// subscription, return `false`.
  fn close_on_exhaustion(&self) -> bool {
    true
  }

  /// The continuous query routine backing this source, if any.
  fn routine_id(&self) -> Option<RoutineId> {
    None
  }
}

struct IterSource<I>(I);

impl<T, I> RowSource<T> for IterSource<I>
where
  I: Iterator<Item = T> + Send,
{
  fn next_row(&mut self) -> Result<Option<T>> {
    Ok(self.0.next())
  }

  fn close(&mut self) -> Result<()> {
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
  Fresh,
  Iterating,
  Exhausted,
  Closed,
}

/// A closeable, single-pass cursor over query results.
///
/// Iterating yields `Result` items; an error ends the iteration. Closing is
/// idempotent and happens automatically when the cursor is dropped, so the
/// resources behind a cursor are released exactly once.
#[must_use = "a cursor does nothing unless iterated; dropping it closes it"]
pub struct QueryCursor<T> {
  source: Box<dyn RowSource<T>>,
  state: CursorState,
}

impl<T> fmt::Debug for QueryCursor<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryCursor")
      .field("state", &self.state)
      .field("routine", &self.source.routine_id())
      .finish_non_exhaustive()
  }
}

impl<T: 'static> QueryCursor<T> {
  pub fn new(source: impl RowSource<T> + 'static) -> Self {
    Self::from_source(Box::new(source))
  }

  pub fn from_source(source: Box<dyn RowSource<T>>) -> Self {
    Self {
      source,
      state: CursorState::Fresh,
    }
  }

  /// A cursor over an already materialized result.
  pub fn from_rows(rows: Vec<T>) -> Self
  where
    T: Send,
  {
    Self::new(IterSource(rows.into_iter()))
  }

  pub fn empty() -> Self
  where
    T: Send,
  {
    Self::from_rows(Vec::new())
  }
}

impl<T> QueryCursor<T> {
  /// Fetches every remaining row.
  ///
  /// The cursor is closed afterwards unless its source outlives its rows. A
  /// continuous query cursor stays subscribed until it is closed or dropped.
  ///
  /// Fails with [`CacheError::CursorConsumed`] if iteration already started.
  pub fn get_all(&mut self) -> Result<Vec<T>> {
    if self.state != CursorState::Fresh {
      return Err(CacheError::CursorConsumed);
    }
    let rows = self.by_ref().collect::<Result<Vec<T>>>()?;
    if self.source.close_on_exhaustion() {
      self.close()?;
    }
    Ok(rows)
  }

  /// Releases the cursor's resources. Subsequent calls do nothing.
  pub fn close(&mut self) -> Result<()> {
    if self.state == CursorState::Closed {
      return Ok(());
    }
    self.state = CursorState::Closed;
    self.source.close()
  }

  pub fn is_closed(&self) -> bool {
    self.state == CursorState::Closed
  }

  /// The continuous query routine this cursor keeps alive, if any.
  pub fn routine_id(&self) -> Option<RoutineId> {
    self.source.routine_id()
  }
}

impl<T> Iterator for QueryCursor<T> {
  type Item = Result<T>;

  fn next(&mut self) -> Option<Self::Item> {
    match self.state {
      CursorState::Closed | CursorState::Exhausted => return None,
      CursorState::Fresh => self.state = CursorState::Iterating,
      CursorState::Iterating => {}
    }

    match self.source.next_row() {
      Ok(Some(row)) => Some(Ok(row)),
      Ok(None) => {
        self.state = CursorState::Exhausted;
        if self.source.close_on_exhaustion() {
          if let Err(e) = self.close() {
            warn!(error = %e, "failed to release exhausted query cursor");
          }
        }
        None
      }
      Err(e) => {
        self.state = CursorState::Exhausted;
        Some(Err(e))
      }
    }
  }
}

impl<T> Drop for QueryCursor<T> {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!(error = %e, "failed to close query cursor on drop");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  struct Counting {
    rows: std::vec::IntoIter<u32>,
    closes: Arc<AtomicUsize>,
  }

  impl RowSource<u32> for Counting {
    fn next_row(&mut self) -> Result<Option<u32>> {
      Ok(self.rows.next())
    }

    fn close(&mut self) -> Result<()> {
      self.closes.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  fn counting(rows: Vec<u32>) -> (QueryCursor<u32>, Arc<AtomicUsize>) {
    let closes = Arc::new(AtomicUsize::new(0));
    let cursor = QueryCursor::new(Counting {
      rows: rows.into_iter(),
      closes: closes.clone(),
    });
    (cursor, closes)
  }

  #[test]
  fn get_all_collects_and_closes_once() {
    let (mut cursor, closes) = counting(vec![1, 2, 3]);
    assert_eq!(cursor.get_all().unwrap(), vec![1, 2, 3]);
    assert!(cursor.is_closed());
    drop(cursor);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
  }

  struct Lingering(Counting);

  impl RowSource<u32> for Lingering {
    fn next_row(&mut self) -> Result<Option<u32>> {
      self.0.next_row()
    }

    fn close(&mut self) -> Result<()> {
      self.0.close()
    }

    fn close_on_exhaustion(&self) -> bool {
      false
    }
  }

  #[test]
  fn get_all_keeps_lingering_source_open() {
    let closes = Arc::new(AtomicUsize::new(0));
    let mut cursor = QueryCursor::new(Lingering(Counting {
      rows: vec![4, 5].into_iter(),
      closes: closes.clone(),
    }));
    assert_eq!(cursor.get_all().unwrap(), vec![4, 5]);
    assert!(!cursor.is_closed());
    assert_eq!(closes.load(Ordering::SeqCst), 0);
    assert!(matches!(cursor.get_all(), Err(CacheError::CursorConsumed)));

    cursor.close().unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn get_all_after_iteration_fails() {
    let (mut cursor, _) = counting(vec![1, 2]);
    assert_eq!(cursor.next().unwrap().unwrap(), 1);
    assert!(matches!(cursor.get_all(), Err(CacheError::CursorConsumed)));
  }

  #[test]
  fn close_is_idempotent_across_drop() {
    let (mut cursor, closes) = counting(vec![1, 2]);
    cursor.close().unwrap();
    cursor.close().unwrap();
    assert!(cursor.next().is_none());
    drop(cursor);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn exhaustion_releases_source() {
    let (mut cursor, closes) = counting(vec![7]);
    assert_eq!(cursor.by_ref().count(), 1);
    assert!(cursor.is_closed());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
  }
}
