use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// A thread-safe collector for proxy-level counters, shared by every proxy
/// of one cache runtime.
#[derive(Debug)]
pub struct ProxyMetrics {
  // --- Gateway ---
  pub(crate) admitted: CachePadded<AtomicU64>,
  pub(crate) rejected: CachePadded<AtomicU64>,

  // --- Dispatch ---
  pub(crate) blocking_dispatches: CachePadded<AtomicU64>,
  pub(crate) deferred_dispatches: CachePadded<AtomicU64>,

  // --- Queries ---
  pub(crate) scan_queries: CachePadded<AtomicU64>,
  pub(crate) text_queries: CachePadded<AtomicU64>,
  pub(crate) spi_queries: CachePadded<AtomicU64>,
  pub(crate) sql_local: CachePadded<AtomicU64>,
  pub(crate) sql_two_step: CachePadded<AtomicU64>,
  pub(crate) cursors_released: CachePadded<AtomicU64>,

  // --- Continuous queries ---
  pub(crate) subscriptions_started: CachePadded<AtomicU64>,
  pub(crate) subscriptions_stopped: CachePadded<AtomicU64>,

  created_at: Instant,
}

impl Default for ProxyMetrics {
  fn default() -> Self {
    Self {
      admitted: CachePadded::new(AtomicU64::new(0)),
      rejected: CachePadded::new(AtomicU64::new(0)),
      blocking_dispatches: CachePadded::new(AtomicU64::new(0)),
      deferred_dispatches: CachePadded::new(AtomicU64::new(0)),
      scan_queries: CachePadded::new(AtomicU64::new(0)),
      text_queries: CachePadded::new(AtomicU64::new(0)),
      spi_queries: CachePadded::new(AtomicU64::new(0)),
      sql_local: CachePadded::new(AtomicU64::new(0)),
      sql_two_step: CachePadded::new(AtomicU64::new(0)),
      cursors_released: CachePadded::new(AtomicU64::new(0)),
      subscriptions_started: CachePadded::new(AtomicU64::new(0)),
      subscriptions_stopped: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

#[inline]
pub(crate) fn bump(counter: &CachePadded<AtomicU64>) {
  counter.fetch_add(1, Ordering::Relaxed);
}

impl ProxyMetrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Creates a point-in-time snapshot of the current counters.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let started = self.subscriptions_started.load(Ordering::Relaxed);
    let stopped = self.subscriptions_stopped.load(Ordering::Relaxed);

    MetricsSnapshot {
      admitted: self.admitted.load(Ordering::Relaxed),
      rejected: self.rejected.load(Ordering::Relaxed),
      blocking_dispatches: self.blocking_dispatches.load(Ordering::Relaxed),
      deferred_dispatches: self.deferred_dispatches.load(Ordering::Relaxed),
      scan_queries: self.scan_queries.load(Ordering::Relaxed),
      text_queries: self.text_queries.load(Ordering::Relaxed),
      spi_queries: self.spi_queries.load(Ordering::Relaxed),
      sql_local: self.sql_local.load(Ordering::Relaxed),
      sql_two_step: self.sql_two_step.load(Ordering::Relaxed),
      cursors_released: self.cursors_released.load(Ordering::Relaxed),
      subscriptions_started: started,
      active_subscriptions: started.saturating_sub(stopped),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of a runtime's proxy counters.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// Operations admitted by the gateway.
  pub admitted: u64,
  /// Operations rejected because the cache was stopping, stopped or closed.
  pub rejected: u64,
  /// Dual-mode operations resolved before returning.
  pub blocking_dispatches: u64,
  /// Dual-mode operations handed back as futures.
  pub deferred_dispatches: u64,
  pub scan_queries: u64,
  pub text_queries: u64,
  pub spi_queries: u64,
  /// SQL queries executed on this node only.
  pub sql_local: u64,
  /// SQL queries executed as distributed two-step queries.
  pub sql_two_step: u64,
  /// Scan, text and SPI cursors whose fetch was released.
  pub cursors_released: u64,
  pub subscriptions_started: u64,
  /// Continuous query subscriptions that have not been torn down.
  pub active_subscriptions: u64,
  /// The number of seconds the runtime has been running.
  pub uptime_secs: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("admitted", &self.admitted)
      .field("rejected", &self.rejected)
      .field("blocking_dispatches", &self.blocking_dispatches)
      .field("deferred_dispatches", &self.deferred_dispatches)
      .field("scan_queries", &self.scan_queries)
      .field("text_queries", &self.text_queries)
      .field("spi_queries", &self.spi_queries)
      .field("sql_local", &self.sql_local)
      .field("sql_two_step", &self.sql_two_step)
      .field("cursors_released", &self.cursors_released)
      .field("subscriptions_started", &self.subscriptions_started)
      .field("active_subscriptions", &self.active_subscriptions)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
