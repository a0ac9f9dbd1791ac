//! Contracts of the query engine a proxy routes queries to.

use crate::cluster::ClusterGroup;
use crate::context::OperationContext;
use crate::error::{GridError, Result};
use crate::grid::EntryPredicate;
use crate::metrics::{self, ProxyMetrics};
use crate::query::cursor::{QueryCursor, RowSource};
use crate::query::{Row, SqlFieldsQuery, SqlQuery, SqlValue};

use std::sync::Arc;

use tracing::debug;

/// An in-progress, paged fetch of query results.
pub trait QueryFetch<K, V>: Send {
  /// The next matching entry, or `None` when the fetch is complete.
  fn next_entry(&mut self) -> Result<Option<(K, V)>, GridError>;

  /// Stops the fetch and releases any remote resources it holds.
  fn cancel(&mut self) -> Result<(), GridError>;
}

/// A prepared scan, text or SPI query awaiting execution.
pub trait CacheQuery<K, V>: Send {
  /// Restricts execution to `group`. Unset means the engine decides.
  fn projection(&mut self, group: ClusterGroup);

  fn page_size(&mut self, page_size: usize);

  fn execute(self: Box<Self>, args: Vec<SqlValue>) -> Result<Box<dyn QueryFetch<K, V>>, GridError>;
}

/// The query engine of the grid.
pub trait QueryEngine<K, V>: Send + Sync {
  /// Whether the indexing module is installed on this node.
  fn module_enabled(&self) -> bool;

  fn create_scan_query(
    &self,
    cache: &str,
    filter: Option<EntryPredicate<K, V>>,
    partition: Option<u32>,
    keep_raw: bool,
  ) -> Box<dyn CacheQuery<K, V>>;

  fn create_text_query(&self, cache: &str, type_name: &str, text: &str, keep_raw: bool) -> Box<dyn CacheQuery<K, V>>;

  fn create_spi_query(&self, cache: &str, keep_raw: bool) -> Box<dyn CacheQuery<K, V>>;

  /// Runs a distributed SQL query: map on every data node, reduce here.
  fn query_two_step(
    &self,
    cache: &str,
    ctx: &OperationContext,
    query: &SqlQuery,
  ) -> Result<QueryCursor<(K, V)>, GridError>;

  fn query_two_step_fields(
    &self,
    cache: &str,
    ctx: &OperationContext,
    query: &SqlFieldsQuery,
  ) -> Result<QueryCursor<Row>, GridError>;

  /// Runs a SQL query against this node's data only.
  fn query_local(&self, cache: &str, ctx: &OperationContext, query: &SqlQuery)
    -> Result<QueryCursor<(K, V)>, GridError>;

  fn query_local_fields(
    &self,
    cache: &str,
    ctx: &OperationContext,
    query: &SqlFieldsQuery,
  ) -> Result<QueryCursor<Row>, GridError>;
}

/// Adapts a running fetch to a cursor. Closing the cursor cancels the fetch.
pub(crate) struct FetchSource<K, V> {
  fetch: Box<dyn QueryFetch<K, V>>,
  metrics: Arc<ProxyMetrics>,
}

impl<K, V> FetchSource<K, V> {
  pub(crate) fn new(fetch: Box<dyn QueryFetch<K, V>>, metrics: Arc<ProxyMetrics>) -> Self {
    Self { fetch, metrics }
  }
}

impl<K: Send, V: Send> RowSource<(K, V)> for FetchSource<K, V> {
  fn next_row(&mut self) -> Result<Option<(K, V)>> {
    Ok(self.fetch.next_entry()?)
  }

  fn close(&mut self) -> Result<()> {
    debug!("cancelling query fetch");
    metrics::bump(&self.metrics.cursors_released);
    Ok(self.fetch.cancel()?)
  }
}
