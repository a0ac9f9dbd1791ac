use crate::cluster::{ClusterGroup, NodeId};
use crate::context::OperationContext;
use crate::error::GridError;
use crate::grid::EntryPredicate;
use crate::local::cache::{LocalCache, ScanCursor};
use crate::query::engine::{CacheQuery, QueryEngine, QueryFetch};
use crate::query::{QueryCursor, Row, SqlFieldsQuery, SqlQuery, SqlValue};

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Decides whether an entry matches a full-text search: `(type_name, text, key, value)`.
pub type TextMatcher<K, V> = Arc<dyn Fn(&str, &str, &K, &V) -> bool + Send + Sync>;

/// Builds the entry predicate of an SPI query from its arguments.
pub type SpiHandler<K, V> = Arc<dyn Fn(&[SqlValue]) -> Result<EntryPredicate<K, V>, GridError> + Send + Sync>;

enum Kind<K, V> {
  Scan(Option<EntryPredicate<K, V>>),
  Text { type_name: String, text: String },
  Spi,
}

/// Query engine over a [`LocalCache`].
///
/// Scans, text and SPI queries page through the cache shard by shard. The
/// indexing module counts as installed once a text matcher is configured;
/// SQL is never available and fails as unsupported.
pub struct LocalQueryEngine<K: Send, V: Send> {
  cache: Arc<LocalCache<K, V>>,
  local_node: NodeId,
  text_matcher: Option<TextMatcher<K, V>>,
  spi_handler: Option<SpiHandler<K, V>>,
}

impl<K: Send, V: Send> fmt::Debug for LocalQueryEngine<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LocalQueryEngine")
      .field("local_node", &self.local_node)
      .field("text", &self.text_matcher.is_some())
      .field("spi", &self.spi_handler.is_some())
      .finish_non_exhaustive()
  }
}

impl<K, V> LocalQueryEngine<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  pub(crate) fn new(
    cache: Arc<LocalCache<K, V>>,
    local_node: NodeId,
    text_matcher: Option<TextMatcher<K, V>>,
    spi_handler: Option<SpiHandler<K, V>>,
  ) -> Self {
    Self {
      cache,
      local_node,
      text_matcher,
      spi_handler,
    }
  }

  fn prepare(&self, kind: Kind<K, V>, partition: Option<u32>) -> Box<dyn CacheQuery<K, V>> {
    Box::new(LocalQuery {
      cache: self.cache.clone(),
      local_node: self.local_node,
      kind,
      partition,
      page_size: 1024,
      projection: None,
      text_matcher: self.text_matcher.clone(),
      spi_handler: self.spi_handler.clone(),
    })
  }
}

impl<K, V> QueryEngine<K, V> for LocalQueryEngine<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  fn module_enabled(&self) -> bool {
    self.text_matcher.is_some()
  }

  fn create_scan_query(
    &self,
    _cache: &str,
    filter: Option<EntryPredicate<K, V>>,
    partition: Option<u32>,
    _keep_raw: bool,
  ) -> Box<dyn CacheQuery<K, V>> {
    self.prepare(Kind::Scan(filter), partition)
  }

  fn create_text_query(&self, _cache: &str, type_name: &str, text: &str, _keep_raw: bool) -> Box<dyn CacheQuery<K, V>> {
    self.prepare(
      Kind::Text {
        type_name: type_name.to_string(),
        text: text.to_string(),
      },
      None,
    )
  }

  fn create_spi_query(&self, _cache: &str, _keep_raw: bool) -> Box<dyn CacheQuery<K, V>> {
    self.prepare(Kind::Spi, None)
  }

  fn query_two_step(&self, _: &str, _: &OperationContext, _: &SqlQuery) -> Result<QueryCursor<(K, V)>, GridError> {
    Err(GridError::Unsupported("SQL queries".to_string()))
  }

  fn query_two_step_fields(&self, _: &str, _: &OperationContext, _: &SqlFieldsQuery) -> Result<QueryCursor<Row>, GridError> {
    Err(GridError::Unsupported("SQL fields queries".to_string()))
  }

  fn query_local(&self, _: &str, _: &OperationContext, _: &SqlQuery) -> Result<QueryCursor<(K, V)>, GridError> {
    Err(GridError::Unsupported("SQL queries".to_string()))
  }

  fn query_local_fields(&self, _: &str, _: &OperationContext, _: &SqlFieldsQuery) -> Result<QueryCursor<Row>, GridError> {
    Err(GridError::Unsupported("SQL fields queries".to_string()))
  }
}

struct LocalQuery<K: Send, V: Send> {
  cache: Arc<LocalCache<K, V>>,
  local_node: NodeId,
  kind: Kind<K, V>,
  partition: Option<u32>,
  page_size: usize,
  projection: Option<ClusterGroup>,
  text_matcher: Option<TextMatcher<K, V>>,
  spi_handler: Option<SpiHandler<K, V>>,
}

impl<K, V> CacheQuery<K, V> for LocalQuery<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  fn projection(&mut self, group: ClusterGroup) {
    self.projection = Some(group);
  }

  fn page_size(&mut self, page_size: usize) {
    self.page_size = page_size.max(1);
  }

  fn execute(self: Box<Self>, args: Vec<SqlValue>) -> Result<Box<dyn QueryFetch<K, V>>, GridError> {
    let this = *self;
    let filter: Option<EntryPredicate<K, V>> = match this.kind {
      Kind::Scan(filter) => filter,
      Kind::Text { type_name, text } => {
        let matcher = this
          .text_matcher
          .ok_or_else(|| GridError::Unsupported("text queries without a text matcher".to_string()))?;
        Some(Arc::new(move |key: &K, value: &V| matcher(&type_name, &text, key, value)))
      }
      Kind::Spi => {
        let handler = this
          .spi_handler
          .ok_or_else(|| GridError::Unsupported("SPI queries without an indexing provider".to_string()))?;
        Some(handler(&args)?)
      }
    };

    let partitions = this.cache.num_partitions();
    let (start, end) = match this.partition {
      Some(p) if (p as usize) < partitions => (p as usize, p as usize + 1),
      Some(p) => return Err(GridError::Query(format!("invalid partition {p}, cache has {partitions}"))),
      None => (0, partitions),
    };

    // Projected away from this node: nothing to return.
    let excluded = this
      .projection
      .as_ref()
      .is_some_and(|group| !group.contains(&this.local_node));

    Ok(Box::new(LocalFetch {
      cache: this.cache,
      filter,
      cursor: ScanCursor::at_shard(start),
      end,
      page_size: this.page_size,
      buffer: VecDeque::new(),
      finished: excluded,
    }))
  }
}

/// A paged scan over a [`LocalCache`]. Holds no lock between pages.
struct LocalFetch<K: Send, V: Send> {
  cache: Arc<LocalCache<K, V>>,
  filter: Option<EntryPredicate<K, V>>,
  cursor: ScanCursor,
  end: usize,
  page_size: usize,
  buffer: VecDeque<(K, V)>,
  finished: bool,
}

impl<K, V> QueryFetch<K, V> for LocalFetch<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  fn next_entry(&mut self) -> Result<Option<(K, V)>, GridError> {
    if let Some(entry) = self.buffer.pop_front() {
      return Ok(Some(entry));
    }
    while !self.finished && self.buffer.is_empty() {
      let page = self
        .cache
        .scan_page(&mut self.cursor, self.end, self.page_size, self.filter.as_ref());
      if page.is_empty() {
        self.finished = true;
      }
      self.buffer = page;
    }
    Ok(self.buffer.pop_front())
  }

  fn cancel(&mut self) -> Result<(), GridError> {
    self.finished = true;
    self.buffer.clear();
    Ok(())
  }
}
