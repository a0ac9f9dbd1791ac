//! Query descriptors and the cursors that deliver their results.

pub mod continuous;
pub mod cursor;
pub mod engine;
pub(crate) mod router;

use crate::grid::EntryPredicate;

use std::fmt;
use std::sync::Arc;

pub use continuous::{ContinuousQuery, EntryListenerConfig};
pub use cursor::QueryCursor;

/// The kind of a query descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
  Scan,
  Text,
  Spi,
  Sql,
  SqlFields,
  Continuous,
}

impl QueryKind {
  /// Kinds that need the cache to be indexed.
  pub fn requires_indexing(self) -> bool {
    !matches!(self, QueryKind::Scan | QueryKind::Continuous)
  }

  /// Kinds that need the indexing module to be installed.
  pub fn requires_indexing_module(self) -> bool {
    matches!(self, QueryKind::Sql | QueryKind::SqlFields | QueryKind::Text)
  }
}

impl fmt::Display for QueryKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      QueryKind::Scan => "ScanQuery",
      QueryKind::Text => "TextQuery",
      QueryKind::Spi => "SpiQuery",
      QueryKind::Sql => "SqlQuery",
      QueryKind::SqlFields => "SqlFieldsQuery",
      QueryKind::Continuous => "ContinuousQuery",
    };
    f.write_str(name)
  }
}

/// A dynamically typed value used for query arguments and result columns.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Text(String),
  Bytes(Vec<u8>),
}

impl From<bool> for SqlValue {
  fn from(v: bool) -> Self {
    SqlValue::Bool(v)
  }
}

impl From<i64> for SqlValue {
  fn from(v: i64) -> Self {
    SqlValue::Int(v)
  }
}

impl From<f64> for SqlValue {
  fn from(v: f64) -> Self {
    SqlValue::Float(v)
  }
}

impl From<&str> for SqlValue {
  fn from(v: &str) -> Self {
    SqlValue::Text(v.to_string())
  }
}

impl From<String> for SqlValue {
  fn from(v: String) -> Self {
    SqlValue::Text(v)
  }
}

/// One row of a fields query.
pub type Row = Vec<SqlValue>;

/// A predicate-filtered iteration over cache entries.
pub struct ScanQuery<K, V> {
  pub(crate) filter: Option<EntryPredicate<K, V>>,
  pub(crate) partition: Option<u32>,
  pub(crate) page_size: Option<usize>,
  pub(crate) local: bool,
}

impl<K, V> ScanQuery<K, V> {
  /// Scans every entry.
  pub fn new() -> Self {
    Self {
      filter: None,
      partition: None,
      page_size: None,
      local: false,
    }
  }

  /// Scans entries for which `filter` returns `true`.
  pub fn with_filter<F>(filter: F) -> Self
  where
    F: Fn(&K, &V) -> bool + Send + Sync + 'static,
  {
    Self {
      filter: Some(Arc::new(filter)),
      ..Self::new()
    }
  }

  /// Restricts the scan to one partition.
  pub fn partition(mut self, partition: u32) -> Self {
    self.partition = Some(partition);
    self
  }

  pub fn page_size(mut self, page_size: usize) -> Self {
    self.page_size = Some(page_size);
    self
  }

  /// Runs the scan against this node only.
  pub fn local(mut self, local: bool) -> Self {
    self.local = local;
    self
  }
}

impl<K, V> Default for ScanQuery<K, V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V> Clone for ScanQuery<K, V> {
  fn clone(&self) -> Self {
    Self {
      filter: self.filter.clone(),
      partition: self.partition,
      page_size: self.page_size,
      local: self.local,
    }
  }
}

impl<K, V> fmt::Debug for ScanQuery<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ScanQuery")
      .field("filtered", &self.filter.is_some())
      .field("partition", &self.partition)
      .field("page_size", &self.page_size)
      .field("local", &self.local)
      .finish()
  }
}

/// A full-text search over the indexed text fields of one value type.
#[derive(Debug, Clone, PartialEq)]
pub struct TextQuery {
  pub(crate) type_name: String,
  pub(crate) text: String,
  pub(crate) page_size: Option<usize>,
  pub(crate) local: bool,
}

impl TextQuery {
  pub fn new(type_name: impl Into<String>, text: impl Into<String>) -> Self {
    Self {
      type_name: type_name.into(),
      text: text.into(),
      page_size: None,
      local: false,
    }
  }

  pub fn page_size(mut self, page_size: usize) -> Self {
    self.page_size = Some(page_size);
    self
  }

  pub fn local(mut self, local: bool) -> Self {
    self.local = local;
    self
  }

  pub fn type_name(&self) -> &str {
    &self.type_name
  }

  pub fn text(&self) -> &str {
    &self.text
  }
}

/// A query answered by a pluggable indexing provider.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpiQuery {
  pub(crate) args: Vec<SqlValue>,
  pub(crate) page_size: Option<usize>,
  pub(crate) local: bool,
}

impl SpiQuery {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn args(mut self, args: Vec<SqlValue>) -> Self {
    self.args = args;
    self
  }

  pub fn page_size(mut self, page_size: usize) -> Self {
    self.page_size = Some(page_size);
    self
  }

  pub fn local(mut self, local: bool) -> Self {
    self.local = local;
    self
  }
}

/// A SQL query returning whole cache entries of one value type.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
  pub(crate) type_name: String,
  pub(crate) sql: String,
  pub(crate) args: Vec<SqlValue>,
  pub(crate) local: bool,
}

impl SqlQuery {
  pub fn new(type_name: impl Into<String>, sql: impl Into<String>) -> Self {
    Self {
      type_name: type_name.into(),
      sql: sql.into(),
      args: Vec::new(),
      local: false,
    }
  }

  pub fn args(mut self, args: Vec<SqlValue>) -> Self {
    self.args = args;
    self
  }

  pub fn local(mut self, local: bool) -> Self {
    self.local = local;
    self
  }

  pub fn type_name(&self) -> &str {
    &self.type_name
  }

  pub fn sql(&self) -> &str {
    &self.sql
  }

  pub fn arguments(&self) -> &[SqlValue] {
    &self.args
  }

  pub fn is_local(&self) -> bool {
    self.local
  }
}

/// A SQL query returning rows of selected fields.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFieldsQuery {
  pub(crate) sql: String,
  pub(crate) args: Vec<SqlValue>,
  pub(crate) local: bool,
}

impl SqlFieldsQuery {
  pub fn new(sql: impl Into<String>) -> Self {
    Self {
      sql: sql.into(),
      args: Vec::new(),
      local: false,
    }
  }

  pub fn args(mut self, args: Vec<SqlValue>) -> Self {
    self.args = args;
    self
  }

  pub fn local(mut self, local: bool) -> Self {
    self.local = local;
    self
  }

  pub fn sql(&self) -> &str {
    &self.sql
  }

  pub fn arguments(&self) -> &[SqlValue] {
    &self.args
  }

  pub fn is_local(&self) -> bool {
    self.local
  }
}

/// Any query a cache proxy can execute.
pub enum Query<K, V> {
  Scan(ScanQuery<K, V>),
  Text(TextQuery),
  Spi(SpiQuery),
  Sql(SqlQuery),
  SqlFields(SqlFieldsQuery),
  Continuous(ContinuousQuery<K, V>),
}

impl<K, V> Query<K, V> {
  pub fn kind(&self) -> QueryKind {
    match self {
      Query::Scan(_) => QueryKind::Scan,
      Query::Text(_) => QueryKind::Text,
      Query::Spi(_) => QueryKind::Spi,
      Query::Sql(_) => QueryKind::Sql,
      Query::SqlFields(_) => QueryKind::SqlFields,
      Query::Continuous(_) => QueryKind::Continuous,
    }
  }

  /// Whether the query asked to run against this node only.
  pub fn is_local(&self) -> bool {
    match self {
      Query::Scan(q) => q.local,
      Query::Text(q) => q.local,
      Query::Spi(q) => q.local,
      Query::Sql(q) => q.local,
      Query::SqlFields(q) => q.local,
      Query::Continuous(q) => q.local,
    }
  }
}

impl<K, V> fmt::Debug for Query<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Query::Scan(q) => q.fmt(f),
      Query::Text(q) => q.fmt(f),
      Query::Spi(q) => q.fmt(f),
      Query::Sql(q) => q.fmt(f),
      Query::SqlFields(q) => q.fmt(f),
      Query::Continuous(q) => q.fmt(f),
    }
  }
}

impl<K, V> From<ScanQuery<K, V>> for Query<K, V> {
  fn from(q: ScanQuery<K, V>) -> Self {
    Query::Scan(q)
  }
}

impl<K, V> From<TextQuery> for Query<K, V> {
  fn from(q: TextQuery) -> Self {
    Query::Text(q)
  }
}

impl<K, V> From<SpiQuery> for Query<K, V> {
  fn from(q: SpiQuery) -> Self {
    Query::Spi(q)
  }
}

impl<K, V> From<SqlQuery> for Query<K, V> {
  fn from(q: SqlQuery) -> Self {
    Query::Sql(q)
  }
}

impl<K, V> From<SqlFieldsQuery> for Query<K, V> {
  fn from(q: SqlFieldsQuery) -> Self {
    Query::SqlFields(q)
  }
}

impl<K, V> From<ContinuousQuery<K, V>> for Query<K, V> {
  fn from(q: ContinuousQuery<K, V>) -> Self {
    Query::Continuous(q)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn indexing_requirements_by_kind() {
    assert!(!QueryKind::Scan.requires_indexing());
    assert!(!QueryKind::Continuous.requires_indexing());
    assert!(QueryKind::Spi.requires_indexing());
    assert!(!QueryKind::Spi.requires_indexing_module());
    assert!(QueryKind::Text.requires_indexing_module());
  }

  #[test]
  fn locality_follows_descriptor() {
    let scan: Query<u32, String> = ScanQuery::new().local(true).into();
    assert_eq!(scan.kind(), QueryKind::Scan);
    assert!(scan.is_local());

    let sql: Query<u32, String> = SqlQuery::new("Person", "age > ?").into();
    assert!(!sql.is_local());
  }
}
