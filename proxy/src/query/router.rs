use crate::cluster::ClusterGroup;
use crate::context::OperationContext;
use crate::error::{CacheError, Result};
use crate::metrics::{self, ProxyMetrics};
use crate::query::continuous::{ContinuousQuery, ContinuousSession, Subscription};
use crate::query::cursor::QueryCursor;
use crate::query::engine::{CacheQuery, FetchSource};
use crate::query::{Query, QueryKind, Row, SqlFieldsQuery, SqlValue};
use crate::runtime::CacheRuntime;
use crate::security::Permission;

use std::sync::Arc;

use tracing::{debug, info, warn};

/// Routes one query to the right execution path.
///
/// Runs inside the caller's gateway bracket; nested queries (the initial
/// query of a continuous query) reuse it instead of entering again.
pub(crate) struct QueryRouter<'a, K, V> {
  runtime: &'a CacheRuntime<K, V>,
  ctx: &'a OperationContext,
}

impl<'a, K, V> QueryRouter<'a, K, V>
where
  K: Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub(crate) fn new(runtime: &'a CacheRuntime<K, V>, ctx: &'a OperationContext) -> Self {
    Self { runtime, ctx }
  }

  fn metrics(&self) -> &Arc<ProxyMetrics> {
    &self.runtime.metrics
  }

  fn name(&self) -> &str {
    &self.runtime.config.name
  }

  /// Authorizes, validates and dispatches an entry query.
  pub(crate) fn query(&self, query: Query<K, V>) -> Result<QueryCursor<(K, V)>> {
    self.authorize()?;
    self.validate(query.kind())?;

    let local = query.is_local();
    match query {
      Query::Continuous(cq) => self.subscribe(cq),
      Query::Sql(q) => {
        if self.runtime.is_replicated_data_node() || self.is_local_cache() || q.local {
          metrics::bump(&self.metrics().sql_local);
          Ok(self.runtime.queries.query_local(self.name(), self.ctx, &q)?)
        } else {
          metrics::bump(&self.metrics().sql_two_step);
          Ok(self.runtime.queries.query_two_step(self.name(), self.ctx, &q)?)
        }
      }
      Query::SqlFields(_) => Err(CacheError::UnsupportedQuery {
        kind: QueryKind::SqlFields,
        hint: Some("use `query_fields` to run a fields query".to_string()),
      }),
      Query::Scan(q) => {
        metrics::bump(&self.metrics().scan_queries);
        let page_size = q.page_size.unwrap_or(self.runtime.config.queries.scan_page_size);
        let prepared =
          self
            .runtime
            .queries
            .create_scan_query(self.name(), q.filter, q.partition, self.ctx.keep_raw());
        self.execute(prepared, page_size, local, Vec::new())
      }
      Query::Text(q) => {
        metrics::bump(&self.metrics().text_queries);
        let page_size = q.page_size.unwrap_or(self.runtime.config.queries.scan_page_size);
        let prepared =
          self
            .runtime
            .queries
            .create_text_query(self.name(), &q.type_name, &q.text, self.ctx.keep_raw());
        self.execute(prepared, page_size, local, Vec::new())
      }
      Query::Spi(q) => {
        metrics::bump(&self.metrics().spi_queries);
        let page_size = q.page_size.unwrap_or(self.runtime.config.queries.scan_page_size);
        let prepared = self.runtime.queries.create_spi_query(self.name(), self.ctx.keep_raw());
        self.execute(prepared, page_size, local, q.args)
      }
    }
  }

  /// Authorizes, validates and dispatches a fields query.
  pub(crate) fn query_fields(&self, query: SqlFieldsQuery) -> Result<QueryCursor<Row>> {
    self.authorize()?;
    self.validate(QueryKind::SqlFields)?;

    if self.runtime.is_replicated_data_node() || self.is_local_cache() || query.local {
      metrics::bump(&self.metrics().sql_local);
      Ok(self.runtime.queries.query_local_fields(self.name(), self.ctx, &query)?)
    } else {
      metrics::bump(&self.metrics().sql_two_step);
      Ok(self.runtime.queries.query_two_step_fields(self.name(), self.ctx, &query)?)
    }
  }

  fn authorize(&self) -> Result<()> {
    self
      .runtime
      .security
      .check_permission(self.name(), self.ctx.subject_id(), Permission::CacheRead)
  }

  /// Rejects queries the cache's indexing configuration cannot serve, before
  /// anything is dispatched.
  pub(crate) fn validate(&self, kind: QueryKind) -> Result<()> {
    if kind.requires_indexing() && !self.runtime.config.is_indexing_enabled() {
      debug!(cache = %self.name(), kind = %kind, "query rejected: indexing disabled");
      return Err(CacheError::IndexingDisabled {
        cache: self.name().to_string(),
      });
    }
    if kind.requires_indexing_module() && !self.runtime.queries.module_enabled() {
      debug!(cache = %self.name(), kind = %kind, "query rejected: indexing module missing");
      return Err(CacheError::IndexingModuleMissing);
    }
    Ok(())
  }

  /// Whether the cache itself only lives on this node.
  fn is_local_cache(&self) -> bool {
    self.runtime.config.mode == crate::config::CacheMode::Local
  }

  /// Where a scan, text or SPI query runs. `None` lets the engine decide.
  pub(crate) fn projection(&self, local: bool) -> Option<ClusterGroup> {
    if local || self.is_local_cache() || self.runtime.is_replicated_data_node() {
      return Some(self.runtime.cluster.for_local());
    }
    if self.runtime.config.mode == crate::config::CacheMode::Replicated {
      return Some(self.runtime.cluster.data_nodes(self.name()).for_random());
    }
    None
  }

  fn execute(
    &self,
    mut prepared: Box<dyn CacheQuery<K, V>>,
    page_size: usize,
    local: bool,
    args: Vec<SqlValue>,
  ) -> Result<QueryCursor<(K, V)>> {
    if let Some(group) = self.projection(local) {
      prepared.projection(group);
    }
    prepared.page_size(page_size);
    let fetch = prepared.execute(args)?;
    Ok(QueryCursor::new(FetchSource::new(fetch, self.metrics().clone())))
  }

  /// Registers the listener first, then runs the initial query, so no update
  /// committed after this returns can be missed by both.
  fn subscribe(&self, cq: ContinuousQuery<K, V>) -> Result<QueryCursor<(K, V)>> {
    if let Some(Query::Continuous(_)) = cq.initial_query.as_deref() {
      return Err(CacheError::InvalidContinuousQuery(
        "initial query can't be a continuous query; use a scan or SQL query as the initial query".to_string(),
      ));
    }
    let listener = cq.local_listener.ok_or_else(|| {
      CacheError::InvalidContinuousQuery("mandatory local listener is not set for the query".to_string())
    })?;

    let defaults = &self.runtime.config.queries;
    let subscription = Subscription {
      listener,
      filter: cq.remote_filter,
      page_size: cq.page_size.unwrap_or(defaults.continuous_page_size),
      time_interval: cq.time_interval.unwrap_or(defaults.continuous_time_interval),
      auto_unsubscribe: cq.auto_unsubscribe.unwrap_or(defaults.auto_unsubscribe),
      target: cq.local.then(|| self.runtime.cluster.for_local()),
    };

    let processor = self.runtime.continuous.clone();
    let id = processor.execute_query(self.name(), subscription)?;
    metrics::bump(&self.metrics().subscriptions_started);
    info!(cache = %self.name(), routine = %id, "continuous query registered");

    let initial = match cq.initial_query {
      Some(initial) => match self.query(*initial) {
        Ok(cursor) => Some(cursor),
        Err(e) => {
          metrics::bump(&self.metrics().subscriptions_stopped);
          if let Err(stop) = processor.stop_routine(id).wait() {
            warn!(cache = %self.name(), routine = %id, error = %stop, "failed to roll back continuous query");
          }
          return Err(e);
        }
      },
      None => None,
    };

    Ok(QueryCursor::new(ContinuousSession::new(
      Arc::from(self.name()),
      id,
      initial,
      processor,
      self.metrics().clone(),
    )))
  }
}
