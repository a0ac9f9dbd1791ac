mod common;

use common::sorted;
use fibre_proxy::grid::EntryPredicate;
use fibre_proxy::query::{QueryKind, SqlValue};
use fibre_proxy::security::PermissionSet;
use fibre_proxy::{
  CacheConfig, CacheError, CacheMode, GridError, PeekMode, Permission, ScanQuery, SpiQuery, SqlFieldsQuery, SqlQuery, TextQuery,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn indexed(name: &str) -> CacheConfig {
  CacheConfig::new(name).indexed_type("u32", "String")
}

#[test]
fn test_scan_filters_rows_and_cancels_once() {
  let routed = common::routed(CacheConfig::new("scan"), true, true);
  let proxy = routed.runtime.proxy();

  let rows = proxy
    .query(ScanQuery::<u32, String>::with_filter(|k, _| *k > 1))
    .unwrap()
    .get_all()
    .unwrap();
  assert_eq!(rows, vec![(2, "b".to_string())]);

  let cancels_before = routed.engine.cancels.load(Ordering::SeqCst);
  let mut cursor = proxy.query(ScanQuery::<u32, String>::new()).unwrap();
  cursor.close().unwrap();
  assert!(cursor.is_closed());
  drop(cursor);
  assert_eq!(routed.engine.cancels.load(Ordering::SeqCst), cancels_before + 1);
}

#[test]
fn test_scan_on_local_grid() {
  let grid = common::seeded_grid("scan-local");
  let proxy = grid.proxy();

  let mut cursor = proxy.query(ScanQuery::<u32, String>::with_filter(|k, _| *k > 1)).unwrap();
  assert_eq!(cursor.next().unwrap().unwrap(), (2, "b".to_string()));
  assert!(cursor.next().is_none());
  assert!(cursor.is_closed(), "exhaustion releases the fetch");

  let everything = proxy.query(ScanQuery::<u32, String>::new().page_size(1)).unwrap().get_all().unwrap();
  assert_eq!(sorted(everything), vec![(1, "a".to_string()), (2, "b".to_string())]);
  assert_eq!(proxy.metrics().scan_queries, 2);
}

#[test]
fn test_scan_by_partition_covers_every_entry_once() {
  let grid = common::local_grid(CacheConfig::new("partitions"));
  let proxy = grid.proxy();
  for i in 0..32 {
    proxy.put(i, format!("v{i}")).unwrap();
  }

  let mut keys = Vec::new();
  for partition in 0..4 {
    let rows = proxy
      .query(ScanQuery::<u32, String>::new().partition(partition))
      .unwrap()
      .get_all()
      .unwrap();
    keys.extend(rows.into_iter().map(|(k, _)| k));
  }
  assert_eq!(sorted(keys), (0..32).collect::<Vec<_>>());

  let err = proxy.query(ScanQuery::<u32, String>::new().partition(4)).unwrap_err();
  assert!(matches!(err, CacheError::Operation(GridError::Query(_))));
}

#[test]
fn test_scan_includes_swapped_entries() {
  let grid = common::local_grid(CacheConfig::new("swapped"));
  let proxy = grid.proxy();
  for i in 0..32 {
    proxy.put(i, format!("v{i}")).unwrap();
  }
  let evicted: Vec<u32> = (0..32).filter(|i| i % 2 == 0).collect();
  proxy.local_evict(&evicted).unwrap();
  assert_eq!(proxy.local_peek(&0, &[PeekMode::OnHeap]).unwrap(), None);

  let rows = proxy.query(ScanQuery::<u32, String>::new().page_size(3)).unwrap().get_all().unwrap();
  assert_eq!(sorted(rows.into_iter().map(|(k, _)| k).collect()), (0..32).collect::<Vec<_>>());

  let mut keys = Vec::new();
  for partition in 0..4 {
    let rows = proxy
      .query(ScanQuery::<u32, String>::with_filter(|k, _| *k < 10).partition(partition))
      .unwrap()
      .get_all()
      .unwrap();
    keys.extend(rows.into_iter().map(|(k, _)| k));
  }
  assert_eq!(sorted(keys), (0..10).collect::<Vec<_>>());

  // Scanning does not promote.
  assert_eq!(proxy.local_peek(&0, &[PeekMode::OffHeap]).unwrap(), Some("v0".to_string()));
}

#[test]
fn test_sql_without_indexing_fails_before_dispatch() {
  let routed = common::routed(CacheConfig::new("plain"), true, false);
  let proxy = routed.runtime.proxy();

  let err = proxy.query(SqlQuery::new("String", "select * from String")).unwrap_err();
  assert!(matches!(err, CacheError::IndexingDisabled { ref cache } if cache == "plain"));
  assert!(matches!(
    proxy.query(TextQuery::new("String", "b")),
    Err(CacheError::IndexingDisabled { .. })
  ));
  assert!(matches!(proxy.query(SpiQuery::new()), Err(CacheError::IndexingDisabled { .. })));
  assert!(matches!(
    proxy.query_fields(SqlFieldsQuery::new("select 1")),
    Err(CacheError::IndexingDisabled { .. })
  ));

  assert_eq!(routed.engine.two_step.load(Ordering::SeqCst), 0);
  assert_eq!(routed.engine.local.load(Ordering::SeqCst), 0);
  assert!(routed.log.lock().is_empty());
}

#[test]
fn test_missing_indexing_module_is_reported() {
  let routed = common::routed(indexed("no-module"), false, false);
  let proxy = routed.runtime.proxy();

  assert!(matches!(
    proxy.query(SqlQuery::new("String", "select")),
    Err(CacheError::IndexingModuleMissing)
  ));
  assert!(matches!(
    proxy.query(TextQuery::new("String", "b")),
    Err(CacheError::IndexingModuleMissing)
  ));

  // SPI queries only need indexing, not the module.
  let rows = proxy.query(SpiQuery::new()).unwrap().get_all().unwrap();
  assert_eq!(rows.len(), 2);
}

#[test]
fn test_fields_query_through_entry_query_is_unsupported() {
  let routed = common::routed(indexed("fields"), true, false);
  let proxy = routed.runtime.proxy();

  let err = proxy.query(SqlFieldsQuery::new("select 1")).unwrap_err();
  match &err {
    CacheError::UnsupportedQuery { kind, hint } => {
      assert_eq!(*kind, QueryKind::SqlFields);
      assert!(hint.as_deref().is_some_and(|h| h.contains("query_fields")));
    }
    other => panic!("unexpected error: {other:?}"),
  }
  assert!(err.to_string().starts_with("unsupported query type"));

  proxy.query_fields(SqlFieldsQuery::new("select 1")).unwrap().get_all().unwrap();
  assert_eq!(routed.engine.two_step.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sql_on_partitioned_cache_runs_two_step() {
  let routed = common::routed(indexed("partitioned"), true, true);
  let proxy = routed.runtime.proxy();

  let rows = proxy.query(SqlQuery::new("String", "select")).unwrap().get_all().unwrap();
  assert_eq!(rows.len(), 2);
  assert_eq!(routed.engine.two_step.load(Ordering::SeqCst), 1);
  assert_eq!(routed.engine.local.load(Ordering::SeqCst), 0);

  proxy.query(SqlQuery::new("String", "select").local(true)).unwrap().get_all().unwrap();
  assert_eq!(routed.engine.local.load(Ordering::SeqCst), 1);

  let metrics = proxy.metrics();
  assert_eq!(metrics.sql_two_step, 1);
  assert_eq!(metrics.sql_local, 1);
}

#[test]
fn test_sql_on_replicated_data_node_runs_locally() {
  let routed = common::routed(indexed("replicated").mode(CacheMode::Replicated), true, true);
  let proxy = routed.runtime.proxy();
  proxy.query(SqlQuery::new("String", "select")).unwrap().get_all().unwrap();
  assert_eq!(routed.engine.local.load(Ordering::SeqCst), 1);
  assert_eq!(routed.engine.two_step.load(Ordering::SeqCst), 0);
}

#[test]
fn test_sql_on_replicated_client_node_runs_two_step() {
  let routed = common::routed(indexed("replicated").mode(CacheMode::Replicated), true, false);
  let proxy = routed.runtime.proxy();
  proxy.query(SqlQuery::new("String", "select")).unwrap().get_all().unwrap();
  assert_eq!(routed.engine.two_step.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sql_on_local_cache_runs_locally() {
  let routed = common::routed(indexed("local").mode(CacheMode::Local), true, false);
  let proxy = routed.runtime.proxy();
  proxy.query(SqlQuery::new("String", "select")).unwrap().get_all().unwrap();
  assert_eq!(routed.engine.local.load(Ordering::SeqCst), 1);
}

#[test]
fn test_scan_projection_follows_cache_mode() {
  // Replicated, queried from a node without data: one random data node.
  let routed = common::routed(CacheConfig::new("rep").mode(CacheMode::Replicated), true, false);
  let proxy = routed.runtime.proxy();
  proxy.query(ScanQuery::<u32, String>::new()).unwrap().get_all().unwrap();
  {
    let projections = routed.engine.projections.lock();
    assert_eq!(projections.len(), 1);
    let nodes = projections[0].nodes();
    assert_eq!(nodes.len(), 1);
    assert!(routed.cluster.data.contains(&nodes[0]));
    assert_ne!(nodes[0], routed.cluster.local);
  }

  // Replicated, queried from a data node: this node.
  let routed = common::routed(CacheConfig::new("rep").mode(CacheMode::Replicated), true, true);
  routed.runtime.proxy().query(ScanQuery::<u32, String>::new()).unwrap().get_all().unwrap();
  assert_eq!(routed.engine.projections.lock()[0].nodes(), &[routed.cluster.local]);

  // Partitioned: the engine decides.
  let routed = common::routed(CacheConfig::new("part"), true, true);
  let proxy = routed.runtime.proxy();
  proxy.query(ScanQuery::<u32, String>::new()).unwrap().get_all().unwrap();
  assert!(routed.engine.projections.lock().is_empty());

  // Unless the query itself is local.
  proxy.query(ScanQuery::<u32, String>::new().local(true)).unwrap().get_all().unwrap();
  assert_eq!(routed.engine.projections.lock()[0].nodes(), &[routed.cluster.local]);
}

#[test]
fn test_text_and_spi_on_local_grid() {
  common::init_tracing();
  let grid = common::Grid::builder(indexed("text"))
    .shards(2)
    .text_matcher(|_type_name, text, _key, value: &String| value.contains(text))
    .spi_handler(|args: &[SqlValue]| {
      let min = match args.first() {
        Some(SqlValue::Int(n)) => *n as u32,
        _ => return Err(GridError::Query("expected a lower bound".to_string())),
      };
      let filter: EntryPredicate<u32, String> = Arc::new(move |k: &u32, _: &String| *k >= min);
      Ok(filter)
    })
    .build()
    .unwrap();
  let proxy = grid.proxy();
  for (k, v) in [(1, "apple"), (2, "banana"), (3, "cherry")] {
    proxy.put(k, v.to_string()).unwrap();
  }

  let rows = proxy.query(TextQuery::new("String", "an")).unwrap().get_all().unwrap();
  assert_eq!(rows, vec![(2, "banana".to_string())]);

  let rows = proxy
    .query(SpiQuery::new().args(vec![SqlValue::Int(2)]))
    .unwrap()
    .get_all()
    .unwrap();
  assert_eq!(sorted(rows).into_iter().map(|(k, _)| k).collect::<Vec<_>>(), vec![2, 3]);

  let err = proxy.query(SpiQuery::new()).unwrap_err();
  assert!(matches!(err, CacheError::Operation(GridError::Query(_))));

  // The local engine never runs SQL.
  let err = proxy.query(SqlQuery::new("String", "select")).unwrap_err();
  assert!(matches!(err, CacheError::Operation(GridError::Unsupported(_))));
}

#[test]
fn test_local_grid_without_handlers() {
  let grid = common::local_grid(indexed("bare"));
  let proxy = grid.proxy();
  assert!(matches!(
    proxy.query(TextQuery::new("String", "x")),
    Err(CacheError::IndexingModuleMissing)
  ));
  assert!(matches!(
    proxy.query(SpiQuery::new()),
    Err(CacheError::Operation(GridError::Unsupported(_)))
  ));
}

#[test]
fn test_queries_require_read_permission() {
  common::init_tracing();
  let denied = common::Grid::builder(CacheConfig::new("secured"))
    .security(Arc::new(PermissionSet::new().grant(Permission::CachePut)))
    .build()
    .unwrap();
  let err = denied.proxy().query(ScanQuery::<u32, String>::new()).unwrap_err();
  assert!(matches!(
    err,
    CacheError::Security {
      permission: Permission::CacheRead,
      ..
    }
  ));

  let granted = common::Grid::builder(CacheConfig::new("secured"))
    .security(Arc::new(PermissionSet::new().grant(Permission::CacheRead)))
    .build()
    .unwrap();
  assert!(granted.proxy().query(ScanQuery::<u32, String>::new()).unwrap().get_all().unwrap().is_empty());
}

#[test]
fn test_exhausted_scan_releases_its_fetch_once() {
  let grid = common::seeded_grid("iter");
  let proxy = grid.proxy().with_keep_raw().unwrap();
  let mut cursor = proxy.query(ScanQuery::<u32, String>::new()).unwrap();
  let rows: Vec<_> = cursor.by_ref().map(|r| r.unwrap()).collect();
  assert_eq!(rows.len(), 2);
  cursor.close().unwrap();
  drop(cursor);
  assert_eq!(proxy.metrics().cursors_released, 1);

  let entries: Vec<_> = proxy.iter().unwrap().map(|r| r.unwrap()).collect();
  assert_eq!(sorted(entries), vec![(1, "a".to_string()), (2, "b".to_string())]);
}
