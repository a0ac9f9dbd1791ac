#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use fibre_proxy::cluster::{ClusterGroup, ClusterResolver, NodeId};
use fibre_proxy::grid::EntryPredicate;
use fibre_proxy::local::CacheStore;
use fibre_proxy::query::continuous::{ContinuousQueries, RoutineId, Subscription};
use fibre_proxy::query::engine::{CacheQuery, QueryEngine, QueryFetch};
use fibre_proxy::query::{QueryCursor, Row, SqlFieldsQuery, SqlQuery, SqlValue};
use fibre_proxy::{
  CacheConfig, CacheLifecycle, CacheRuntime, Gateway, GridError, GridFuture, LocalGrid, OperationContext,
};
use parking_lot::Mutex;

pub type Grid = LocalGrid<u32, String>;

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

pub fn local_grid(config: CacheConfig) -> Grid {
  init_tracing();
  LocalGrid::builder(config).shards(4).build().unwrap()
}

/// A grid holding `[(1, "a"), (2, "b")]`.
pub fn seeded_grid(name: &str) -> Grid {
  let grid = local_grid(CacheConfig::new(name));
  let proxy = grid.proxy();
  proxy.put(1, "a".to_string()).unwrap();
  proxy.put(2, "b".to_string()).unwrap();
  grid
}

pub fn sorted<T: Ord>(mut rows: Vec<T>) -> Vec<T> {
  rows.sort();
  rows
}

// --- Backing store ---

#[derive(Default)]
pub struct MemoryStore {
  pub data: Mutex<HashMap<u32, String>>,
  pub fail_writes: AtomicBool,
  pub writes: AtomicUsize,
  pub loads: AtomicUsize,
}

impl MemoryStore {
  pub fn with_entries(entries: &[(u32, &str)]) -> Arc<Self> {
    let store = Self::default();
    store
      .data
      .lock()
      .extend(entries.iter().map(|(k, v)| (*k, v.to_string())));
    Arc::new(store)
  }
}

impl CacheStore<u32, String> for MemoryStore {
  fn load(&self, key: &u32) -> Result<Option<String>, GridError> {
    self.loads.fetch_add(1, Ordering::SeqCst);
    Ok(self.data.lock().get(key).cloned())
  }

  fn write(&self, key: &u32, value: &String) -> Result<(), GridError> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(GridError::Store(format!("write of {key} rejected")));
    }
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.data.lock().insert(*key, value.clone());
    Ok(())
  }

  fn delete(&self, key: &u32) -> Result<(), GridError> {
    self.data.lock().remove(key);
    Ok(())
  }

  fn load_cache(&self, _args: &[SqlValue], sink: &mut dyn FnMut(u32, String)) -> Result<(), GridError> {
    for (key, value) in self.data.lock().iter() {
      sink(*key, value.clone());
    }
    Ok(())
  }
}

// --- Query engine ---

/// A query engine over a fixed set of rows that records how it was used.
pub struct RecordingEngine {
  rows: Vec<(u32, String)>,
  module: bool,
  pub log: Arc<Mutex<Vec<&'static str>>>,
  pub cancels: Arc<AtomicUsize>,
  pub fail_cancel: Arc<AtomicBool>,
  pub two_step: AtomicUsize,
  pub local: AtomicUsize,
  pub projections: Arc<Mutex<Vec<ClusterGroup>>>,
}

impl RecordingEngine {
  pub fn new(rows: &[(u32, &str)], module: bool, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
    Arc::new(Self {
      rows: rows.iter().map(|(k, v)| (*k, v.to_string())).collect(),
      module,
      log,
      cancels: Arc::new(AtomicUsize::new(0)),
      fail_cancel: Arc::new(AtomicBool::new(false)),
      two_step: AtomicUsize::new(0),
      local: AtomicUsize::new(0),
      projections: Arc::new(Mutex::new(Vec::new())),
    })
  }

  fn prepare(&self, filter: Option<EntryPredicate<u32, String>>) -> Box<dyn CacheQuery<u32, String>> {
    let rows = self
      .rows
      .iter()
      .filter(|(k, v)| filter.as_ref().map_or(true, |f| f(k, v)))
      .cloned()
      .collect();
    Box::new(RecordingQuery {
      rows,
      log: self.log.clone(),
      cancels: self.cancels.clone(),
      fail_cancel: self.fail_cancel.clone(),
      projections: self.projections.clone(),
    })
  }
}

struct RecordingQuery {
  rows: Vec<(u32, String)>,
  log: Arc<Mutex<Vec<&'static str>>>,
  cancels: Arc<AtomicUsize>,
  fail_cancel: Arc<AtomicBool>,
  projections: Arc<Mutex<Vec<ClusterGroup>>>,
}

impl CacheQuery<u32, String> for RecordingQuery {
  fn projection(&mut self, group: ClusterGroup) {
    self.projections.lock().push(group);
  }

  fn page_size(&mut self, _page_size: usize) {}

  fn execute(self: Box<Self>, _args: Vec<SqlValue>) -> Result<Box<dyn QueryFetch<u32, String>>, GridError> {
    self.log.lock().push("query");
    Ok(Box::new(RecordingFetch {
      rows: self.rows.into_iter(),
      cancels: self.cancels,
      fail_cancel: self.fail_cancel,
    }))
  }
}

struct RecordingFetch {
  rows: std::vec::IntoIter<(u32, String)>,
  cancels: Arc<AtomicUsize>,
  fail_cancel: Arc<AtomicBool>,
}

impl QueryFetch<u32, String> for RecordingFetch {
  fn next_entry(&mut self) -> Result<Option<(u32, String)>, GridError> {
    Ok(self.rows.next())
  }

  fn cancel(&mut self) -> Result<(), GridError> {
    self.cancels.fetch_add(1, Ordering::SeqCst);
    if self.fail_cancel.load(Ordering::SeqCst) {
      return Err(GridError::Query("fetch already released".to_string()));
    }
    Ok(())
  }
}

impl QueryEngine<u32, String> for RecordingEngine {
  fn module_enabled(&self) -> bool {
    self.module
  }

  fn create_scan_query(
    &self,
    _cache: &str,
    filter: Option<EntryPredicate<u32, String>>,
    _partition: Option<u32>,
    _keep_raw: bool,
  ) -> Box<dyn CacheQuery<u32, String>> {
    self.prepare(filter)
  }

  fn create_text_query(&self, _: &str, _: &str, _: &str, _: bool) -> Box<dyn CacheQuery<u32, String>> {
    self.prepare(None)
  }

  fn create_spi_query(&self, _: &str, _: bool) -> Box<dyn CacheQuery<u32, String>> {
    self.prepare(None)
  }

  fn query_two_step(&self, _: &str, _: &OperationContext, _: &SqlQuery) -> Result<QueryCursor<(u32, String)>, GridError> {
    self.two_step.fetch_add(1, Ordering::SeqCst);
    self.log.lock().push("query");
    Ok(QueryCursor::from_rows(self.rows.clone()))
  }

  fn query_two_step_fields(&self, _: &str, _: &OperationContext, _: &SqlFieldsQuery) -> Result<QueryCursor<Row>, GridError> {
    self.two_step.fetch_add(1, Ordering::SeqCst);
    Ok(QueryCursor::empty())
  }

  fn query_local(&self, _: &str, _: &OperationContext, _: &SqlQuery) -> Result<QueryCursor<(u32, String)>, GridError> {
    self.local.fetch_add(1, Ordering::SeqCst);
    self.log.lock().push("query");
    Ok(QueryCursor::from_rows(self.rows.clone()))
  }

  fn query_local_fields(&self, _: &str, _: &OperationContext, _: &SqlFieldsQuery) -> Result<QueryCursor<Row>, GridError> {
    self.local.fetch_add(1, Ordering::SeqCst);
    Ok(QueryCursor::empty())
  }
}

// --- Continuous queries ---

/// Records registrations and stops without delivering any event.
pub struct RecordingContinuous {
  pub log: Arc<Mutex<Vec<&'static str>>>,
  pub fail_stop: AtomicBool,
  pub registered: AtomicUsize,
  pub stopped: AtomicUsize,
  pub targets: Mutex<Vec<Option<ClusterGroup>>>,
}

impl RecordingContinuous {
  pub fn new(log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
    Arc::new(Self {
      log,
      fail_stop: AtomicBool::new(false),
      registered: AtomicUsize::new(0),
      stopped: AtomicUsize::new(0),
      targets: Mutex::new(Vec::new()),
    })
  }
}

impl ContinuousQueries<u32, String> for RecordingContinuous {
  fn execute_query(&self, _cache: &str, subscription: Subscription<u32, String>) -> Result<RoutineId, GridError> {
    self.log.lock().push("register");
    self.registered.fetch_add(1, Ordering::SeqCst);
    self.targets.lock().push(subscription.target);
    Ok(RoutineId::random())
  }

  fn stop_routine(&self, id: RoutineId) -> GridFuture<()> {
    self.log.lock().push("stop");
    self.stopped.fetch_add(1, Ordering::SeqCst);
    if self.fail_stop.load(Ordering::SeqCst) {
      return GridFuture::failed(GridError::UnknownRoutine(id.to_string()));
    }
    GridFuture::ready(())
  }
}

// --- Cluster and lifecycle ---

/// A cluster whose layout is fixed by the test.
pub struct StaticCluster {
  pub local: NodeId,
  pub data: Vec<NodeId>,
}

impl StaticCluster {
  /// This node plus two others, all holding data when `data_node` is set.
  pub fn new(data_node: bool) -> Arc<Self> {
    let local = NodeId::random();
    let mut data = vec![NodeId::random(), NodeId::random()];
    if data_node {
      data.push(local);
    }
    Arc::new(Self { local, data })
  }
}

impl ClusterResolver for StaticCluster {
  fn local_node(&self) -> NodeId {
    self.local
  }

  fn data_nodes(&self, _cache: &str) -> ClusterGroup {
    ClusterGroup::new(self.data.clone())
  }

  fn is_data_node(&self, _cache: &str) -> bool {
    self.data.contains(&self.local)
  }
}

/// Stops the gateway on a background thread.
pub struct GatewayLifecycle {
  pub gateway: Arc<Gateway>,
}

impl CacheLifecycle for GatewayLifecycle {
  fn close_cache(&self, _name: &str) -> GridFuture<bool> {
    let (future, promise) = GridFuture::pending();
    let performed = self.gateway.request_stop();
    let gateway = self.gateway.clone();
    thread::spawn(move || {
      gateway.stop();
      promise.complete(Ok(performed));
    });
    future
  }

  fn destroy_cache(&self, name: &str) -> GridFuture<bool> {
    self.close_cache(name)
  }

  fn is_closed(&self, _name: &str) -> bool {
    self.gateway.is_stopped()
  }

  fn rebalance(&self, _name: &str) -> GridFuture<()> {
    GridFuture::ready(())
  }
}

/// Collaborators of a runtime routed through recording mocks.
pub struct Routed {
  pub grid: Grid,
  pub runtime: Arc<CacheRuntime<u32, String>>,
  pub engine: Arc<RecordingEngine>,
  pub continuous: Arc<RecordingContinuous>,
  pub cluster: Arc<StaticCluster>,
  pub log: Arc<Mutex<Vec<&'static str>>>,
}

/// A runtime storing data in a local grid but routing queries to mocks.
pub fn routed(config: CacheConfig, module: bool, data_node: bool) -> Routed {
  init_tracing();
  let grid = LocalGrid::builder(config.clone()).shards(4).build().unwrap();
  let log = Arc::new(Mutex::new(Vec::new()));
  let engine = RecordingEngine::new(&[(1, "a"), (2, "b")], module, log.clone());
  let continuous = RecordingContinuous::new(log.clone());
  let cluster = StaticCluster::new(data_node);
  let gateway = Arc::new(Gateway::new(config.name.as_str()));

  let runtime = CacheRuntime::<u32, String>::builder(config)
    .gateway(gateway.clone())
    .delegate(grid.cache().clone())
    .query_engine(engine.clone())
    .continuous_queries(continuous.clone())
    .cluster(cluster.clone())
    .lifecycle(Arc::new(GatewayLifecycle { gateway }))
    .build()
    .unwrap();

  Routed {
    grid,
    runtime,
    engine,
    continuous,
    cluster,
    log,
  }
}
