mod common;

use common::MemoryStore;
use fibre_proxy::context::SubjectId;
use fibre_proxy::{CacheConfig, CacheError, ExpiryPolicy, PeekMode};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

#[test]
fn test_no_retries_derivation_is_idempotent() {
  let grid = common::local_grid(CacheConfig::new("overlay"));
  let proxy = grid.proxy();

  let once = proxy.with_no_retries().unwrap();
  let twice = once.with_no_retries().unwrap();
  assert_eq!(once.operation_context(), twice.operation_context());
  assert!(twice.operation_context().no_retries());
  assert!(!proxy.operation_context().no_retries(), "source proxy is untouched");
}

#[test]
fn test_derivations_stack_without_touching_the_source() {
  let grid = common::local_grid(CacheConfig::new("overlay"));
  let proxy = grid.proxy();
  let subject = SubjectId::random();

  let derived = proxy
    .with_skip_store()
    .unwrap()
    .with_keep_raw()
    .unwrap()
    .with_subject_id(subject)
    .unwrap();

  let ctx = derived.operation_context();
  assert!(ctx.skip_store());
  assert!(ctx.keep_raw());
  assert_eq!(ctx.subject_id(), Some(subject));
  assert_eq!(proxy.operation_context(), &fibre_proxy::OperationContext::new());
  assert!(proxy.same_cache(&derived));
}

#[test]
fn test_derivation_on_stopped_cache_fails() {
  let grid = common::local_grid(CacheConfig::new("overlay"));
  let proxy = grid.proxy();
  assert!(proxy.close().unwrap());
  assert!(matches!(proxy.with_skip_store(), Err(CacheError::Closed { .. })));

  let other = grid.proxy();
  assert!(matches!(other.with_keep_raw(), Err(CacheError::Stopped { .. })));
}

#[test]
fn test_skip_store_bypasses_write_through() {
  common::init_tracing();
  let store = MemoryStore::with_entries(&[]);
  let grid = common::Grid::builder(CacheConfig::new("through").write_through(true).read_through(true))
    .store(store.clone())
    .build()
    .unwrap();
  let proxy = grid.proxy();

  proxy.put(1, "stored".to_string()).unwrap();
  assert_eq!(store.writes.load(Ordering::SeqCst), 1);

  proxy.with_skip_store().unwrap().put(2, "memory only".to_string()).unwrap();
  assert_eq!(store.writes.load(Ordering::SeqCst), 1);
  assert!(!store.data.lock().contains_key(&2));
  assert_eq!(proxy.get(2).unwrap(), Some("memory only".to_string()));
}

#[test]
fn test_skip_store_bypasses_read_through() {
  common::init_tracing();
  let store = MemoryStore::with_entries(&[(7, "from store")]);
  let grid = common::Grid::builder(CacheConfig::new("through").read_through(true))
    .store(store.clone())
    .build()
    .unwrap();
  let proxy = grid.proxy();

  assert_eq!(proxy.with_skip_store().unwrap().get(7).unwrap(), None);
  assert_eq!(proxy.get(7).unwrap(), Some("from store".to_string()));
  assert_eq!(proxy.local_peek(&7, &[PeekMode::OnHeap]).unwrap(), Some("from store".to_string()));
}

#[test]
fn test_expiry_policy_applies_to_created_entries() {
  let grid = common::local_grid(CacheConfig::new("ttl"));
  let proxy = grid.proxy();
  let short = proxy
    .with_expiry_policy(ExpiryPolicy::created(Duration::from_millis(30)))
    .unwrap();

  short.put(1, "short".to_string()).unwrap();
  proxy.put(2, "eternal".to_string()).unwrap();
  assert_eq!(proxy.get(1).unwrap(), Some("short".to_string()));

  thread::sleep(Duration::from_millis(60));
  assert_eq!(proxy.get(1).unwrap(), None);
  assert_eq!(proxy.get(2).unwrap(), Some("eternal".to_string()));
  assert_eq!(proxy.local_size(&[]).unwrap(), 1);
}

#[test]
fn test_failed_write_through_leaves_entry_unchanged() {
  common::init_tracing();
  let store = MemoryStore::with_entries(&[]);
  let grid = common::Grid::builder(CacheConfig::new("through").write_through(true))
    .store(store.clone())
    .build()
    .unwrap();
  let proxy = grid.proxy();

  proxy.put(1, "old".to_string()).unwrap();
  store.fail_writes.store(true, Ordering::SeqCst);

  let err = proxy.put(1, "new".to_string()).unwrap_err();
  assert!(matches!(err, CacheError::Operation(fibre_proxy::GridError::Store(_))));
  assert_eq!(proxy.get(1).unwrap(), Some("old".to_string()));
}
