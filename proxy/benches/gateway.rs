use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fibre_proxy::{CacheConfig, Gateway, LocalGrid, OperationContext, ScanQuery};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const OPS_PER_THREAD: u64 = 10_000;

fn bench_gateway_enter_leave(c: &mut Criterion) {
  let mut group = c.benchmark_group("gateway/enter_leave");
  group.throughput(Throughput::Elements(1));

  let gateway = Gateway::new("bench");
  let ctx = OperationContext::new();
  group.bench_function("locking", |b| {
    b.iter(|| {
      let guard = gateway.enter(black_box(&ctx)).unwrap();
      drop(guard);
    })
  });
  group.bench_function("non_locking", |b| {
    b.iter(|| {
      let guard = gateway.enter_no_lock(black_box(&ctx)).unwrap();
      drop(guard);
    })
  });
  group.finish();
}

fn bench_gateway_contended(c: &mut Criterion) {
  let mut group = c.benchmark_group("gateway/contended");

  for threads in [2usize, 4, 8] {
    group.throughput(Throughput::Elements(threads as u64 * OPS_PER_THREAD));
    group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
      b.iter_custom(|iters| {
        let mut total = Duration::ZERO;
        for _ in 0..iters {
          let gateway = Arc::new(Gateway::new("bench"));
          let barrier = Arc::new(Barrier::new(threads + 1));
          let handles: Vec<_> = (0..threads)
            .map(|_| {
              let gateway = gateway.clone();
              let barrier = barrier.clone();
              thread::spawn(move || {
                let ctx = OperationContext::new();
                barrier.wait();
                for _ in 0..OPS_PER_THREAD {
                  drop(gateway.enter(&ctx).unwrap());
                }
              })
            })
            .collect();

          barrier.wait();
          let start = Instant::now();
          for handle in handles {
            handle.join().unwrap();
          }
          total += start.elapsed();
        }
        total
      })
    });
  }
  group.finish();
}

fn bench_proxy_ops(c: &mut Criterion) {
  let grid = LocalGrid::<u64, u64>::builder(CacheConfig::new("bench")).build().unwrap();
  let sync = grid.proxy();
  for i in 0..1_000 {
    sync.put(i, i).unwrap();
  }
  let deferred = sync.with_async();

  let mut group = c.benchmark_group("proxy");
  group.throughput(Throughput::Elements(1));
  group.bench_function("sync_get", |b| {
    let mut key = 0u64;
    b.iter(|| {
      key = (key + 1) % 1_000;
      black_box(sync.get(key).unwrap());
    })
  });
  group.bench_function("sync_put", |b| {
    let mut key = 0u64;
    b.iter(|| {
      key = (key + 1) % 1_000;
      sync.put(key, key).unwrap();
    })
  });
  group.bench_function("deferred_get", |b| {
    let mut key = 0u64;
    b.iter(|| {
      key = (key + 1) % 1_000;
      black_box(deferred.get(key).unwrap().get().unwrap());
    })
  });
  group.bench_function("scan_1000", |b| {
    b.iter(|| {
      let rows = sync.query(ScanQuery::<u64, u64>::new()).unwrap().get_all().unwrap();
      black_box(rows.len());
    })
  });
  group.finish();
}

criterion_group!(
  benches,
  bench_gateway_enter_leave,
  bench_gateway_contended,
  bench_proxy_ops
);
criterion_main!(benches);
