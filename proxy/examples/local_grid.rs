use fibre_proxy::query::continuous::CacheEntryEvent;
use fibre_proxy::{CacheConfig, ContinuousQuery, ExpiryPolicy, LocalGrid, ScanQuery, SqlQuery};
use std::time::Duration;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let grid = LocalGrid::<u32, String>::builder(CacheConfig::new("people"))
    .shards(8)
    .build()
    .expect("Failed to build local grid");
  let people = grid.proxy();

  println!("--- Subscribing to changes ---");
  let mut subscription = people
    .query(
      ContinuousQuery::<u32, String>::new()
        .local_listener(|events: Vec<CacheEntryEvent<u32, String>>| {
          for event in events {
            println!("[listener] {:?} key={} value={:?}", event.event_type(), event.key(), event.value());
          }
        })
        .initial_query(ScanQuery::<u32, String>::new()),
    )
    .expect("Failed to subscribe");
  println!("Initial rows: {}", subscription.by_ref().count());

  println!("\n--- Blocking operations ---");
  people.put(1, "Ada".to_string()).unwrap();
  people.put(2, "Grace".to_string()).unwrap();
  println!("get(1) = {:?}", people.get(1).unwrap());

  println!("\n--- Async operations ---");
  let async_people = people.with_async();
  async_people.put(3, "Barbara".to_string()).unwrap().await.unwrap();
  let removed = async_people.get_and_remove(2).unwrap().await.unwrap();
  println!("get_and_remove(2) = {:?}", removed);

  println!("\n--- Per-call overlays ---");
  let short_lived = people
    .with_expiry_policy(ExpiryPolicy::created(Duration::from_millis(100)))
    .unwrap();
  short_lived.put(4, "Edsger".to_string()).unwrap();
  println!("size before expiry = {}", people.size(&[]).unwrap());
  tokio::time::sleep(Duration::from_millis(150)).await;
  println!("get(4) after expiry = {:?}", people.get(4).unwrap());

  println!("\n--- Queries ---");
  let long_names = people
    .query(ScanQuery::<u32, String>::with_filter(|_, name| name.len() > 3))
    .unwrap()
    .get_all()
    .unwrap();
  println!("names longer than 3 chars: {:?}", long_names);
  match people.query(SqlQuery::new("String", "select * from String")) {
    Ok(_) => println!("SQL query ran"),
    Err(e) => println!("SQL query rejected: {e}"),
  }

  println!("\n--- Shutdown ---");
  subscription.close().unwrap();
  let closed = tokio::task::spawn_blocking(move || people.close()).await.unwrap();
  println!("closed = {:?}", closed);
  println!("metrics = {:#?}", grid.runtime().metrics().snapshot());
}
