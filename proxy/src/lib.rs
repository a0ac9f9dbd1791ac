//! A lifecycle-gated client proxy for caches of an in-memory data grid.
//!
//! # Features
//! - **Gateway**: Every operation is admitted by the cache's gateway, so
//!   stopping a cache waits for in-flight work and rejects anything new.
//! - **Operation overlays**: Per-proxy settings (skip store, expiry policy,
//!   subject id, keep-raw, no-retries) derived as new proxies, never mutated.
//! - **Sync & Async**: One proxy type, two dispatch modes. Blocking proxies
//!   return values, deferred proxies return [`CacheFuture`]s.
//! - **Query routing**: Scan, text, SPI and SQL queries validated against the
//!   cache's indexing configuration and sent to the right execution path.
//! - **Continuous queries**: Listener registration, initial query and teardown
//!   bundled into one cursor.
//! - **Local grid**: A complete single-node grid in [`local`] for embedding and
//!   testing.

// Public modules that form the API
pub mod cluster;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod future;
pub mod gateway;
pub mod grid;
pub mod local;
pub mod metrics;
pub mod proxy;
pub mod query;
pub mod runtime;
pub mod security;

// Internal, crate-only modules
mod sync;

// Re-export the primary user-facing types for convenience
pub use config::{CacheConfig, CacheMode, QueryDefaults};
pub use context::{ExpiryPolicy, OperationContext, SubjectId};
pub use dispatch::{Blocking, Deferred, Dispatch};
pub use error::{BuildError, CacheError, GridError, Result};
pub use future::{CacheFuture, GridFuture, Promise};
pub use gateway::{Gateway, GatewayGuard, GatewayState};
pub use grid::{CacheLifecycle, GridCache, MutableEntry, PeekMode};
pub use local::{LocalGrid, LocalGridBuilder};
pub use metrics::MetricsSnapshot;
pub use proxy::{AsyncCacheProxy, CacheProxy, CompletionListener};
pub use query::{ContinuousQuery, EntryListenerConfig, Query, QueryCursor, ScanQuery, SpiQuery, SqlFieldsQuery, SqlQuery, TextQuery};
pub use runtime::{CacheRuntime, CacheRuntimeBuilder, TaskSpawner, ThreadSpawner};
pub use security::{Permission, SecurityContext};

#[cfg(feature = "tokio")]
pub use runtime::TokioSpawner;
