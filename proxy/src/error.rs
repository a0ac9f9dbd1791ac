use std::fmt;

use thiserror::Error;

use crate::query::continuous::ListenerId;
use crate::query::QueryKind;
use crate::security::Permission;

/// The user-facing error type returned by every proxy operation.
///
/// Internal failures raised by the grid collaborators ([`GridError`]) never
/// escape a proxy method directly; they are converted into
/// [`CacheError::Operation`] at the proxy boundary, both for synchronous calls
/// and when an asynchronous [`CacheFuture`](crate::CacheFuture) is resolved.
#[derive(Debug, Error)]
pub enum CacheError {
  /// The cache gateway is stopping or stopped; no new operation is admitted.
  #[error("cache has been stopped: {name}")]
  Stopped { name: String },

  /// This proxy instance was closed and has been made permanently inert.
  #[error("cache has been closed: {name}")]
  Closed { name: String },

  /// The caller lacks the permission required by the operation.
  #[error("authorization failed [perm={permission}, cache={cache}]")]
  Security { permission: Permission, cache: String },

  /// An indexed query was issued against a cache configured without indexing.
  #[error(
    "indexing is disabled for cache: {cache}. Set `indexed_types` or `indexing_enabled` in the cache configuration to enable it"
  )]
  IndexingDisabled { cache: String },

  /// The indexing module is not available on this node.
  #[error("failed to execute query: add the indexing module to every node of the grid")]
  IndexingModuleMissing,

  /// The query descriptor is of a kind this entry point cannot execute.
  #[error("unsupported query type: {kind}{}", hint_suffix(.hint))]
  UnsupportedQuery {
    kind: QueryKind,
    hint: Option<String>,
  },

  /// A continuous query subscription request was malformed.
  #[error("invalid continuous query: {0}")]
  InvalidContinuousQuery(String),

  /// An entry listener with the same id is already registered on the cache.
  #[error("entry listener is already registered: {0}")]
  ListenerAlreadyRegistered(ListenerId),

  /// A query cursor was iterated after it was consumed or closed.
  #[error("query cursor is already fetched or was closed")]
  CursorConsumed,

  /// Both steps of a continuous query teardown failed.
  #[error("continuous query teardown failed: cursor close: {cursor}; routine stop: {routine}")]
  Teardown {
    cursor: Box<CacheError>,
    routine: Box<CacheError>,
  },

  /// The underlying grid operation failed.
  #[error("cache operation failed: {0}")]
  Operation(#[from] GridError),
}

impl CacheError {
  /// Returns `true` for the two admission failures that mean the proxy can
  /// no longer be used (`Stopped` or `Closed`).
  pub fn is_lifecycle(&self) -> bool {
    matches!(self, CacheError::Stopped { .. } | CacheError::Closed { .. })
  }
}

fn hint_suffix(hint: &Option<String>) -> String {
  hint.as_deref().map(|h| format!(". {h}")).unwrap_or_default()
}

/// An internal failure raised by a grid collaborator (storage, query engine,
/// continuous query processor, cache lifecycle).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
  /// The cluster topology changed while the operation was in progress.
  #[error("topology changed: {0}")]
  Topology(String),

  /// The external backing store failed.
  #[error("cache store failure: {0}")]
  Store(String),

  /// An entry processor failed while being applied.
  #[error("entry processor failed: {0}")]
  EntryProcessor(String),

  /// A query failed on a remote or local node.
  #[error("query execution failed: {0}")]
  Query(String),

  /// The collaborator does not support the requested capability.
  #[error("operation not supported: {0}")]
  Unsupported(String),

  /// No continuous query routine is registered under the given id.
  #[error("unknown continuous query routine: {0}")]
  UnknownRoutine(String),

  /// The operation was cancelled before it completed.
  #[error("operation cancelled")]
  Cancelled,

  /// The producing side of a future went away without completing it.
  #[error("future was dropped before completion")]
  Abandoned,

  /// Any other internal failure.
  #[error("{0}")]
  Internal(String),
}

/// Errors that can occur when building a cache runtime or a local grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  /// The cache name was empty.
  EmptyName,
  /// No delegate cache was supplied.
  MissingDelegate,
  /// A required collaborator was not supplied.
  MissingCollaborator(&'static str),
  /// The configuration could not be parsed or was invalid.
  InvalidConfig(String),
}

impl fmt::Display for BuildError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildError::EmptyName => write!(f, "cache name cannot be empty"),
      BuildError::MissingDelegate => write!(f, "a delegate cache is required"),
      BuildError::MissingCollaborator(what) => write!(f, "missing collaborator: {what}"),
      BuildError::InvalidConfig(msg) => write!(f, "invalid cache configuration: {msg}"),
    }
  }
}

impl std::error::Error for BuildError {}

/// A specialized `Result` type for proxy operations.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;
