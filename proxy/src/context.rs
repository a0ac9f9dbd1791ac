//! Per-call operation overlays.
//!
//! An [`OperationContext`] is an immutable snapshot of the per-call settings a
//! proxy applies to every operation it issues. Deriving a new overlay never
//! touches the source value, so proxies created from one another can be used
//! concurrently without observing each other's configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the security principal an operation is performed on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(Uuid);

impl SubjectId {
  /// Creates a new, random subject id.
  pub fn random() -> Self {
    Self(Uuid::new_v4())
  }

  pub fn from_uuid(id: Uuid) -> Self {
    Self(id)
  }

  pub fn as_uuid(&self) -> &Uuid {
    &self.0
  }
}

impl fmt::Display for SubjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

/// Overrides the default expiry of entries written under an overlay.
///
/// Each field is the time-to-live applied after the corresponding event.
/// `None` leaves the entry's current expiry untouched for that event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExpiryPolicy {
  /// Lifetime of a newly created entry.
  pub creation: Option<Duration>,
  /// Lifetime restarted by every read of the entry.
  pub access: Option<Duration>,
  /// Lifetime restarted by every update of the entry.
  pub update: Option<Duration>,
}

impl ExpiryPolicy {
  /// Entries expire a fixed duration after they were created.
  pub fn created(ttl: Duration) -> Self {
    Self {
      creation: Some(ttl),
      access: None,
      update: None,
    }
  }

  /// Entries expire a fixed duration after they were last read or written.
  pub fn touched(ttl: Duration) -> Self {
    Self {
      creation: Some(ttl),
      access: Some(ttl),
      update: Some(ttl),
    }
  }

  /// Entries never expire.
  pub fn eternal() -> Self {
    Self::default()
  }

  pub fn is_eternal(&self) -> bool {
    self.creation.is_none() && self.access.is_none() && self.update.is_none()
  }
}

/// An immutable per-call configuration snapshot.
///
/// Every `with_*` method returns a new value with exactly one field changed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationContext {
  skip_store: bool,
  subject_id: Option<SubjectId>,
  keep_raw: bool,
  expiry_policy: Option<ExpiryPolicy>,
  no_retries: bool,
}

impl OperationContext {
  /// The overlay every proxy starts with: nothing overridden.
  pub fn new() -> Self {
    Self::default()
  }

  /// Bypass any external backing store.
  pub fn with_skip_store(&self) -> Self {
    Self {
      skip_store: true,
      ..self.clone()
    }
  }

  /// Perform operations on behalf of `subject_id`.
  pub fn with_subject_id(&self, subject_id: SubjectId) -> Self {
    Self {
      subject_id: Some(subject_id),
      ..self.clone()
    }
  }

  /// Return stored values in their encoded form instead of deserializing them.
  pub fn with_keep_raw(&self) -> Self {
    Self {
      keep_raw: true,
      ..self.clone()
    }
  }

  /// Apply `policy` to entries written under this overlay.
  pub fn with_expiry_policy(&self, policy: ExpiryPolicy) -> Self {
    Self {
      expiry_policy: Some(policy),
      ..self.clone()
    }
  }

  /// Disable automatic retries on topology changes.
  pub fn with_no_retries(&self) -> Self {
    Self {
      no_retries: true,
      ..self.clone()
    }
  }

  pub fn skip_store(&self) -> bool {
    self.skip_store
  }

  pub fn subject_id(&self) -> Option<SubjectId> {
    self.subject_id
  }

  pub fn keep_raw(&self) -> bool {
    self.keep_raw
  }

  pub fn expiry_policy(&self) -> Option<&ExpiryPolicy> {
    self.expiry_policy.as_ref()
  }

  pub fn no_retries(&self) -> bool {
    self.no_retries
  }
}
