use crate::context::SubjectId;
use crate::error::{CacheError, Result};

use std::collections::HashSet;
use std::fmt;

/// A cache permission checked before an operation is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
  CacheRead,
  CachePut,
  CacheRemove,
  CacheCreate,
  CacheDestroy,
}

impl fmt::Display for Permission {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Permission::CacheRead => "CACHE_READ",
      Permission::CachePut => "CACHE_PUT",
      Permission::CacheRemove => "CACHE_REMOVE",
      Permission::CacheCreate => "CACHE_CREATE",
      Permission::CacheDestroy => "CACHE_DESTROY",
    };
    f.write_str(name)
  }
}

/// Authorizes operations on behalf of a subject.
pub trait SecurityContext: Send + Sync {
  /// Fails with [`CacheError::Security`] when `subject` may not perform an
  /// operation requiring `permission` on `cache`.
  fn check_permission(&self, cache: &str, subject: Option<SubjectId>, permission: Permission) -> Result<()>;
}

/// Grants everything. Used when security is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SecurityContext for AllowAll {
  fn check_permission(&self, _cache: &str, _subject: Option<SubjectId>, _permission: Permission) -> Result<()> {
    Ok(())
  }
}

/// Grants a fixed set of permissions to every subject.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
  granted: HashSet<Permission>,
}

impl PermissionSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn grant(mut self, permission: Permission) -> Self {
    self.granted.insert(permission);
    self
  }

  pub fn is_granted(&self, permission: Permission) -> bool {
    self.granted.contains(&permission)
  }
}

impl SecurityContext for PermissionSet {
  fn check_permission(&self, cache: &str, _subject: Option<SubjectId>, permission: Permission) -> Result<()> {
    if self.is_granted(permission) {
      Ok(())
    } else {
      Err(CacheError::Security {
        permission,
        cache: cache.to_string(),
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn permission_set_denies_missing_grant() {
    let set = PermissionSet::new().grant(Permission::CachePut);
    assert!(set.check_permission("c", None, Permission::CachePut).is_ok());

    let err = set.check_permission("c", None, Permission::CacheRead).unwrap_err();
    assert_eq!(err.to_string(), "authorization failed [perm=CACHE_READ, cache=c]");
  }
}
