//! Cache configuration as seen by the proxy.
//!
//! Configurations are plain serde structs so they can be kept in YAML next to
//! the rest of an application's settings:
//!
//! ```yaml
//! name: orders
//! mode: replicated
//! indexed_types:
//!   - key_type: u64
//!     value_type: Order
//! queries:
//!   scan_page_size: 512
//!   continuous_time_interval: 250ms
//! ```

use crate::error::BuildError;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a cache's data is distributed across the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
  /// Data lives only on the node that created the cache.
  Local,
  /// Every data node holds a full copy.
  Replicated,
  /// Data is split into partitions spread over the data nodes.
  #[default]
  Partitioned,
}

/// A key/value type pair registered for SQL and text indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedType {
  pub key_type: String,
  pub value_type: String,
}

/// Defaults applied to queries that leave a setting unspecified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryDefaults {
  pub scan_page_size: usize,
  pub continuous_page_size: usize,
  #[serde(with = "humantime_serde_compat")]
  pub continuous_time_interval: Duration,
  pub auto_unsubscribe: bool,
}

impl Default for QueryDefaults {
  fn default() -> Self {
    Self {
      scan_page_size: 1024,
      continuous_page_size: 1,
      continuous_time_interval: Duration::ZERO,
      auto_unsubscribe: true,
    }
  }
}

/// The configuration of one cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
  pub name: String,
  #[serde(default)]
  pub mode: CacheMode,
  #[serde(default)]
  pub indexed_types: Vec<IndexedType>,
  /// Enables indexing even when no types are registered.
  #[serde(default)]
  pub indexing_enabled: bool,
  /// Whether proxies participate in the gateway's in-flight accounting.
  #[serde(default = "default_locking")]
  pub locking: bool,
  #[serde(default)]
  pub read_through: bool,
  #[serde(default)]
  pub write_through: bool,
  #[serde(default)]
  pub queries: QueryDefaults,
}

fn default_locking() -> bool {
  true
}

impl CacheConfig {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      mode: CacheMode::default(),
      indexed_types: Vec::new(),
      indexing_enabled: false,
      locking: default_locking(),
      read_through: false,
      write_through: false,
      queries: QueryDefaults::default(),
    }
  }

  pub fn mode(mut self, mode: CacheMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn indexed_type(mut self, key_type: impl Into<String>, value_type: impl Into<String>) -> Self {
    self.indexed_types.push(IndexedType {
      key_type: key_type.into(),
      value_type: value_type.into(),
    });
    self
  }

  pub fn indexing_enabled(mut self, enabled: bool) -> Self {
    self.indexing_enabled = enabled;
    self
  }

  pub fn locking(mut self, locking: bool) -> Self {
    self.locking = locking;
    self
  }

  pub fn read_through(mut self, enabled: bool) -> Self {
    self.read_through = enabled;
    self
  }

  pub fn write_through(mut self, enabled: bool) -> Self {
    self.write_through = enabled;
    self
  }

  pub fn queries(mut self, queries: QueryDefaults) -> Self {
    self.queries = queries;
    self
  }

  /// Indexing is on when it is enabled explicitly or any type is registered.
  pub fn is_indexing_enabled(&self) -> bool {
    self.indexing_enabled || !self.indexed_types.is_empty()
  }

  pub fn validate(&self) -> Result<(), BuildError> {
    if self.name.is_empty() {
      return Err(BuildError::EmptyName);
    }
    if self.queries.scan_page_size == 0 {
      return Err(BuildError::InvalidConfig("scan_page_size must be positive".into()));
    }
    if self.queries.continuous_page_size == 0 {
      return Err(BuildError::InvalidConfig("continuous_page_size must be positive".into()));
    }
    Ok(())
  }

  pub fn from_yaml_str(yaml: &str) -> Result<Self, BuildError> {
    let config: Self = serde_yaml::from_str(yaml).map_err(|e| BuildError::InvalidConfig(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, BuildError> {
    let file = File::open(path.as_ref()).map_err(|e| {
      BuildError::InvalidConfig(format!("cannot open {}: {e}", path.as_ref().display()))
    })?;
    let config: Self =
      serde_yaml::from_reader(BufReader::new(file)).map_err(|e| BuildError::InvalidConfig(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  pub fn to_yaml_string(&self) -> Result<String, BuildError> {
    serde_yaml::to_string(self).map_err(|e| BuildError::InvalidConfig(e.to_string()))
  }
}

/// Human-readable durations ("250ms", "1m 30s") in configuration files.
mod humantime_serde_compat {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
  }
}
