use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::RetryPolicy;

/// Engine settings. Every field has a default, so an empty file is a valid config.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
  /// TTL applied to reads that don't set one; `null` means entries never expire
  pub default_ttl_ms: Option<u64>,
  /// How long a commit may take before its optimistic write is rolled back
  pub rollback_timeout_ms: u64,
  pub retry: RetryConfig,
  pub offline_queue: QueueConfig,
  pub conflict: ConflictPolicy,
  pub persistence: PersistenceConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: Some(5 * 60 * 1000),
      rollback_timeout_ms: 10_000,
      retry: RetryConfig::default(),
      offline_queue: QueueConfig::default(),
      conflict: ConflictPolicy::default(),
      persistence: PersistenceConfig::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Retries after the first attempt, for both fetches and commits
  pub max_retries: u32,
  /// First backoff; doubles for every further retry
  pub backoff_ms: u64,
  pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 2,
      backoff_ms: 100,
      max_backoff_ms: 5_000,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
  pub capacity: usize,
  pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      capacity: 256,
      overflow: OverflowPolicy::default(),
    }
  }
}

/// What the offline queue does when a mutation arrives while it is full.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
  /// Evict the oldest queued mutation, failing it with a capacity error
  #[default]
  DropOldest,
  /// Refuse the new mutation with a capacity error
  RejectNew,
}

/// How a queued mutation is reconciled when the server changed while offline.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
  /// Commit the queued value regardless
  #[default]
  ClientWins,
  /// Drop the queued mutation and keep the server's value
  ServerWins,
  /// Commit the result of a caller-supplied merge function
  Merge,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
  pub enabled: bool,
  /// Database path (defaults to the data directory)
  pub path: Option<PathBuf>,
}

impl EngineConfig {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./syncache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/syncache/config.yaml
  ///
  /// Without any file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("syncache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("syncache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document deserializes to null, which means "all defaults"
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  pub fn to_yaml(&self) -> Result<String> {
    Ok(serde_yaml::to_string(self)?)
  }

  pub fn default_ttl(&self) -> Option<Duration> {
    self.default_ttl_ms.map(Duration::from_millis)
  }

  pub fn rollback_timeout(&self) -> Duration {
    Duration::from_millis(self.rollback_timeout_ms)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.retry.max_retries,
      backoff: Duration::from_millis(self.retry.backoff_ms),
      max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
    }
  }

  /// Database path for persistence, falling back to the default data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.persistence.path {
      Some(path) => Ok(path.clone()),
      None => crate::cache::SqliteStorage::default_path(),
    }
  }
}
