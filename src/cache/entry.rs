//! Core types for cached entries and read outcomes.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
  /// Value is current and within its TTL
  Fresh,
  /// Value was invalidated or expired and should be refetched on next use
  Stale,
  /// Exactly one fetch for this key is in flight
  Revalidating,
  /// The last fetch failed; any value held is the last known good one
  Error,
}

impl fmt::Display for EntryState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Fresh => "fresh",
      Self::Stale => "stale",
      Self::Revalidating => "revalidating",
      Self::Error => "error",
    };
    f.write_str(s)
  }
}

/// A cached value plus the metadata the engine needs to keep it coherent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
  /// The payload; `None` for a placeholder whose first fetch has not produced a value
  pub value: Option<V>,
  pub tags: BTreeSet<String>,
  pub created_at: DateTime<Utc>,
  /// When the entry stops being fresh; `None` never expires
  pub expires_at: Option<DateTime<Utc>>,
  pub state: EntryState,
  /// Bumped by every write to the value
  pub version: u64,
  /// Message of the fetch failure that put the entry in `Error`
  #[serde(default)]
  pub last_error: Option<String>,
}

impl<V> CacheEntry<V> {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| now >= at)
  }

  /// Fresh and within its TTL, i.e. servable without any I/O.
  pub fn is_servable(&self, now: DateTime<Utc>) -> bool {
    self.state == EntryState::Fresh && self.value.is_some() && !self.is_expired(now)
  }

  pub fn has_tag(&self, tag: &str) -> bool {
    self.tags.contains(tag)
  }
}

/// Target of an invalidation or subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
  /// A single cached resource
  Key(Fingerprint),
  /// Every resource carrying the tag
  Tag(String),
}

impl Selector {
  pub fn key(fingerprint: Fingerprint) -> Self {
    Self::Key(fingerprint)
  }

  pub fn tag(tag: impl Into<String>) -> Self {
    Self::Tag(tag.into())
  }

  /// Whether the selector covers a resource with the given fingerprint and tags.
  pub fn matches(&self, fingerprint: &Fingerprint, tags: &BTreeSet<String>) -> bool {
    match self {
      Self::Key(fp) => fp == fingerprint,
      Self::Tag(tag) => tags.contains(tag),
    }
  }
}

impl fmt::Display for Selector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Key(fp) => write!(f, "key:{}", fp),
      Self::Tag(tag) => write!(f, "tag:{}", tag),
    }
  }
}

/// Result of a read, including metadata about where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// Entry version the data was read at (if from cache)
  pub version: Option<u64>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      version: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, version: u64, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      version: Some(version),
    }
  }

  /// Create a new cache result serving the last known good value after a failed fetch.
  pub fn fallback(data: T, version: u64) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      version: Some(version),
    }
  }

  pub fn into_data(self) -> T {
    self.data
  }
}

/// Indicates where read data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the fetcher
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, stale, served while a refetch runs in the background
  CacheStale,
  /// Last known good value of an entry whose last fetch failed
  Fallback,
}
