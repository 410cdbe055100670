//! Error taxonomy for engine operations.

use std::time::Duration;

use color_eyre::Report;

/// Errors surfaced by [`SyncEngine`](crate::SyncEngine) operations.
///
/// Caller-supplied closures report failures as `color_eyre` reports; the engine keeps the
/// rendered message so one failure can be handed to every waiter of a coalesced fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
  /// The fetcher failed after exhausting retries.
  #[error("fetch failed: {0}")]
  Fetch(String),

  /// The committer failed after exhausting retries.
  #[error("commit failed: {0}")]
  Commit(String),

  /// The commit did not settle within the rollback timeout.
  #[error("commit timed out after {0:?}")]
  Timeout(Duration),

  /// The offline queue refused or evicted the mutation.
  #[error("offline queue is full (capacity {capacity})")]
  QueueCapacity { capacity: usize },

  /// The merge resolver failed while reconciling a queued mutation.
  #[error("conflict resolution failed: {0}")]
  Conflict(String),

  /// The engine was shut down before the operation settled.
  #[error("engine shut down")]
  Shutdown,

  /// Invalid engine configuration.
  #[error("invalid configuration: {0}")]
  Config(String),
}

impl SyncError {
  pub(crate) fn fetch(report: &Report) -> Self {
    Self::Fetch(format!("{report:#}"))
  }

  pub(crate) fn commit(report: &Report) -> Self {
    Self::Commit(format!("{report:#}"))
  }

  pub(crate) fn conflict(report: &Report) -> Self {
    Self::Conflict(format!("{report:#}"))
  }

  /// Whether the error ended a mutation because of its rollback timeout.
  pub fn is_timeout(&self) -> bool {
    matches!(self, Self::Timeout(_))
  }
}

pub type SyncResult<T> = Result<T, SyncError>;
