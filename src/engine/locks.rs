//! Per-key serialization arena.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::fingerprint::Fingerprint;

/// One FIFO async lock per fingerprint, created on demand and dropped when unused.
///
/// Commits and fetch completions for a key run while holding its lock, so they never
/// interleave. Unrelated keys never wait on each other.
#[derive(Default)]
pub(crate) struct KeyLocks {
  locks: Mutex<HashMap<Fingerprint, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive access to `fingerprint`. Waiters are served in arrival order.
  pub(crate) async fn acquire(&self, fingerprint: &Fingerprint) -> KeyGuard<'_> {
    let lock = {
      let mut locks = self.locks.lock();
      // Waiters cancelled after a release leave their lock behind
      locks.retain(|_, lock| Arc::strong_count(lock) > 1);
      Arc::clone(
        locks
          .entry(fingerprint.clone())
          .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
      )
    };
    let guard = Arc::clone(&lock).lock_owned().await;

    KeyGuard {
      owner: self,
      fingerprint: fingerprint.clone(),
      lock: Some(lock),
      guard: Some(guard),
    }
  }

  #[cfg(test)]
  fn tracked(&self) -> usize {
    self.locks.lock().len()
  }
}

pub(crate) struct KeyGuard<'a> {
  owner: &'a KeyLocks,
  fingerprint: Fingerprint,
  lock: Option<Arc<AsyncMutex<()>>>,
  guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
  fn drop(&mut self) {
    drop(self.guard.take());
    drop(self.lock.take());

    let mut locks = self.owner.locks.lock();
    // Only the map still references the lock: nobody is waiting
    if locks
      .get(&self.fingerprint)
      .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
      locks.remove(&self.fingerprint);
    }
  }
}
