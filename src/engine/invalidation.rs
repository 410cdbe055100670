//! Invalidation routing and TTL expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::mutation::Invalidation;
use super::{Inner, NotifyReason, Payload};
use crate::cache::{CacheEntry, EntryState, Selector};
use crate::fingerprint::Fingerprint;

/// One expiry timer per fingerprint, tagged with the entry version it was armed for.
pub(crate) struct ExpiryTimers {
  timers: Mutex<HashMap<Fingerprint, (u64, JoinHandle<()>)>>,
}

impl ExpiryTimers {
  pub(crate) fn new() -> Self {
    Self {
      timers: Mutex::new(HashMap::new()),
    }
  }

  fn replace(&self, fingerprint: &Fingerprint, version: u64, handle: JoinHandle<()>) {
    if let Some((_, previous)) = self
      .timers
      .lock()
      .insert(fingerprint.clone(), (version, handle))
    {
      previous.abort();
    }
  }

  pub(crate) fn cancel(&self, fingerprint: &Fingerprint) {
    if let Some((_, timer)) = self.timers.lock().remove(fingerprint) {
      timer.abort();
    }
  }

  /// Forget a timer that fired, unless it was already replaced.
  fn finish(&self, fingerprint: &Fingerprint, version: u64) {
    let mut timers = self.timers.lock();
    if timers.get(fingerprint).is_some_and(|(v, _)| *v == version) {
      timers.remove(fingerprint);
    }
  }

  pub(crate) fn abort_all(&self) {
    for (_, (_, timer)) in self.timers.lock().drain() {
      timer.abort();
    }
  }

  #[cfg(test)]
  fn armed(&self, fingerprint: &Fingerprint) -> bool {
    self.timers.lock().contains_key(fingerprint)
  }
}

impl<V: Payload> Inner<V> {
  /// Mark every entry matched by `selector` stale. Returns the number matched.
  pub(crate) fn invalidate(self: &Arc<Self>, selector: &Selector) -> usize {
    let keys = match selector {
      Selector::Key(fingerprint) if self.store.contains(fingerprint) => vec![fingerprint.clone()],
      Selector::Key(_) => Vec::new(),
      Selector::Tag(tag) => self.store.keys_with_tag(tag),
    };
    for fingerprint in &keys {
      self.invalidate_key(fingerprint);
    }
    tracing::debug!(%selector, matched = keys.len(), "invalidated");
    keys.len()
  }

  pub(crate) fn invalidate_key(self: &Arc<Self>, fingerprint: &Fingerprint) {
    let outcome = self
      .mutations
      .invalidate_unless_pending(&self.store, fingerprint);
    self.finish_invalidation(fingerprint, outcome);
  }

  fn finish_invalidation(self: &Arc<Self>, fingerprint: &Fingerprint, outcome: Invalidation<V>) {
    match outcome {
      Invalidation::Deferred => {
        tracing::debug!(%fingerprint, "invalidation deferred until pending mutations settle")
      }
      Invalidation::Unchanged => {}
      Invalidation::Applied(entry) => {
        self.timers.cancel(fingerprint);
        self.subscriptions.notify(
          fingerprint,
          &entry.tags,
          entry.value.as_ref(),
          NotifyReason::Invalidated,
        );
        if !self.is_closed() && self.subscriptions.is_watched(fingerprint, &entry.tags) {
          tracing::debug!(%fingerprint, "refetching watched entry");
          self.start_fetch(fingerprint);
        }
      }
    }
  }

  /// Arm (or disarm) the expiry timer for a freshly written entry.
  pub(crate) fn schedule_expiry(self: &Arc<Self>, fingerprint: &Fingerprint, entry: &CacheEntry<V>) {
    let Some(expires_at) = entry.expires_at else {
      self.timers.cancel(fingerprint);
      return;
    };
    if self.is_closed() {
      return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      tracing::debug!(%fingerprint, "no async runtime, expiry is only checked on read");
      return;
    };

    let delay = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let weak = Arc::downgrade(self);
    let key = fingerprint.clone();
    let version = entry.version;
    let timer = runtime.spawn(async move {
      tokio::time::sleep(delay).await;
      if let Some(inner) = weak.upgrade() {
        inner.expire(&key, version);
      }
    });
    self.timers.replace(fingerprint, version, timer);
  }

  fn expire(self: &Arc<Self>, fingerprint: &Fingerprint, version: u64) {
    self.timers.finish(fingerprint, version);
    let outcome = self
      .mutations
      .expire_unless_pending(&self.store, fingerprint, version);
    if matches!(outcome, Invalidation::Applied(_)) {
      tracing::debug!(%fingerprint, version, "entry expired");
    }
    self.finish_invalidation(fingerprint, outcome);
  }

  /// Re-arm expiry for an entry loaded from storage.
  pub(crate) fn rearm_expiry(self: &Arc<Self>, fingerprint: &Fingerprint, entry: &CacheEntry<V>) {
    if entry.state != EntryState::Fresh {
      return;
    }
    if entry.is_expired(Utc::now()) {
      self.store.mark_stale(fingerprint);
      return;
    }
    self.schedule_expiry(fingerprint, entry);
  }
}
