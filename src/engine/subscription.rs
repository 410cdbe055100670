//! Registry of observers watching keys or tags.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::Selector;
use crate::fingerprint::Fingerprint;

/// Why a subscriber is being notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyReason {
  /// An optimistic value was written ahead of its commit
  Optimistic,
  /// A commit settled successfully
  Committed,
  /// A failed, timed out or superseded mutation was reverted
  RolledBack,
  /// A fetch stored a new value
  Refetched,
  /// The entry was marked stale
  Invalidated,
}

/// Callback invoked with the key, its visible value (`None` once removed) and the reason.
pub type NotifyFn<V> = Arc<dyn Fn(&Fingerprint, Option<&V>, NotifyReason) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "sub-{}", self.0)
  }
}

struct Subscription<V> {
  selector: Selector,
  callback: NotifyFn<V>,
}

/// Bookkeeping only: decides whether an invalidation is refetched eagerly, and fans out
/// value changes. Holds no cached data.
pub struct SubscriptionRegistry<V> {
  next_id: AtomicU64,
  subscriptions: Mutex<BTreeMap<SubscriberId, Subscription<V>>>,
}

impl<V> SubscriptionRegistry<V> {
  pub fn new() -> Self {
    Self {
      next_id: AtomicU64::new(1),
      subscriptions: Mutex::new(BTreeMap::new()),
    }
  }

  pub fn subscribe(&self, selector: Selector, callback: NotifyFn<V>) -> SubscriberId {
    let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
    tracing::debug!(subscriber = %id, %selector, "subscribed");
    self
      .subscriptions
      .lock()
      .insert(id, Subscription { selector, callback });
    id
  }

  /// Returns `false` if the id was not registered.
  pub fn unsubscribe(&self, id: SubscriberId) -> bool {
    self.subscriptions.lock().remove(&id).is_some()
  }

  /// Whether any subscriber watches this key directly or through one of its tags.
  pub fn is_watched(&self, fingerprint: &Fingerprint, tags: &BTreeSet<String>) -> bool {
    self
      .subscriptions
      .lock()
      .values()
      .any(|s| s.selector.matches(fingerprint, tags))
  }

  /// Call every matching subscriber. Callbacks run after the registry lock is released,
  /// so they may subscribe or unsubscribe.
  pub fn notify(
    &self,
    fingerprint: &Fingerprint,
    tags: &BTreeSet<String>,
    value: Option<&V>,
    reason: NotifyReason,
  ) {
    let callbacks: Vec<NotifyFn<V>> = self
      .subscriptions
      .lock()
      .values()
      .filter(|s| s.selector.matches(fingerprint, tags))
      .map(|s| Arc::clone(&s.callback))
      .collect();

    for callback in callbacks {
      callback(fingerprint, value, reason);
    }
  }

  pub fn len(&self) -> usize {
    self.subscriptions.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<V> Default for SubscriptionRegistry<V> {
  fn default() -> Self {
    Self::new()
  }
}

/// Unsubscribes when dropped, for observers whose lifetime is a scope.
pub struct SubscriptionGuard<V> {
  id: SubscriberId,
  registry: Weak<SubscriptionRegistry<V>>,
}

impl<V> SubscriptionGuard<V> {
  pub(crate) fn new(id: SubscriberId, registry: &Arc<SubscriptionRegistry<V>>) -> Self {
    Self {
      id,
      registry: Arc::downgrade(registry),
    }
  }

  pub fn id(&self) -> SubscriberId {
    self.id
  }
}

impl<V> Drop for SubscriptionGuard<V> {
  fn drop(&mut self) {
    if let Some(registry) = self.registry.upgrade() {
      registry.unsubscribe(self.id);
    }
  }
}

impl<V> fmt::Debug for SubscriptionGuard<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SubscriptionGuard")
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}
