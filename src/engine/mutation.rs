//! Optimistic mutations: apply locally, commit, and settle or roll back.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::offline::QueuedMutation;
use super::{Inner, NotifyReason, Payload, PayloadFuture, Ttl};
use crate::cache::{expiry_after, CacheEntry, EntryState, EntryStore};
use crate::error::{SyncError, SyncResult};
use crate::fingerprint::Fingerprint;

pub(crate) type Committer<V> = Arc<dyn Fn(V) -> PayloadFuture<V> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

impl MutationId {
  #[cfg(test)]
  pub(crate) fn from_raw(id: u64) -> Self {
    Self(id)
  }
}

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "mut-{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationStatus {
  /// Visible locally, commit not started (or waiting in the offline queue)
  Optimistic,
  Committing,
  Committed,
  /// Evicted from the offline queue or abandoned at shutdown
  Failed,
  /// Reverted after a commit error, timeout or conflict
  RolledBack,
}

impl fmt::Display for MutationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Optimistic => "optimistic",
      Self::Committing => "committing",
      Self::Committed => "committed",
      Self::Failed => "failed",
      Self::RolledBack => "rolled back",
    };
    write!(f, "{}", s)
  }
}

/// Snapshot of a pending mutation, as returned by
/// [`SyncEngine::pending_mutations`](crate::SyncEngine::pending_mutations).
#[derive(Debug, Clone, PartialEq)]
pub struct MutationInfo<V> {
  pub id: MutationId,
  pub status: MutationStatus,
  pub optimistic_value: V,
  pub retry_count: u32,
  pub enqueued_at: DateTime<Utc>,
}

/// Per-mutation options.
#[derive(Debug, Clone, Default)]
pub struct MutateOptions {
  pub(crate) rollback_timeout: Option<Duration>,
  pub(crate) tags: BTreeSet<String>,
  pub(crate) ttl: Ttl,
}

impl MutateOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Override the engine's rollback timeout for this mutation.
  pub fn rollback_timeout(mut self, timeout: Duration) -> Self {
    self.rollback_timeout = Some(timeout);
    self
  }

  /// Tag the entry in addition to the tags it already carries.
  pub fn tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.insert(tag.into());
    self
  }

  pub fn tags<I, S>(mut self, tags: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.tags.extend(tags.into_iter().map(Into::into));
    self
  }

  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Ttl::After(ttl);
    self
  }

  pub fn no_expiry(mut self) -> Self {
    self.ttl = Ttl::Never;
    self
  }
}

/// What an entry looked like, so it can be put back. `value: None` means there was
/// nothing to serve and restoring removes the entry.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot<V> {
  value: Option<V>,
  tags: BTreeSet<String>,
  expires_at: Option<DateTime<Utc>>,
  state: EntryState,
}

impl<V: Clone + 'static> Snapshot<V> {
  fn of(entry: Option<&CacheEntry<V>>) -> Self {
    match entry {
      Some(entry) => Self {
        value: entry.value.clone(),
        tags: entry.tags.clone(),
        expires_at: entry.expires_at,
        state: entry.state,
      },
      None => Self {
        value: None,
        tags: BTreeSet::new(),
        expires_at: None,
        state: EntryState::Fresh,
      },
    }
  }

  fn confirmed(value: V, tags: BTreeSet<String>, ttl: Option<Duration>) -> Self {
    Self {
      value: Some(value),
      tags,
      expires_at: expiry_after(ttl),
      state: EntryState::Fresh,
    }
  }

  /// Write the snapshot back as the visible entry. Returns the new entry, or `None`
  /// if restoring removed it.
  fn restore(self, store: &EntryStore<V>, fingerprint: &Fingerprint) -> Option<CacheEntry<V>> {
    let Some(value) = self.value else {
      store.remove(fingerprint);
      return None;
    };

    let mut entry = store.put_until(fingerprint, value, self.tags, self.expires_at);
    // No fetch is running on behalf of a restored value
    let state = match self.state {
      EntryState::Revalidating => EntryState::Stale,
      state => state,
    };
    if state != EntryState::Fresh && store.mark_state(fingerprint, state) {
      entry.state = state;
    }
    Some(entry)
  }
}

struct PendingMutation<V> {
  id: MutationId,
  optimistic_value: V,
  rollback_snapshot: Snapshot<V>,
  tags: BTreeSet<String>,
  ttl: Option<Duration>,
  status: MutationStatus,
  retry_count: u32,
  enqueued_at: DateTime<Utc>,
}

/// How a mutation ended.
pub(crate) enum Outcome<V> {
  /// The server confirmed this value
  Committed(V),
  /// Commit failed or timed out
  RolledBack,
  /// Dropped without a commit attempt
  Failed,
  /// The server's value replaces the mutation
  Superseded(V),
}

impl<V> Outcome<V> {
  fn status(&self) -> MutationStatus {
    match self {
      Self::Committed(_) => MutationStatus::Committed,
      Self::Failed => MutationStatus::Failed,
      Self::RolledBack | Self::Superseded(_) => MutationStatus::RolledBack,
    }
  }
}

pub(crate) struct Settled<V> {
  pub(crate) status: MutationStatus,
  /// Whether the visible entry changed; false while later mutations still cover it
  pub(crate) wrote: bool,
  pub(crate) entry: Option<CacheEntry<V>>,
  pub(crate) tags: BTreeSet<String>,
  /// An invalidation arrived while mutations were pending and is now due
  pub(crate) run_deferred: bool,
}

pub(crate) enum Invalidation<V> {
  /// Mutations are pending; the invalidation runs once they settle
  Deferred,
  Applied(CacheEntry<V>),
  /// Absent, or already stale or revalidating
  Unchanged,
}

struct Chains<V> {
  by_key: HashMap<Fingerprint, VecDeque<PendingMutation<V>>>,
  deferred: HashSet<Fingerprint>,
}

/// Tracks pending mutations per fingerprint, oldest first.
///
/// Each mutation remembers the value it replaced. When one settles while later mutations
/// on the same key are still pending, the visible (optimistic) value is left alone and
/// the settled result becomes the next mutation's rollback target instead. Only the last
/// mutation in a chain writes its outcome to the store.
///
/// Every change to a chain and the matching store write happen under one lock, so
/// invalidations and fetch completions see a consistent picture.
pub(crate) struct MutationManager<V> {
  next_id: AtomicU64,
  chains: Mutex<Chains<V>>,
}

impl<V: Clone + 'static> MutationManager<V> {
  pub(crate) fn new() -> Self {
    Self {
      next_id: AtomicU64::new(1),
      chains: Mutex::new(Chains {
        by_key: HashMap::new(),
        deferred: HashSet::new(),
      }),
    }
  }

  /// Record a mutation and make its value visible.
  pub(crate) fn begin(
    &self,
    store: &EntryStore<V>,
    fingerprint: &Fingerprint,
    optimistic: V,
    mut tags: BTreeSet<String>,
    ttl: Option<Duration>,
  ) -> (MutationId, CacheEntry<V>) {
    let mut chains = self.chains.lock();
    let current = store.get(fingerprint);
    if let Some(current) = &current {
      tags.extend(current.tags.iter().cloned());
    }

    let id = MutationId(self.next_id.fetch_add(1, Ordering::Relaxed));
    chains
      .by_key
      .entry(fingerprint.clone())
      .or_default()
      .push_back(PendingMutation {
        id,
        optimistic_value: optimistic.clone(),
        rollback_snapshot: Snapshot::of(current.as_ref()),
        tags: tags.clone(),
        ttl,
        status: MutationStatus::Optimistic,
        retry_count: 0,
        enqueued_at: Utc::now(),
      });

    let entry = store.put(fingerprint, optimistic, tags, ttl);
    (id, entry)
  }

  pub(crate) fn set_status(&self, fingerprint: &Fingerprint, id: MutationId, status: MutationStatus) {
    self.with_mutation(fingerprint, id, |m| m.status = status);
  }

  pub(crate) fn record_retry(&self, fingerprint: &Fingerprint, id: MutationId, retry: u32) {
    self.with_mutation(fingerprint, id, |m| m.retry_count = retry);
  }

  /// The value a pending mutation would roll back to.
  pub(crate) fn snapshot_value(&self, fingerprint: &Fingerprint, id: MutationId) -> Option<V> {
    let chains = self.chains.lock();
    chains
      .by_key
      .get(fingerprint)?
      .iter()
      .find(|m| m.id == id)
      .and_then(|m| m.rollback_snapshot.value.clone())
  }

  fn with_mutation(
    &self,
    fingerprint: &Fingerprint,
    id: MutationId,
    update: impl FnOnce(&mut PendingMutation<V>),
  ) {
    let mut chains = self.chains.lock();
    if let Some(m) = chains
      .by_key
      .get_mut(fingerprint)
      .and_then(|chain| chain.iter_mut().find(|m| m.id == id))
    {
      update(m);
    }
  }

  /// Remove a mutation from its chain and apply its outcome. Returns `None` if the
  /// mutation already settled.
  pub(crate) fn settle(
    &self,
    store: &EntryStore<V>,
    fingerprint: &Fingerprint,
    id: MutationId,
    outcome: Outcome<V>,
  ) -> Option<Settled<V>> {
    let mut chains = self.chains.lock();
    let chain = chains.by_key.get_mut(fingerprint)?;
    let index = chain.iter().position(|m| m.id == id)?;
    let mutation = chain.remove(index)?;

    let status = outcome.status();
    let base = match outcome {
      Outcome::Committed(value) | Outcome::Superseded(value) => {
        Snapshot::confirmed(value, mutation.tags, mutation.ttl)
      }
      Outcome::RolledBack | Outcome::Failed => mutation.rollback_snapshot,
    };

    let tags = base.tags.clone();
    let (wrote, entry) = match chain.get_mut(index) {
      Some(next) => {
        next.rollback_snapshot = base;
        (false, None)
      }
      None => (true, base.restore(store, fingerprint)),
    };

    let mut run_deferred = false;
    if chain.is_empty() {
      chains.by_key.remove(fingerprint);
      run_deferred = chains.deferred.remove(fingerprint);
    }

    tracing::debug!(%fingerprint, mutation = %id, %status, wrote, "mutation settled");
    Some(Settled {
      status,
      wrote,
      entry,
      tags,
      run_deferred,
    })
  }

  /// Mark an entry stale, or remember to do so once its pending mutations settle.
  pub(crate) fn invalidate_unless_pending(
    &self,
    store: &EntryStore<V>,
    fingerprint: &Fingerprint,
  ) -> Invalidation<V> {
    let mut chains = self.chains.lock();
    if chains.by_key.contains_key(fingerprint) {
      chains.deferred.insert(fingerprint.clone());
      return Invalidation::Deferred;
    }
    match store.mark_stale(fingerprint) {
      Some(entry) => Invalidation::Applied(entry),
      None => Invalidation::Unchanged,
    }
  }

  /// Expire the entry a TTL timer was armed for. Never deferred: a pending mutation
  /// rewrites the entry and arms its own timer when it settles.
  pub(crate) fn expire_unless_pending(
    &self,
    store: &EntryStore<V>,
    fingerprint: &Fingerprint,
    version: u64,
  ) -> Invalidation<V> {
    let chains = self.chains.lock();
    if chains.by_key.contains_key(fingerprint) {
      return Invalidation::Unchanged;
    }
    match store.get(fingerprint) {
      Some(entry) if entry.version == version && entry.state == EntryState::Fresh => {
        match store.mark_stale(fingerprint) {
          Some(entry) => Invalidation::Applied(entry),
          None => Invalidation::Unchanged,
        }
      }
      _ => Invalidation::Unchanged,
    }
  }

  /// Store a fetched value unless the entry was written since the fetch started or a
  /// mutation is pending on it.
  pub(crate) fn apply_fetched(
    &self,
    store: &EntryStore<V>,
    fingerprint: &Fingerprint,
    start_version: u64,
    value: V,
    mut tags: BTreeSet<String>,
    ttl: Option<Duration>,
  ) -> Option<CacheEntry<V>> {
    let chains = self.chains.lock();
    if chains.by_key.contains_key(fingerprint) {
      return None;
    }
    let current = store.get(fingerprint);
    if let Some(current) = current {
      if current.version != start_version {
        return None;
      }
      tags.extend(current.tags);
    }
    Some(store.put(fingerprint, value, tags, ttl))
  }

  /// Record a failed fetch under the same conditions as [`apply_fetched`](Self::apply_fetched).
  pub(crate) fn apply_fetch_error(
    &self,
    store: &EntryStore<V>,
    fingerprint: &Fingerprint,
    start_version: u64,
    message: &str,
  ) -> bool {
    let chains = self.chains.lock();
    if chains.by_key.contains_key(fingerprint) {
      return false;
    }
    match store.get(fingerprint) {
      Some(current) if current.version == start_version => store.mark_error(fingerprint, message),
      _ => false,
    }
  }

  pub(crate) fn pending(&self, fingerprint: &Fingerprint) -> Vec<MutationInfo<V>> {
    self
      .chains
      .lock()
      .by_key
      .get(fingerprint)
      .map(|chain| {
        chain
          .iter()
          .map(|m| MutationInfo {
            id: m.id,
            status: m.status,
            optimistic_value: m.optimistic_value.clone(),
            retry_count: m.retry_count,
            enqueued_at: m.enqueued_at,
          })
          .collect()
      })
      .unwrap_or_default()
  }

  pub(crate) fn has_pending(&self, fingerprint: &Fingerprint) -> bool {
    self.chains.lock().by_key.contains_key(fingerprint)
  }
}

/// Rolls a mutation back if its commit future is dropped before settling.
pub(crate) struct SettleGuard<V: Payload> {
  inner: Arc<Inner<V>>,
  fingerprint: Fingerprint,
  id: MutationId,
  armed: bool,
}

impl<V: Payload> SettleGuard<V> {
  pub(crate) fn new(inner: &Arc<Inner<V>>, fingerprint: &Fingerprint, id: MutationId) -> Self {
    Self {
      inner: Arc::clone(inner),
      fingerprint: fingerprint.clone(),
      id,
      armed: true,
    }
  }

  pub(crate) fn disarm(&mut self) {
    self.armed = false;
  }
}

impl<V: Payload> Drop for SettleGuard<V> {
  fn drop(&mut self) {
    if self.armed {
      tracing::debug!(fingerprint = %self.fingerprint, mutation = %self.id, "commit abandoned");
      self.inner.settle(&self.fingerprint, self.id, Outcome::RolledBack);
    }
  }
}

impl<V: Payload> Inner<V> {
  pub(crate) async fn mutate(
    self: &Arc<Self>,
    fingerprint: &Fingerprint,
    optimistic: V,
    committer: Committer<V>,
    options: MutateOptions,
  ) -> SyncResult<V> {
    self.ensure_open()?;
    let ttl = options.ttl.resolve(self.settings.default_ttl);
    let timeout = options
      .rollback_timeout
      .unwrap_or(self.settings.rollback_timeout);

    // Later mutations on a key with queued work wait behind it, even once online
    let queued = {
      let mut queue = self.queue.lock();
      if self.is_online() && !queue.has_key(fingerprint) {
        None
      } else {
        queue.admit()?;
        let (id, entry) =
          self
            .mutations
            .begin(&self.store, fingerprint, optimistic.clone(), options.tags.clone(), ttl);
        let (reply, waiter) = tokio::sync::oneshot::channel();
        let evicted = queue.push(QueuedMutation::new(
          id,
          fingerprint.clone(),
          Arc::clone(&committer),
          optimistic.clone(),
          timeout,
          reply,
        ));
        tracing::info!(%fingerprint, mutation = %id, queued = queue.len(), "mutation queued");
        Some((entry, waiter, evicted))
      }
    };

    if let Some((entry, waiter, evicted)) = queued {
      if let Some(evicted) = evicted {
        self.evict(evicted);
      }
      self.publish_optimistic(fingerprint, &entry);
      return waiter.await.unwrap_or(Err(SyncError::Shutdown));
    }

    let (id, entry) = self
      .mutations
      .begin(&self.store, fingerprint, optimistic.clone(), options.tags, ttl);
    self.publish_optimistic(fingerprint, &entry);
    self
      .commit(fingerprint, id, &committer, optimistic, timeout)
      .await
  }

  fn publish_optimistic(self: &Arc<Self>, fingerprint: &Fingerprint, entry: &CacheEntry<V>) {
    self.schedule_expiry(fingerprint, entry);
    self.subscriptions.notify(
      fingerprint,
      &entry.tags,
      entry.value.as_ref(),
      NotifyReason::Optimistic,
    );
  }

  async fn commit(
    self: &Arc<Self>,
    fingerprint: &Fingerprint,
    id: MutationId,
    committer: &Committer<V>,
    value: V,
    timeout: Duration,
  ) -> SyncResult<V> {
    let mut guard = SettleGuard::new(self, fingerprint, id);
    let _key = self.locks.acquire(fingerprint).await;
    let result = self
      .commit_locked(fingerprint, id, committer, value, timeout)
      .await;
    guard.disarm();
    result
  }

  /// Run the committer with retries, bounded by `timeout`, and settle the mutation.
  /// The caller holds the key lock and rolls back if this future is dropped.
  pub(crate) async fn commit_locked(
    self: &Arc<Self>,
    fingerprint: &Fingerprint,
    id: MutationId,
    committer: &Committer<V>,
    value: V,
    timeout: Duration,
  ) -> SyncResult<V> {
    self
      .mutations
      .set_status(fingerprint, id, MutationStatus::Committing);

    let attempts = self.settings.retry.run(
      "commit",
      fingerprint,
      || committer(value.clone()),
      |retry| self.mutations.record_retry(fingerprint, id, retry),
    );
    let result = tokio::time::timeout(timeout, attempts).await;

    match result {
      Ok(Ok(confirmed)) => {
        tracing::debug!(%fingerprint, mutation = %id, "commit confirmed");
        self.settle(fingerprint, id, Outcome::Committed(confirmed.clone()));
        Ok(confirmed)
      }
      Ok(Err(report)) => {
        let err = SyncError::commit(&report);
        tracing::warn!(%fingerprint, mutation = %id, error = %err, "commit failed, rolling back");
        self.settle(fingerprint, id, Outcome::RolledBack);
        Err(err)
      }
      Err(_) => {
        tracing::warn!(
          %fingerprint,
          mutation = %id,
          timeout_ms = timeout.as_millis() as u64,
          "commit timed out, rolling back"
        );
        self.settle(fingerprint, id, Outcome::RolledBack);
        Err(SyncError::Timeout(timeout))
      }
    }
  }

  /// Apply a mutation's outcome and tell subscribers about the visible change.
  pub(crate) fn settle(
    self: &Arc<Self>,
    fingerprint: &Fingerprint,
    id: MutationId,
    outcome: Outcome<V>,
  ) -> Option<MutationStatus> {
    let settled = self
      .mutations
      .settle(&self.store, fingerprint, id, outcome)?;

    if settled.wrote {
      match &settled.entry {
        Some(entry) => self.schedule_expiry(fingerprint, entry),
        None => self.timers.cancel(fingerprint),
      }
      let reason = match settled.status {
        MutationStatus::Committed => NotifyReason::Committed,
        _ => NotifyReason::RolledBack,
      };
      let value = settled.entry.as_ref().and_then(|e| e.value.as_ref());
      self
        .subscriptions
        .notify(fingerprint, &settled.tags, value, reason);
    }

    if settled.run_deferred {
      self.invalidate_key(fingerprint);
    }
    Some(settled.status)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::{RetryPolicy, SyncEngine};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::AtomicUsize;

  fn tags(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn test_rollback_restores_previous_value() {
    let store = EntryStore::new();
    let manager = MutationManager::new();
    let fp = Fingerprint::of_resource("users/1");
    store.put(&fp, "A", tags(&["users"]), None);

    let (id, entry) = manager.begin(&store, &fp, "B", tags(&[]), None);
    assert_eq!(entry.value, Some("B"));
    assert!(entry.has_tag("users"));
    assert_eq!(manager.snapshot_value(&fp, id), Some("A"));

    let settled = manager
      .settle(&store, &fp, id, Outcome::RolledBack)
      .unwrap();
    assert!(settled.wrote);
    assert_eq!(settled.status, MutationStatus::RolledBack);

    let entry = store.get(&fp).unwrap();
    assert_eq!(entry.value, Some("A"));
    assert_eq!(entry.version, 3);
    assert!(!manager.has_pending(&fp));
  }

  #[test]
  fn test_rollback_of_first_write_removes_entry() {
    let store = EntryStore::new();
    let manager = MutationManager::new();
    let fp = Fingerprint::of_resource("users/1");

    let (id, _) = manager.begin(&store, &fp, 1, tags(&[]), None);
    let settled = manager.settle(&store, &fp, id, Outcome::Failed).unwrap();
    assert!(settled.entry.is_none());
    assert!(store.get(&fp).is_none());
  }

  #[test]
  fn test_rollback_keeps_stale_state() {
    let store = EntryStore::new();
    let manager = MutationManager::new();
    let fp = Fingerprint::of_resource("users/1");
    store.put(&fp, 1, tags(&[]), None);
    store.mark_stale(&fp);

    let (id, _) = manager.begin(&store, &fp, 2, tags(&[]), None);
    manager.settle(&store, &fp, id, Outcome::RolledBack);
    let entry = store.get(&fp).unwrap();
    assert_eq!(entry.value, Some(1));
    assert_eq!(entry.state, EntryState::Stale);
  }

  #[test]
  fn test_chained_rollback_targets_are_rewritten() {
    let store = EntryStore::new();
    let manager = MutationManager::new();
    let fp = Fingerprint::of_resource("counter");
    store.put(&fp, 0, tags(&[]), None);

    let (first, _) = manager.begin(&store, &fp, 1, tags(&[]), None);
    let (second, _) = manager.begin(&store, &fp, 2, tags(&[]), None);
    assert_eq!(manager.snapshot_value(&fp, second), Some(1));

    // First one fails: the visible value stays the second optimistic value
    let settled = manager
      .settle(&store, &fp, first, Outcome::RolledBack)
      .unwrap();
    assert!(!settled.wrote);
    assert_eq!(store.get(&fp).unwrap().value, Some(2));
    assert_eq!(manager.snapshot_value(&fp, second), Some(0));
    assert_eq!(manager.pending(&fp)[0].optimistic_value, 2);

    manager.settle(&store, &fp, second, Outcome::RolledBack);
    assert_eq!(store.get(&fp).unwrap().value, Some(0));
  }

  #[test]
  fn test_committed_value_becomes_next_rollback_target() {
    let store = EntryStore::new();
    let manager = MutationManager::new();
    let fp = Fingerprint::of_resource("counter");
    store.put(&fp, 0, tags(&[]), None);

    let (first, _) = manager.begin(&store, &fp, 1, tags(&[]), None);
    let (second, _) = manager.begin(&store, &fp, 2, tags(&[]), None);
    manager.settle(&store, &fp, first, Outcome::Committed(10));
    manager.settle(&store, &fp, second, Outcome::RolledBack);

    assert_eq!(store.get(&fp).unwrap().value, Some(10));
  }

  #[test]
  fn test_invalidation_is_deferred_while_pending() {
    let store = EntryStore::new();
    let manager = MutationManager::new();
    let fp = Fingerprint::of_resource("users/1");
    store.put(&fp, 1, tags(&[]), None);

    let (id, _) = manager.begin(&store, &fp, 2, tags(&[]), None);
    assert!(matches!(
      manager.invalidate_unless_pending(&store, &fp),
      Invalidation::Deferred
    ));
    assert_eq!(store.get(&fp).unwrap().state, EntryState::Fresh);

    let settled = manager
      .settle(&store, &fp, id, Outcome::Committed(2))
      .unwrap();
    assert!(settled.run_deferred);
    assert!(matches!(
      manager.invalidate_unless_pending(&store, &fp),
      Invalidation::Applied(_)
    ));
  }

  #[test]
  fn test_expiry_is_dropped_while_pending() {
    let store = EntryStore::new();
    let manager = MutationManager::new();
    let fp = Fingerprint::of_resource("users/1");
    let armed = store.put(&fp, 1, tags(&[]), None).version;

    let (id, _) = manager.begin(&store, &fp, 2, tags(&[]), None);
    assert!(matches!(
      manager.expire_unless_pending(&store, &fp, armed),
      Invalidation::Unchanged
    ));

    let settled = manager
      .settle(&store, &fp, id, Outcome::Committed(2))
      .unwrap();
    assert!(!settled.run_deferred);
    // The timer belonged to a version that no longer exists
    assert!(matches!(
      manager.expire_unless_pending(&store, &fp, armed),
      Invalidation::Unchanged
    ));
    assert_eq!(store.get(&fp).unwrap().state, EntryState::Fresh);

    let current = store.get(&fp).unwrap().version;
    assert!(matches!(
      manager.expire_unless_pending(&store, &fp, current),
      Invalidation::Applied(_)
    ));
  }

  #[test]
  fn test_fetch_result_is_dropped_when_entry_moved() {
    let store = EntryStore::new();
    let manager = MutationManager::new();
    let fp = Fingerprint::of_resource("users/1");
    let start = store.begin_revalidation(&fp, &tags(&[]));

    let (id, _) = manager.begin(&store, &fp, "mine", tags(&[]), None);
    assert!(manager
      .apply_fetched(&store, &fp, start, "server", tags(&[]), None)
      .is_none());

    manager.settle(&store, &fp, id, Outcome::Committed("mine"));
    assert!(manager
      .apply_fetched(&store, &fp, start, "server", tags(&[]), None)
      .is_none());
    assert_eq!(store.get(&fp).unwrap().value, Some("mine"));
  }

  #[test]
  fn test_pending_reports_status_and_retries() {
    let store = EntryStore::new();
    let manager = MutationManager::new();
    let fp = Fingerprint::of_resource("users/1");

    let (id, _) = manager.begin(&store, &fp, 1, tags(&[]), None);
    manager.set_status(&fp, id, MutationStatus::Committing);
    manager.record_retry(&fp, id, 2);

    let pending = manager.pending(&fp);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].status, MutationStatus::Committing);
    assert_eq!(pending[0].retry_count, 2);
  }

  #[tokio::test]
  async fn test_commit_failure_rolls_back_after_retries() {
    let engine: SyncEngine<String> = SyncEngine::builder()
      .retry(RetryPolicy::new(2, Duration::from_millis(1)))
      .build()
      .unwrap();
    let fp = Fingerprint::of_resource("users/1");
    engine
      .read(&fp, || async { Ok("A".to_string()) }, Default::default())
      .await
      .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let err = engine
      .mutate(
        &fp,
        "B".to_string(),
        move |_| {
          counter.fetch_add(1, Ordering::SeqCst);
          async { Err(eyre!("500")) }
        },
        MutateOptions::new(),
      )
      .await
      .unwrap_err();

    assert_eq!(err, SyncError::Commit("500".to_string()));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(engine.peek(&fp).as_deref(), Some("A"));
    assert!(engine.pending_mutations(&fp).is_empty());
  }

  #[tokio::test]
  async fn test_commit_timeout_rolls_back() {
    let engine: SyncEngine<String> = SyncEngine::builder()
      .retry(RetryPolicy::none())
      .build()
      .unwrap();
    let fp = Fingerprint::of_resource("users/1");

    let err = engine
      .mutate(
        &fp,
        "B".to_string(),
        |value| async move {
          tokio::time::sleep(Duration::from_millis(200)).await;
          Ok(value)
        },
        MutateOptions::new().rollback_timeout(Duration::from_millis(20)),
      )
      .await
      .unwrap_err();

    assert_eq!(err, SyncError::Timeout(Duration::from_millis(20)));
    assert!(engine.entry(&fp).is_none());
  }

  #[tokio::test]
  async fn test_dropped_commit_rolls_back() {
    let engine: SyncEngine<u32> = SyncEngine::builder().build().unwrap();
    let fp = Fingerprint::of_resource("counter");

    let abandoned = tokio::time::timeout(
      Duration::from_millis(10),
      engine.mutate(
        &fp,
        1,
        |value| async move {
          tokio::time::sleep(Duration::from_millis(200)).await;
          Ok(value)
        },
        MutateOptions::new(),
      ),
    )
    .await;

    assert!(abandoned.is_err());
    assert!(engine.entry(&fp).is_none());
    assert!(engine.pending_mutations(&fp).is_empty());
  }
}
