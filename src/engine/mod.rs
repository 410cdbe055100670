//! The synchronization engine.
//!
//! [`SyncEngine`] ties the pieces together:
//! - reads go through the fetch coordinator (TTL, coalescing, stale-while-revalidate)
//! - writes go through the mutation manager (optimistic value, commit, rollback)
//! - invalidations, TTL expiry and pushed events go through the invalidation router
//! - mutations made while offline wait in the offline queue until connectivity returns
//!
//! Every state transition on a fingerprint that involves I/O (commits, fetch completions)
//! runs under that fingerprint's lock, so they are applied one at a time and in order.
//! Reads of settled entries never take the lock.
//!
//! # Example
//!
//! ```ignore
//! let engine: SyncEngine<User> = SyncEngine::builder().build()?;
//! let key = Fingerprint::new("users", [("id", "1")]);
//!
//! let user = engine
//!   .read(&key, move || api.get_user(1), ReadOptions::new().tag("users"))
//!   .await?
//!   .into_data();
//!
//! let renamed = User { name: "B".into(), ..user };
//! engine
//!   .mutate(&key, renamed, move |user| api.put_user(user), MutateOptions::new())
//!   .await?;
//!
//! engine.invalidate(&Selector::tag("users"));
//! ```

mod fetch;
mod invalidation;
mod locks;
mod mutation;
mod offline;
mod retry;
mod subscription;

pub use fetch::ReadOptions;
pub use mutation::{MutateOptions, MutationId, MutationInfo, MutationStatus};
pub use retry::RetryPolicy;
pub use subscription::{
  NotifyFn, NotifyReason, SubscriberId, SubscriptionGuard, SubscriptionRegistry,
};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;

use crate::cache::{
  CacheEntry, CacheResult, CacheStorage, EntryState, EntryStore, Selector, SqliteStorage,
};
use crate::config::{ConflictPolicy, EngineConfig, OverflowPolicy};
use crate::error::{SyncError, SyncResult};
use crate::fingerprint::Fingerprint;

use fetch::{FetchCoordinator, Fetcher};
use invalidation::ExpiryTimers;
use locks::KeyLocks;
use mutation::{Committer, MutationManager};
use offline::OfflineQueue;

/// Values the engine can cache. The engine never looks inside a payload; equality is
/// only used to detect server-side changes when draining the offline queue.
pub trait Payload: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> Payload for T {}

/// Boxed future returned by type-erased fetchers and committers.
pub type PayloadFuture<V> = BoxFuture<'static, color_eyre::Result<V>>;

/// Caller-supplied merge function: `merge(server_value, queued_value)`.
pub type MergeFn<V> = Arc<dyn Fn(&V, &V) -> color_eyre::Result<V> + Send + Sync>;

/// Conflict policy with its merge function resolved.
pub(crate) enum Resolution<V> {
  ClientWins,
  ServerWins,
  Merge(MergeFn<V>),
}

/// How long a written value stays fresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Ttl {
  /// The engine's configured default
  #[default]
  Default,
  Never,
  After(Duration),
}

impl Ttl {
  pub(crate) fn resolve(self, default: Option<Duration>) -> Option<Duration> {
    match self {
      Self::Default => default,
      Self::Never => None,
      Self::After(ttl) => Some(ttl),
    }
  }
}

pub(crate) struct Settings {
  pub(crate) default_ttl: Option<Duration>,
  pub(crate) rollback_timeout: Duration,
  pub(crate) retry: RetryPolicy,
}

/// Shared state behind every [`SyncEngine`] handle.
pub(crate) struct Inner<V> {
  pub(crate) store: EntryStore<V>,
  pub(crate) fetches: FetchCoordinator<V>,
  pub(crate) mutations: MutationManager<V>,
  pub(crate) queue: OfflineQueue<V>,
  pub(crate) subscriptions: Arc<SubscriptionRegistry<V>>,
  pub(crate) locks: KeyLocks,
  pub(crate) timers: ExpiryTimers,
  pub(crate) settings: Settings,
  pub(crate) resolution: Resolution<V>,
  online: AtomicBool,
  pub(crate) draining: AtomicBool,
  closed: AtomicBool,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<V: Payload> Inner<V> {
  pub(crate) fn ensure_open(&self) -> SyncResult<()> {
    if self.closed.load(Ordering::Acquire) {
      return Err(SyncError::Shutdown);
    }
    Ok(())
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  pub(crate) fn is_online(&self) -> bool {
    self.online.load(Ordering::Acquire)
  }

  /// Keep a background task so shutdown can abort it.
  pub(crate) fn track(&self, handle: JoinHandle<()>) {
    let mut tasks = self.tasks.lock();
    tasks.retain(|h| !h.is_finished());
    tasks.push(handle);
  }

  fn on_connectivity_change(self: &Arc<Self>, online: bool) {
    let was_online = self.online.swap(online, Ordering::AcqRel);
    if was_online != online {
      tracing::info!(online, queued = self.queue.len(), "connectivity changed");
    }
    if online && !self.queue.is_empty() && !self.is_closed() {
      match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
          let inner = Arc::clone(self);
          self.track(runtime.spawn(inner.drain()));
        }
        Err(_) => tracing::warn!("no async runtime, offline queue not drained"),
      }
    }
  }

  fn shutdown(self: &Arc<Self>) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    tracing::info!("shutting down sync engine");
    self.timers.abort_all();
    for task in self.tasks.lock().drain(..) {
      task.abort();
    }
    for item in self.queue.take_all() {
      self.fail_queued(item, SyncError::Shutdown);
    }
  }
}

impl<V> Drop for Inner<V> {
  fn drop(&mut self) {
    self.timers.abort_all();
    for task in self.tasks.get_mut().drain(..) {
      task.abort();
    }
  }
}

/// Client-side cache-coherence engine.
///
/// Handles are cheap to clone and all clones share one instance. Independent instances
/// share nothing, so tests can build as many as they like.
pub struct SyncEngine<V> {
  inner: Arc<Inner<V>>,
}

impl<V> Clone for SyncEngine<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<V: Payload> fmt::Debug for SyncEngine<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SyncEngine")
      .field("entries", &self.inner.store.len())
      .field("online", &self.inner.online.load(Ordering::Relaxed))
      .field("queued", &self.inner.queue.len())
      .finish_non_exhaustive()
  }
}

impl<V: Payload> SyncEngine<V> {
  pub fn builder() -> EngineBuilder<V> {
    EngineBuilder::new()
  }

  /// Read a value, fetching it only when the cache cannot serve it.
  ///
  /// Concurrent reads of the same fingerprint share one fetcher invocation. Dropping the
  /// returned future cancels this caller's wait only; the fetch keeps running for other
  /// waiters and still updates the cache.
  pub async fn read<F, Fut>(
    &self,
    fingerprint: &Fingerprint,
    fetcher: F,
    options: ReadOptions,
  ) -> SyncResult<CacheResult<V>>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = color_eyre::Result<V>> + Send + 'static,
  {
    let fetcher: Fetcher<V> = Arc::new(move || fetcher().boxed());
    self.inner.read(fingerprint, fetcher, options).await
  }

  /// Write `optimistic` immediately, then commit it.
  ///
  /// The committer receives the value to write and returns the server-confirmed value.
  /// On failure or timeout the previous value is restored. While offline the commit is
  /// deferred to the offline queue and this future resolves once the queue drains.
  pub async fn mutate<F, Fut>(
    &self,
    fingerprint: &Fingerprint,
    optimistic: V,
    committer: F,
    options: MutateOptions,
  ) -> SyncResult<V>
  where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = color_eyre::Result<V>> + Send + 'static,
  {
    let committer: Committer<V> = Arc::new(move |value| committer(value).boxed());
    self
      .inner
      .mutate(fingerprint, optimistic, committer, options)
      .await
  }

  /// Mark matching entries stale. Watched entries are refetched right away; the rest
  /// wait for their next read. Returns the number of entries matched.
  pub fn invalidate(&self, selector: &Selector) -> usize {
    self.inner.invalidate(selector)
  }

  /// Ingestion point for pushed invalidation events.
  pub fn on_invalidation_event(&self, selector: Selector) {
    tracing::debug!(%selector, "invalidation event");
    self.inner.invalidate(&selector);
  }

  /// Ingestion point for connectivity transitions. Going online drains the offline queue.
  pub fn on_connectivity_change(&self, online: bool) {
    self.inner.on_connectivity_change(online);
  }

  pub fn is_online(&self) -> bool {
    self.inner.is_online()
  }

  pub fn subscribe<F>(&self, selector: Selector, callback: F) -> SubscriberId
  where
    F: Fn(&Fingerprint, Option<&V>, NotifyReason) + Send + Sync + 'static,
  {
    self.inner.subscriptions.subscribe(selector, Arc::new(callback))
  }

  /// Subscribe for as long as the returned guard lives.
  pub fn subscribe_scoped<F>(&self, selector: Selector, callback: F) -> SubscriptionGuard<V>
  where
    F: Fn(&Fingerprint, Option<&V>, NotifyReason) + Send + Sync + 'static,
  {
    let id = self.subscribe(selector, callback);
    SubscriptionGuard::new(id, &self.inner.subscriptions)
  }

  pub fn unsubscribe(&self, id: SubscriberId) -> bool {
    self.inner.subscriptions.unsubscribe(id)
  }

  /// Current entry for a fingerprint, without any I/O.
  pub fn entry(&self, fingerprint: &Fingerprint) -> Option<CacheEntry<V>> {
    self.inner.store.get(fingerprint)
  }

  /// Currently visible value, without any I/O.
  pub fn peek(&self, fingerprint: &Fingerprint) -> Option<V> {
    self.inner.store.get(fingerprint).and_then(|e| e.value)
  }

  pub fn state(&self, fingerprint: &Fingerprint) -> Option<EntryState> {
    self.inner.store.get(fingerprint).map(|e| e.state)
  }

  pub fn fingerprints(&self) -> Vec<Fingerprint> {
    self.inner.store.fingerprints()
  }

  /// Mutations on this fingerprint that have not settled yet, oldest first.
  pub fn pending_mutations(&self, fingerprint: &Fingerprint) -> Vec<MutationInfo<V>> {
    self.inner.mutations.pending(fingerprint)
  }

  pub fn queued_len(&self) -> usize {
    self.inner.queue.len()
  }

  /// Stop timers and background tasks, and fail every queued mutation after rolling it
  /// back. Later reads and mutations fail with [`SyncError::Shutdown`].
  pub fn shutdown(&self) {
    self.inner.shutdown();
  }

  pub fn downgrade(&self) -> WeakSyncEngine<V> {
    WeakSyncEngine {
      inner: Arc::downgrade(&self.inner),
    }
  }

  pub(crate) fn track(&self, handle: JoinHandle<()>) {
    self.inner.track(handle);
  }
}

/// Handle that does not keep the engine alive.
pub struct WeakSyncEngine<V> {
  inner: Weak<Inner<V>>,
}

impl<V> Clone for WeakSyncEngine<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Weak::clone(&self.inner),
    }
  }
}

impl<V: Payload> WeakSyncEngine<V> {
  pub fn upgrade(&self) -> Option<SyncEngine<V>> {
    self.inner.upgrade().map(|inner| SyncEngine { inner })
  }
}

/// Builder for [`SyncEngine`].
pub struct EngineBuilder<V> {
  config: EngineConfig,
  storage: Option<Arc<dyn CacheStorage<V>>>,
  merge: Option<MergeFn<V>>,
  online: bool,
}

impl<V: Payload> EngineBuilder<V> {
  pub fn new() -> Self {
    Self {
      config: EngineConfig::default(),
      storage: None,
      merge: None,
      online: true,
    }
  }

  pub fn config(mut self, config: EngineConfig) -> Self {
    self.config = config;
    self
  }

  /// Write entries through to durable storage and restore them on build.
  pub fn storage(mut self, storage: Arc<dyn CacheStorage<V>>) -> Self {
    self.storage = Some(storage);
    self
  }

  pub fn default_ttl(mut self, ttl: Option<Duration>) -> Self {
    self.config.default_ttl_ms = ttl.map(|d| d.as_millis() as u64);
    self
  }

  pub fn rollback_timeout(mut self, timeout: Duration) -> Self {
    self.config.rollback_timeout_ms = timeout.as_millis() as u64;
    self
  }

  pub fn retry(mut self, policy: RetryPolicy) -> Self {
    self.config.retry.max_retries = policy.max_retries;
    self.config.retry.backoff_ms = policy.backoff.as_millis() as u64;
    self.config.retry.max_backoff_ms = policy.max_backoff.as_millis() as u64;
    self
  }

  pub fn offline_queue(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
    self.config.offline_queue.capacity = capacity;
    self.config.offline_queue.overflow = overflow;
    self
  }

  pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
    self.config.conflict = policy;
    self
  }

  /// Resolve drain-time conflicts with `merge(server_value, queued_value)`.
  /// Also selects [`ConflictPolicy::Merge`].
  pub fn merge_with<F>(mut self, merge: F) -> Self
  where
    F: Fn(&V, &V) -> color_eyre::Result<V> + Send + Sync + 'static,
  {
    self.merge = Some(Arc::new(merge));
    self.config.conflict = ConflictPolicy::Merge;
    self
  }

  /// Start with connectivity marked unavailable.
  pub fn start_offline(mut self) -> Self {
    self.online = false;
    self
  }

  /// Build the engine, restoring persisted entries if a storage is configured.
  ///
  /// Must run inside a Tokio runtime when restored entries carry a TTL, since their
  /// expiry timers are re-armed here.
  ///
  /// A config with `persistence.enabled` needs a storage: pass one with
  /// [`storage`](Self::storage) or build with [`build_persistent`](Self::build_persistent).
  pub fn build(self) -> SyncResult<SyncEngine<V>> {
    if self.config.persistence.enabled && self.storage.is_none() {
      return Err(SyncError::Config(
        "persistence is enabled but no storage was given, use `build_persistent`".to_string(),
      ));
    }

    let resolution = match (self.config.conflict, self.merge) {
      (ConflictPolicy::ClientWins, _) => Resolution::ClientWins,
      (ConflictPolicy::ServerWins, _) => Resolution::ServerWins,
      (ConflictPolicy::Merge, Some(merge)) => Resolution::Merge(merge),
      (ConflictPolicy::Merge, None) => {
        return Err(SyncError::Config(
          "conflict policy `merge` requires a merge function".to_string(),
        ))
      }
    };

    let store = match &self.storage {
      Some(storage) => EntryStore::with_storage(Arc::clone(storage)),
      None => EntryStore::new(),
    };

    let inner = Arc::new(Inner {
      store,
      fetches: FetchCoordinator::new(),
      mutations: MutationManager::new(),
      queue: OfflineQueue::new(
        self.config.offline_queue.capacity,
        self.config.offline_queue.overflow,
      ),
      subscriptions: Arc::new(SubscriptionRegistry::new()),
      locks: KeyLocks::new(),
      timers: ExpiryTimers::new(),
      settings: Settings {
        default_ttl: self.config.default_ttl(),
        rollback_timeout: self.config.rollback_timeout(),
        retry: self.config.retry_policy(),
      },
      resolution,
      online: AtomicBool::new(self.online),
      draining: AtomicBool::new(false),
      closed: AtomicBool::new(false),
      tasks: Mutex::new(Vec::new()),
    });

    if self.storage.is_some() {
      match inner.store.restore() {
        Ok(restored) => {
          tracing::info!(entries = restored.len(), "restored persisted cache entries");
          for (fingerprint, entry) in restored {
            inner.rearm_expiry(&fingerprint, &entry);
          }
        }
        Err(e) => tracing::warn!(error = %e, "failed to restore persisted cache entries"),
      }
    }

    Ok(SyncEngine { inner })
  }
}

impl<V> EngineBuilder<V>
where
  V: Payload + Serialize + DeserializeOwned,
{
  /// Build the engine, opening the configured SQLite database when `persistence.enabled`
  /// is set and no storage was given explicitly.
  pub fn build_persistent(mut self) -> SyncResult<SyncEngine<V>> {
    if self.config.persistence.enabled && self.storage.is_none() {
      let path = self
        .config
        .database_path()
        .map_err(|e| SyncError::Config(e.to_string()))?;
      let storage = SqliteStorage::open_at(&path).map_err(|e| SyncError::Config(e.to_string()))?;
      tracing::debug!(path = %path.display(), "persisting cache entries");
      self.storage = Some(Arc::new(storage));
    }
    self.build()
  }
}

impl<V: Payload> Default for EngineBuilder<V> {
  fn default() -> Self {
    Self::new()
  }
}
