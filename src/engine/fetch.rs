//! Fetch coordination: cache hits, request coalescing and stale-while-revalidate.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use super::{Inner, NotifyReason, Payload, PayloadFuture, Ttl};
use crate::cache::{CacheResult, EntryState};
use crate::error::{SyncError, SyncResult};
use crate::fingerprint::Fingerprint;

pub(crate) type Fetcher<V> = Arc<dyn Fn() -> PayloadFuture<V> + Send + Sync>;

type SharedFetch<V> = Shared<BoxFuture<'static, SyncResult<V>>>;

/// Per-read options.
#[derive(Debug, Clone)]
pub struct ReadOptions {
  pub(crate) ttl: Ttl,
  pub(crate) tags: BTreeSet<String>,
  pub(crate) stale_while_revalidate: bool,
  pub(crate) fallback_to_last_good: bool,
}

impl Default for ReadOptions {
  fn default() -> Self {
    Self {
      ttl: Ttl::Default,
      tags: BTreeSet::new(),
      stale_while_revalidate: false,
      fallback_to_last_good: true,
    }
  }
}

impl ReadOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Keep the fetched value fresh for `ttl` instead of the engine default.
  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Ttl::After(ttl);
    self
  }

  /// Never expire the fetched value.
  pub fn no_expiry(mut self) -> Self {
    self.ttl = Ttl::Never;
    self
  }

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

  /// Serve stale or expired values immediately and refetch in the background.
  pub fn stale_while_revalidate(mut self) -> Self {
    self.stale_while_revalidate = true;
    self
  }

  /// Don't serve the last known good value of an entry whose last fetch failed;
  /// block on a new fetch instead.
  pub fn without_fallback(mut self) -> Self {
    self.fallback_to_last_good = false;
    self
  }
}

/// The most recent fetcher used for a key, kept so invalidations can refetch eagerly.
pub(crate) struct Registration<V> {
  pub(crate) fetcher: Fetcher<V>,
  pub(crate) options: ReadOptions,
}

impl<V> Clone for Registration<V> {
  fn clone(&self) -> Self {
    Self {
      fetcher: Arc::clone(&self.fetcher),
      options: self.options.clone(),
    }
  }
}

/// In-flight fetch table plus remembered fetchers.
pub(crate) struct FetchCoordinator<V> {
  in_flight: Mutex<HashMap<Fingerprint, SharedFetch<V>>>,
  registrations: Mutex<HashMap<Fingerprint, Registration<V>>>,
}

impl<V: Payload> FetchCoordinator<V> {
  pub(crate) fn new() -> Self {
    Self {
      in_flight: Mutex::new(HashMap::new()),
      registrations: Mutex::new(HashMap::new()),
    }
  }

  pub(crate) fn register(&self, fingerprint: &Fingerprint, fetcher: Fetcher<V>, options: ReadOptions) {
    self
      .registrations
      .lock()
      .insert(fingerprint.clone(), Registration { fetcher, options });
  }

  pub(crate) fn registration(&self, fingerprint: &Fingerprint) -> Option<Registration<V>> {
    self.registrations.lock().get(fingerprint).cloned()
  }

  #[cfg(test)]
  pub(crate) fn is_in_flight(&self, fingerprint: &Fingerprint) -> bool {
    self.in_flight.lock().contains_key(fingerprint)
  }

  fn finish(&self, fingerprint: &Fingerprint) {
    self.in_flight.lock().remove(fingerprint);
  }
}

impl<V: Payload> Inner<V> {
  pub(crate) async fn read(
    self: &Arc<Self>,
    fingerprint: &Fingerprint,
    fetcher: Fetcher<V>,
    options: ReadOptions,
  ) -> SyncResult<CacheResult<V>> {
    self.ensure_open()?;
    self.fetches.register(fingerprint, fetcher, options.clone());

    if let Some(entry) = self.store.get(fingerprint) {
      let now = Utc::now();
      if let Some(value) = entry.value.clone() {
        if entry.is_servable(now) {
          tracing::debug!(%fingerprint, version = entry.version, "cache hit");
          return Ok(CacheResult::from_cache(value, entry.version, false));
        }

        let stale = matches!(entry.state, EntryState::Stale | EntryState::Revalidating)
          || (entry.state == EntryState::Fresh && entry.is_expired(now));
        if stale && options.stale_while_revalidate {
          tracing::debug!(%fingerprint, "serving stale value while revalidating");
          self.start_fetch(fingerprint);
          return Ok(CacheResult::from_cache(value, entry.version, true));
        }

        if entry.state == EntryState::Error && options.fallback_to_last_good {
          tracing::debug!(%fingerprint, "serving last known good value");
          self.start_fetch(fingerprint);
          return Ok(CacheResult::fallback(value, entry.version));
        }
      }
    }

    let fetch = self
      .start_fetch(fingerprint)
      .ok_or_else(|| SyncError::Fetch(format!("no fetcher registered for {}", fingerprint)))?;
    fetch.await.map(CacheResult::from_network)
  }

  /// Join the in-flight fetch for `fingerprint`, or start one with its remembered fetcher.
  /// Returns `None` if no fetcher was ever registered for the key, or if there is no
  /// runtime to run one on.
  ///
  /// The fetch runs on its own task, so it completes (and updates the cache) even when
  /// every caller waiting on it has gone away.
  pub(crate) fn start_fetch(self: &Arc<Self>, fingerprint: &Fingerprint) -> Option<SharedFetch<V>> {
    let mut in_flight = self.fetches.in_flight.lock();
    if let Some(existing) = in_flight.get(fingerprint) {
      tracing::debug!(%fingerprint, "joining in-flight fetch");
      return Some(existing.clone());
    }

    let registration = self.fetches.registration(fingerprint)?;
    // Event feeds may call in from plain threads
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      tracing::debug!(%fingerprint, "no async runtime, refetch left to the next read");
      return None;
    };
    let start_version = self.store.begin_revalidation(fingerprint, &registration.options.tags);
    tracing::debug!(%fingerprint, start_version, "starting fetch");

    let task = {
      let inner = Arc::clone(self);
      let fingerprint = fingerprint.clone();
      runtime.spawn(async move { inner.run_fetch(fingerprint, registration, start_version).await })
    };

    let weak = Arc::downgrade(self);
    let key = fingerprint.clone();
    let shared = async move {
      match task.await {
        Ok(result) => result,
        Err(e) => {
          // The task never reached its cleanup
          if let Some(inner) = weak.upgrade() {
            if !inner.mutations.has_pending(&key) {
              inner.store.mark_error(&key, "fetch task aborted");
            }
            inner.fetches.finish(&key);
          }
          if e.is_cancelled() {
            Err(SyncError::Shutdown)
          } else {
            Err(SyncError::Fetch("fetcher panicked".to_string()))
          }
        }
      }
    }
    .boxed()
    .shared();

    in_flight.insert(fingerprint.clone(), shared.clone());
    Some(shared)
  }

  async fn run_fetch(
    self: Arc<Self>,
    fingerprint: Fingerprint,
    registration: Registration<V>,
    start_version: u64,
  ) -> SyncResult<V> {
    let fetcher = Arc::clone(&registration.fetcher);
    let result = self
      .settings
      .retry
      .run("fetch", &fingerprint, || fetcher(), |_| {})
      .await;

    // Completions are applied in arrival order with commits on the same key
    let key_guard = self.locks.acquire(&fingerprint).await;

    let mut refreshed = None;
    let outcome = match result {
      Ok(value) => {
        let ttl = registration.options.ttl.resolve(self.settings.default_ttl);
        match self.mutations.apply_fetched(
          &self.store,
          &fingerprint,
          start_version,
          value.clone(),
          registration.options.tags.clone(),
          ttl,
        ) {
          Some(entry) => {
            self.schedule_expiry(&fingerprint, &entry);
            tracing::debug!(%fingerprint, version = entry.version, "fetch stored");
            refreshed = Some(entry);
          }
          None => {
            tracing::debug!(%fingerprint, "fetch result superseded by a local write, not stored")
          }
        }
        Ok(value)
      }
      Err(report) => {
        let err = SyncError::fetch(&report);
        tracing::warn!(%fingerprint, error = %err, "fetch failed");
        self
          .mutations
          .apply_fetch_error(&self.store, &fingerprint, start_version, &err.to_string());
        Err(err)
      }
    };

    self.fetches.finish(&fingerprint);
    drop(key_guard);

    if let Some(entry) = refreshed {
      self
        .subscriptions
        .notify(&fingerprint, &entry.tags, entry.value.as_ref(), NotifyReason::Refetched);
    }
    outcome
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, Selector};
  use crate::engine::SyncEngine;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn engine() -> SyncEngine<String> {
    SyncEngine::builder()
      .retry(crate::engine::RetryPolicy::none())
      .build()
      .unwrap()
  }

  #[tokio::test]
  async fn test_miss_then_hit() {
    let engine = engine();
    let fp = Fingerprint::of_resource("users/1");
    let calls = Arc::new(AtomicUsize::new(0));

    for expected in [CacheSource::Network, CacheSource::CacheFresh] {
      let calls = calls.clone();
      let result = engine
        .read(
          &fp,
          move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok("alice".to_string()) }
          },
          ReadOptions::new(),
        )
        .await
        .unwrap();
      assert_eq!(result.data, "alice");
      assert_eq!(result.source, expected);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.entry(&fp).unwrap().version, 1);
  }

  #[tokio::test]
  async fn test_failed_first_fetch_leaves_error_placeholder() {
    let engine = engine();
    let fp = Fingerprint::of_resource("users/1");

    let err = engine
      .read(&fp, || async { Err(eyre!("503")) }, ReadOptions::new())
      .await
      .unwrap_err();
    assert_eq!(err, SyncError::Fetch("503".to_string()));

    let entry = engine.entry(&fp).unwrap();
    assert_eq!(entry.state, EntryState::Error);
    assert!(entry.value.is_none());
    assert_eq!(entry.last_error.as_deref(), Some("fetch failed: 503"));
  }

  #[tokio::test]
  async fn test_error_entry_serves_last_known_good() {
    let engine = engine();
    let fp = Fingerprint::of_resource("users/1");
    engine
      .read(&fp, || async { Ok("alice".to_string()) }, ReadOptions::new())
      .await
      .unwrap();
    engine.invalidate(&Selector::key(fp.clone()));

    let err = engine
      .read(&fp, || async { Err(eyre!("down")) }, ReadOptions::new())
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::Fetch(_)));
    assert_eq!(engine.state(&fp), Some(EntryState::Error));

    let fallback = engine
      .read(&fp, || async { Err(eyre!("still down")) }, ReadOptions::new())
      .await
      .unwrap();
    assert_eq!(fallback.data, "alice");
    assert_eq!(fallback.source, CacheSource::Fallback);
  }

  #[tokio::test]
  async fn test_opting_out_of_fallback_blocks_on_fetch() {
    let engine = engine();
    let fp = Fingerprint::of_resource("users/1");
    engine
      .read(&fp, || async { Ok("alice".to_string()) }, ReadOptions::new())
      .await
      .unwrap();
    engine.invalidate(&Selector::key(fp.clone()));
    let _ = engine
      .read(&fp, || async { Err(eyre!("down")) }, ReadOptions::new())
      .await;

    let fresh = engine
      .read(
        &fp,
        || async { Ok("bob".to_string()) },
        ReadOptions::new().without_fallback(),
      )
      .await
      .unwrap();
    assert_eq!(fresh.data, "bob");
    assert_eq!(fresh.source, CacheSource::Network);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_immediately() {
    let engine = engine();
    let fp = Fingerprint::of_resource("users/1");
    engine
      .read(&fp, || async { Ok("alice".to_string()) }, ReadOptions::new())
      .await
      .unwrap();
    engine.invalidate(&Selector::key(fp.clone()));

    let stale = engine
      .read(
        &fp,
        || async {
          tokio::time::sleep(Duration::from_millis(30)).await;
          Ok("bob".to_string())
        },
        ReadOptions::new().stale_while_revalidate(),
      )
      .await
      .unwrap();
    assert_eq!(stale.data, "alice");
    assert_eq!(stale.source, CacheSource::CacheStale);
    assert_eq!(engine.state(&fp), Some(EntryState::Revalidating));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(engine.peek(&fp).as_deref(), Some("bob"));
    assert_eq!(engine.state(&fp), Some(EntryState::Fresh));
  }

  #[tokio::test]
  async fn test_stale_without_swr_blocks_for_refetch() {
    let engine = engine();
    let fp = Fingerprint::of_resource("users/1");
    engine
      .read(&fp, || async { Ok("alice".to_string()) }, ReadOptions::new())
      .await
      .unwrap();
    engine.invalidate(&Selector::key(fp.clone()));

    let result = engine
      .read(&fp, || async { Ok("bob".to_string()) }, ReadOptions::new())
      .await
      .unwrap();
    assert_eq!(result.data, "bob");
    assert_eq!(engine.entry(&fp).unwrap().version, 2);
  }

  #[tokio::test]
  async fn test_fetch_survives_cancelled_reader() {
    let engine = engine();
    let fp = Fingerprint::of_resource("users/1");
    let calls = Arc::new(AtomicUsize::new(0));

    let fetcher = {
      let calls = calls.clone();
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
          tokio::time::sleep(Duration::from_millis(40)).await;
          Ok("alice".to_string())
        }
      }
    };

    // First reader gives up early; second keeps waiting on the same fetch
    let cancelled = tokio::time::timeout(
      Duration::from_millis(5),
      engine.read(&fp, fetcher.clone(), ReadOptions::new()),
    )
    .await;
    assert!(cancelled.is_err());
    assert!(engine.inner.fetches.is_in_flight(&fp));

    let result = engine.read(&fp, fetcher, ReadOptions::new()).await.unwrap();
    assert_eq!(result.data, "alice");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!engine.inner.fetches.is_in_flight(&fp));
  }

  #[tokio::test]
  async fn test_ttl_option_overrides_default() {
    let engine = engine();
    let fp = Fingerprint::of_resource("users/1");
    engine
      .read(
        &fp,
        || async { Ok("alice".to_string()) },
        ReadOptions::new().no_expiry().tag("users"),
      )
      .await
      .unwrap();

    let entry = engine.entry(&fp).unwrap();
    assert!(entry.expires_at.is_none());
    assert!(entry.has_tag("users"));
  }
}
