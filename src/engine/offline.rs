//! Offline queue: mutations made without connectivity, replayed in order once it returns.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use super::mutation::{Committer, MutationId, Outcome, SettleGuard};
use super::{Inner, Payload, Resolution};
use crate::config::OverflowPolicy;
use crate::error::{SyncError, SyncResult};
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueItemState {
  Queued,
  Draining,
  Committed,
  Failed,
}

pub(crate) struct QueuedMutation<V> {
  pub(crate) id: MutationId,
  pub(crate) fingerprint: Fingerprint,
  committer: Committer<V>,
  value: V,
  timeout: Duration,
  enqueued_at: DateTime<Utc>,
  state: QueueItemState,
  reply: oneshot::Sender<SyncResult<V>>,
}

impl<V> QueuedMutation<V> {
  pub(crate) fn new(
    id: MutationId,
    fingerprint: Fingerprint,
    committer: Committer<V>,
    value: V,
    timeout: Duration,
    reply: oneshot::Sender<SyncResult<V>>,
  ) -> Self {
    Self {
      id,
      fingerprint,
      committer,
      value,
      timeout,
      enqueued_at: Utc::now(),
      state: QueueItemState::Queued,
      reply,
    }
  }

  fn respond(mut self, result: SyncResult<V>) {
    self.state = if result.is_ok() {
      QueueItemState::Committed
    } else {
      QueueItemState::Failed
    };
    let waited_ms = (Utc::now() - self.enqueued_at).num_milliseconds();
    tracing::debug!(
      fingerprint = %self.fingerprint,
      mutation = %self.id,
      state = ?self.state,
      waited_ms,
      "queued mutation finished"
    );
    // The caller may have stopped waiting
    let _ = self.reply.send(result);
  }
}

struct QueueState<V> {
  items: VecDeque<QueuedMutation<V>>,
  /// Key of the item currently being replayed, if any
  draining_key: Option<Fingerprint>,
}

/// FIFO of mutations waiting for connectivity.
pub(crate) struct OfflineQueue<V> {
  state: Mutex<QueueState<V>>,
  capacity: usize,
  overflow: OverflowPolicy,
}

impl<V> OfflineQueue<V> {
  pub(crate) fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
    Self {
      state: Mutex::new(QueueState {
        items: VecDeque::new(),
        draining_key: None,
      }),
      capacity,
      overflow,
    }
  }

  /// Lock the queue so routing a mutation and enqueueing it happen atomically.
  pub(crate) fn lock(&self) -> QueueGuard<'_, V> {
    QueueGuard {
      state: self.state.lock(),
      capacity: self.capacity,
      overflow: self.overflow,
    }
  }

  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }

  /// Take the next item to replay and mark its key as draining.
  fn pop_front(&self) -> Option<QueuedMutation<V>> {
    let mut state = self.state.lock();
    let item = state.items.pop_front()?;
    state.draining_key = Some(item.fingerprint.clone());
    Some(item)
  }

  fn finish(&self) {
    self.state.lock().draining_key = None;
  }

  pub(crate) fn len(&self) -> usize {
    self.state.lock().items.len()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub(crate) fn take_all(&self) -> Vec<QueuedMutation<V>> {
    let mut state = self.state.lock();
    state.draining_key = None;
    state.items.drain(..).collect()
  }
}

pub(crate) struct QueueGuard<'a, V> {
  state: MutexGuard<'a, QueueState<V>>,
  capacity: usize,
  overflow: OverflowPolicy,
}

impl<V> QueueGuard<'_, V> {
  /// Whether work for this key is queued or being replayed.
  pub(crate) fn has_key(&self, fingerprint: &Fingerprint) -> bool {
    self.state.draining_key.as_ref() == Some(fingerprint)
      || self.state.items.iter().any(|m| &m.fingerprint == fingerprint)
  }

  /// Check capacity before anything is written for a new mutation.
  pub(crate) fn admit(&self) -> SyncResult<()> {
    let full = self.state.items.len() >= self.capacity;
    if self.capacity == 0 || (full && self.overflow == OverflowPolicy::RejectNew) {
      return Err(SyncError::QueueCapacity {
        capacity: self.capacity,
      });
    }
    Ok(())
  }

  /// Append an item. Returns the evicted oldest item when the queue was full.
  pub(crate) fn push(&mut self, item: QueuedMutation<V>) -> Option<QueuedMutation<V>> {
    let evicted = if self.state.items.len() >= self.capacity {
      self.state.items.pop_front()
    } else {
      None
    };
    self.state.items.push_back(item);
    evicted
  }

  pub(crate) fn len(&self) -> usize {
    self.state.items.len()
  }
}

/// What to do with a queued mutation after checking the server's current value.
enum Reconciled<V> {
  Commit(V),
  KeepServer(V),
  MergeFailed(SyncError, V),
}

impl<V: Payload> Inner<V> {
  /// Replay queued mutations in order while connectivity lasts.
  pub(crate) async fn drain(self: Arc<Self>) {
    loop {
      if self.draining.swap(true, Ordering::AcqRel) {
        return;
      }

      tracing::info!(queued = self.queue.len(), "draining offline queue");
      let mut drained = 0usize;
      while self.is_online() && !self.is_closed() {
        let Some(item) = self.queue.pop_front() else {
          break;
        };
        self.drain_item(item).await;
        drained += 1;
      }
      self.draining.store(false, Ordering::Release);
      tracing::info!(drained, remaining = self.queue.len(), "offline queue drain finished");

      // Something may have been queued between the last pop and clearing the flag
      if !self.is_online() || self.is_closed() || self.queue.is_empty() {
        return;
      }
    }
  }

  async fn drain_item(self: &Arc<Self>, mut item: QueuedMutation<V>) {
    item.state = QueueItemState::Draining;
    let fingerprint = item.fingerprint.clone();
    let mut guard = SettleGuard::new(self, &fingerprint, item.id);
    let key = self.locks.acquire(&fingerprint).await;

    let result = match self.reconcile(&item).await {
      Reconciled::Commit(value) => {
        self
          .commit_locked(&fingerprint, item.id, &item.committer, value, item.timeout)
          .await
      }
      Reconciled::KeepServer(server) => {
        tracing::info!(%fingerprint, mutation = %item.id, "server changed while offline, keeping server value");
        self.settle(&fingerprint, item.id, Outcome::Superseded(server.clone()));
        Ok(server)
      }
      Reconciled::MergeFailed(err, server) => {
        tracing::warn!(%fingerprint, mutation = %item.id, error = %err, "merge failed, keeping server value");
        self.settle(&fingerprint, item.id, Outcome::Superseded(server));
        Err(err)
      }
    };
    guard.disarm();
    drop(key);

    self.queue.finish();
    item.respond(result);
  }

  async fn reconcile(&self, item: &QueuedMutation<V>) -> Reconciled<V> {
    let fingerprint = &item.fingerprint;
    let merge = match &self.resolution {
      Resolution::ClientWins => return Reconciled::Commit(item.value.clone()),
      Resolution::ServerWins => None,
      Resolution::Merge(merge) => Some(merge),
    };

    let Some(registration) = self.fetches.registration(fingerprint) else {
      tracing::debug!(%fingerprint, "no fetcher known, committing queued value");
      return Reconciled::Commit(item.value.clone());
    };
    let fetcher = registration.fetcher;
    let server = match self
      .settings
      .retry
      .run("conflict check", fingerprint, || fetcher(), |_| {})
      .await
    {
      Ok(server) => server,
      Err(e) => {
        tracing::warn!(%fingerprint, error = %e, "could not fetch server value, committing queued value");
        return Reconciled::Commit(item.value.clone());
      }
    };

    let base = self.mutations.snapshot_value(fingerprint, item.id);
    if base.as_ref() == Some(&server) {
      return Reconciled::Commit(item.value.clone());
    }

    match merge {
      None => Reconciled::KeepServer(server),
      Some(merge) => match merge(&server, &item.value) {
        Ok(merged) => {
          tracing::debug!(%fingerprint, mutation = %item.id, "merged queued value with server value");
          Reconciled::Commit(merged)
        }
        Err(report) => Reconciled::MergeFailed(SyncError::conflict(&report), server),
      },
    }
  }

  /// Roll back a queued mutation that will never be replayed.
  pub(crate) fn fail_queued(self: &Arc<Self>, item: QueuedMutation<V>, err: SyncError) {
    tracing::warn!(fingerprint = %item.fingerprint, mutation = %item.id, error = %err, "dropping queued mutation");
    self.settle(&item.fingerprint, item.id, Outcome::Failed);
    item.respond(Err(err));
  }

  pub(crate) fn evict(self: &Arc<Self>, item: QueuedMutation<V>) {
    let capacity = self.queue.capacity();
    self.fail_queued(item, SyncError::QueueCapacity { capacity });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ConflictPolicy;
  use crate::engine::{MutateOptions, ReadOptions, RetryPolicy, SyncEngine};
  use color_eyre::eyre::eyre;
  use futures::FutureExt;
  use std::sync::atomic::AtomicUsize;

  fn item(id: u64, key: &str) -> (QueuedMutation<u32>, oneshot::Receiver<SyncResult<u32>>) {
    let (tx, rx) = oneshot::channel();
    let committer: Committer<u32> =
      Arc::new(|value: u32| async move { Ok::<_, color_eyre::Report>(value) }.boxed());
    let item = QueuedMutation::new(
      MutationId::from_raw(id),
      Fingerprint::of_resource(key),
      committer,
      id as u32,
      Duration::from_secs(1),
      tx,
    );
    (item, rx)
  }

  #[test]
  fn test_drop_oldest_evicts_front() {
    let queue = OfflineQueue::new(2, OverflowPolicy::DropOldest);
    let mut guard = queue.lock();
    for id in 1..=2 {
      guard.admit().unwrap();
      assert!(guard.push(item(id, "a").0).is_none());
    }
    guard.admit().unwrap();
    let evicted = guard.push(item(3, "b").0).unwrap();
    assert_eq!(evicted.id, MutationId::from_raw(1));
    assert_eq!(guard.len(), 2);
  }

  #[test]
  fn test_reject_new_refuses_when_full() {
    let queue = OfflineQueue::new(1, OverflowPolicy::RejectNew);
    let mut guard = queue.lock();
    guard.admit().unwrap();
    guard.push(item(1, "a").0);
    assert_eq!(
      guard.admit().unwrap_err(),
      SyncError::QueueCapacity { capacity: 1 }
    );
  }

  #[test]
  fn test_draining_key_counts_as_queued() {
    let queue = OfflineQueue::new(4, OverflowPolicy::DropOldest);
    queue.lock().push(item(1, "a").0);
    let popped = queue.pop_front().unwrap();

    assert!(queue.is_empty());
    assert!(queue.lock().has_key(&popped.fingerprint));
    queue.finish();
    assert!(!queue.lock().has_key(&popped.fingerprint));
  }

  /// Server state shared between the fetcher and the test.
  fn server(initial: &str) -> Arc<parking_lot::Mutex<String>> {
    Arc::new(parking_lot::Mutex::new(initial.to_string()))
  }

  async fn seeded(engine: &SyncEngine<String>, fp: &Fingerprint, remote: &Arc<parking_lot::Mutex<String>>) {
    let remote = remote.clone();
    engine
      .read(
        fp,
        move || {
          let value = remote.lock().clone();
          async move { Ok(value) }
        },
        ReadOptions::new(),
      )
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_server_wins_keeps_changed_server_value() {
    let engine: SyncEngine<String> = SyncEngine::builder()
      .retry(RetryPolicy::none())
      .conflict_policy(ConflictPolicy::ServerWins)
      .build()
      .unwrap();
    let fp = Fingerprint::of_resource("doc/1");
    let remote = server("A");
    seeded(&engine, &fp, &remote).await;

    engine.on_connectivity_change(false);
    let commits = Arc::new(AtomicUsize::new(0));
    let pending = {
      let engine = engine.clone();
      let fp = fp.clone();
      let commits = commits.clone();
      tokio::spawn(async move {
        engine
          .mutate(
            &fp,
            "B".to_string(),
            move |value| {
              commits.fetch_add(1, Ordering::SeqCst);
              async move { Ok(value) }
            },
            MutateOptions::new(),
          )
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.peek(&fp).as_deref(), Some("B"));
    assert_eq!(engine.queued_len(), 1);

    *remote.lock() = "S".to_string();
    engine.on_connectivity_change(true);

    assert_eq!(pending.await.unwrap().unwrap(), "S");
    assert_eq!(engine.peek(&fp).as_deref(), Some("S"));
    assert_eq!(commits.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_unchanged_server_value_commits_queued_value() {
    let engine: SyncEngine<String> = SyncEngine::builder()
      .retry(RetryPolicy::none())
      .conflict_policy(ConflictPolicy::ServerWins)
      .build()
      .unwrap();
    let fp = Fingerprint::of_resource("doc/1");
    let remote = server("A");
    seeded(&engine, &fp, &remote).await;

    engine.on_connectivity_change(false);
    let pending = {
      let engine = engine.clone();
      let fp = fp.clone();
      let remote = remote.clone();
      tokio::spawn(async move {
        engine
          .mutate(
            &fp,
            "B".to_string(),
            move |value| {
              *remote.lock() = value.clone();
              async move { Ok(value) }
            },
            MutateOptions::new(),
          )
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.on_connectivity_change(true);

    assert_eq!(pending.await.unwrap().unwrap(), "B");
    assert_eq!(*remote.lock(), "B");
  }

  #[tokio::test]
  async fn test_merge_policy_commits_merged_value() {
    let engine: SyncEngine<String> = SyncEngine::builder()
      .retry(RetryPolicy::none())
      .merge_with(|server: &String, queued: &String| Ok(format!("{server}+{queued}")))
      .build()
      .unwrap();
    let fp = Fingerprint::of_resource("doc/1");
    let remote = server("A");
    seeded(&engine, &fp, &remote).await;

    engine.on_connectivity_change(false);
    let pending = {
      let engine = engine.clone();
      let fp = fp.clone();
      tokio::spawn(async move {
        engine
          .mutate(&fp, "B".to_string(), |value| async move { Ok(value) }, MutateOptions::new())
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    *remote.lock() = "S".to_string();
    engine.on_connectivity_change(true);

    assert_eq!(pending.await.unwrap().unwrap(), "S+B");
    assert_eq!(engine.peek(&fp).as_deref(), Some("S+B"));
  }

  #[tokio::test]
  async fn test_failed_merge_reports_conflict() {
    let engine: SyncEngine<String> = SyncEngine::builder()
      .retry(RetryPolicy::none())
      .merge_with(|_: &String, _: &String| Err(eyre!("incompatible edits")))
      .build()
      .unwrap();
    let fp = Fingerprint::of_resource("doc/1");
    let remote = server("A");
    seeded(&engine, &fp, &remote).await;

    engine.on_connectivity_change(false);
    let pending = {
      let engine = engine.clone();
      let fp = fp.clone();
      tokio::spawn(async move {
        engine
          .mutate(&fp, "B".to_string(), |value| async move { Ok(value) }, MutateOptions::new())
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    *remote.lock() = "S".to_string();
    engine.on_connectivity_change(true);

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, SyncError::Conflict("incompatible edits".to_string()));
    assert_eq!(engine.peek(&fp).as_deref(), Some("S"));
  }

  #[tokio::test]
  async fn test_shutdown_fails_queued_mutations() {
    let engine: SyncEngine<String> = SyncEngine::builder().start_offline().build().unwrap();
    let fp = Fingerprint::of_resource("doc/1");

    let pending = {
      let engine = engine.clone();
      let fp = fp.clone();
      tokio::spawn(async move {
        engine
          .mutate(&fp, "B".to_string(), |value| async move { Ok(value) }, MutateOptions::new())
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.queued_len(), 1);

    engine.shutdown();
    assert_eq!(pending.await.unwrap().unwrap_err(), SyncError::Shutdown);
    assert!(engine.entry(&fp).is_none());
    assert_eq!(engine.queued_len(), 0);
  }
}
