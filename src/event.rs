use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::cache::Selector;
use crate::engine::{Payload, SyncEngine};

/// Events pushed at an engine from outside: server push channels, connectivity checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
  /// The server reported that matching entries changed
  Invalidate(Selector),
  /// Connectivity became available (`true`) or was lost (`false`)
  Connectivity(bool),
}

fn apply<V: Payload>(engine: &SyncEngine<V>, event: EngineEvent) {
  match event {
    EngineEvent::Invalidate(selector) => engine.on_invalidation_event(selector),
    EngineEvent::Connectivity(online) => engine.on_connectivity_change(online),
  }
}

/// Forward every event of `events` to `engine` on a background task.
///
/// The task holds only a weak handle, so it ends when the stream ends, when the engine
/// is dropped, or at shutdown.
pub fn spawn_feed<V, S>(engine: &SyncEngine<V>, events: S)
where
  V: Payload,
  S: Stream<Item = EngineEvent> + Send + 'static,
{
  let weak = engine.downgrade();
  let handle = tokio::spawn(async move {
    let mut events = Box::pin(events);
    while let Some(event) = events.next().await {
      let Some(engine) = weak.upgrade() else {
        break;
      };
      tracing::trace!(?event, "engine event");
      apply(&engine, event);
    }
    tracing::debug!("engine event feed closed");
  });
  engine.track(handle);
}

/// Channel-backed event source attached to one engine
#[derive(Clone)]
pub struct EventFeed {
  tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventFeed {
  /// Create a feed whose events are applied to `engine` in the order they are sent
  pub fn attach<V: Payload>(engine: &SyncEngine<V>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let events = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
    spawn_feed(engine, events);
    Self { tx }
  }

  /// Returns `false` once the engine is gone
  pub fn send(&self, event: EngineEvent) -> bool {
    self.tx.send(event).is_ok()
  }

  pub fn invalidate(&self, selector: Selector) -> bool {
    self.send(EngineEvent::Invalidate(selector))
  }

  pub fn connectivity(&self, online: bool) -> bool {
    self.send(EngineEvent::Connectivity(online))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::EntryState;
  use crate::engine::{ReadOptions, RetryPolicy};
  use crate::fingerprint::Fingerprint;
  use std::time::Duration;

  fn engine() -> SyncEngine<u32> {
    SyncEngine::builder()
      .retry(RetryPolicy::none())
      .build()
      .unwrap()
  }

  #[tokio::test]
  async fn test_stream_events_reach_engine() {
    let engine = engine();
    let fp = Fingerprint::of_resource("users/1");
    engine
      .read(&fp, || async { Ok(1) }, ReadOptions::new().tag("users"))
      .await
      .unwrap();

    spawn_feed(
      &engine,
      futures::stream::iter(vec![
        EngineEvent::Connectivity(false),
        EngineEvent::Invalidate(Selector::tag("users")),
      ]),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!engine.is_online());
    assert_eq!(engine.state(&fp), Some(EntryState::Stale));
  }

  #[tokio::test]
  async fn test_channel_feed_applies_in_order() {
    let engine = engine();
    let feed = EventFeed::attach(&engine);

    assert!(feed.connectivity(false));
    assert!(feed.connectivity(true));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.is_online());
  }

  #[tokio::test]
  async fn test_feed_stops_after_shutdown() {
    let engine = engine();
    let feed = EventFeed::attach(&engine);
    engine.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!feed.connectivity(false));
  }
}
