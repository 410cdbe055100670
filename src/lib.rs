//! Client-side data synchronization.
//!
//! `syncache` keeps a local cache of server resources coherent with the server:
//! - reads are served from cache when fresh and coalesced when they need the network
//! - writes are applied optimistically and rolled back if the server rejects them
//! - entries are invalidated by key, by tag, by TTL or by pushed events
//! - writes made offline are queued and replayed in order when connectivity returns
//!
//! The engine is generic over the payload type and never performs I/O itself: callers
//! hand it fetcher and committer closures.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod fingerprint;

pub use cache::{CacheEntry, CacheResult, CacheSource, CacheStorage, EntryState, Selector, SqliteStorage};
pub use config::{ConflictPolicy, EngineConfig, OverflowPolicy};
pub use engine::{
  EngineBuilder, MutateOptions, MutationId, MutationInfo, MutationStatus, NotifyReason, Payload,
  ReadOptions, RetryPolicy, SubscriberId, SubscriptionGuard, SyncEngine, WeakSyncEngine,
};
pub use error::{SyncError, SyncResult};
pub use event::{EngineEvent, EventFeed};
pub use fingerprint::{Fingerprint, QueryKey};
