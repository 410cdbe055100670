//! Cache entries, the in-memory entry store and its persistence hook.
//!
//! This module is transport-agnostic data plumbing:
//! - Entries keyed by [`Fingerprint`](crate::Fingerprint) with tags, TTL-derived expiry,
//!   a lifecycle state and a monotonically increasing version
//! - Write-through to an optional durable [`CacheStorage`] (SQLite by default)
//! - Read outcome types describing where a value came from

mod entry;
mod storage;
mod store;

pub use entry::{CacheEntry, CacheResult, CacheSource, EntryState, Selector};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use store::EntryStore;

pub(crate) use store::expiry_after;
