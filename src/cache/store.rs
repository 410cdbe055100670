//! In-memory entry store with optional write-through persistence.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::entry::{CacheEntry, EntryState};
use super::storage::{CacheStorage, NoopStorage};
use crate::fingerprint::Fingerprint;

/// Absolute expiry for a value written now with the given TTL.
pub(crate) fn expiry_after(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
  ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok().map(|d| Utc::now() + d))
}

/// Holds every cache entry, keyed by fingerprint.
///
/// This is plain data: no I/O other than the optional write-through to a
/// [`CacheStorage`], and no blocking on anything but its own short critical sections.
pub struct EntryStore<V> {
  slots: Mutex<Slots<V>>,
  storage: Arc<dyn CacheStorage<V>>,
}

struct Slots<V> {
  entries: HashMap<Fingerprint, CacheEntry<V>>,
  /// Last version of removed entries, so a re-created entry keeps counting up
  retired: HashMap<Fingerprint, u64>,
}

impl<V: Clone + 'static> EntryStore<V> {
  /// Create a purely in-memory store.
  pub fn new() -> Self {
    Self::with_storage(Arc::new(NoopStorage))
  }

  /// Create a store that writes through to the given storage.
  pub fn with_storage(storage: Arc<dyn CacheStorage<V>>) -> Self {
    Self {
      slots: Mutex::new(Slots {
        entries: HashMap::new(),
        retired: HashMap::new(),
      }),
      storage,
    }
  }

  pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry<V>> {
    self.slots.lock().entries.get(fingerprint).cloned()
  }

  pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
    self.slots.lock().entries.contains_key(fingerprint)
  }

  /// Write a value. The entry becomes `Fresh` and its version is bumped.
  pub fn put(
    &self,
    fingerprint: &Fingerprint,
    value: V,
    tags: BTreeSet<String>,
    ttl: Option<Duration>,
  ) -> CacheEntry<V> {
    self.put_until(fingerprint, value, tags, expiry_after(ttl))
  }

  /// Like [`put`](Self::put), with an absolute expiry instead of a TTL.
  pub fn put_until(
    &self,
    fingerprint: &Fingerprint,
    value: V,
    tags: BTreeSet<String>,
    expires_at: Option<DateTime<Utc>>,
  ) -> CacheEntry<V> {
    let mut slots = self.slots.lock();
    let previous = slots
      .entries
      .get(fingerprint)
      .map(|e| e.version)
      .or_else(|| slots.retired.get(fingerprint).copied())
      .unwrap_or(0);

    let entry = CacheEntry {
      value: Some(value),
      tags,
      created_at: Utc::now(),
      expires_at,
      state: EntryState::Fresh,
      version: previous + 1,
      last_error: None,
    };
    slots.retired.remove(fingerprint);
    slots.entries.insert(fingerprint.clone(), entry.clone());
    self.write_through(fingerprint, &entry);
    entry
  }

  /// Change the state of an existing entry. Returns `false` if there is no entry.
  pub fn mark_state(&self, fingerprint: &Fingerprint, state: EntryState) -> bool {
    let mut slots = self.slots.lock();
    let Some(entry) = slots.entries.get_mut(fingerprint) else {
      return false;
    };
    entry.state = state;
    if state != EntryState::Error {
      entry.last_error = None;
    }
    let entry = entry.clone();
    self.write_through(fingerprint, &entry);
    true
  }

  /// Transition `Fresh` or `Error` to `Stale`. Returns the updated entry, or `None` when
  /// the entry is absent or already `Stale`/`Revalidating`.
  pub fn mark_stale(&self, fingerprint: &Fingerprint) -> Option<CacheEntry<V>> {
    let mut slots = self.slots.lock();
    let entry = slots.entries.get_mut(fingerprint)?;
    if !matches!(entry.state, EntryState::Fresh | EntryState::Error) {
      return None;
    }
    entry.state = EntryState::Stale;
    entry.last_error = None;
    let entry = entry.clone();
    self.write_through(fingerprint, &entry);
    Some(entry)
  }

  /// Put an entry in `Error`, keeping its value as the last known good one.
  pub fn mark_error(&self, fingerprint: &Fingerprint, message: &str) -> bool {
    let mut slots = self.slots.lock();
    let Some(entry) = slots.entries.get_mut(fingerprint) else {
      return false;
    };
    entry.state = EntryState::Error;
    entry.last_error = Some(message.to_string());
    let entry = entry.clone();
    self.write_through(fingerprint, &entry);
    true
  }

  /// Mark an entry `Revalidating`, creating a value-less placeholder if it is absent.
  /// Returns the version the revalidation started from.
  pub fn begin_revalidation(&self, fingerprint: &Fingerprint, tags: &BTreeSet<String>) -> u64 {
    let mut slots = self.slots.lock();
    let retired = slots.retired.get(fingerprint).copied().unwrap_or(0);
    let entry = slots
      .entries
      .entry(fingerprint.clone())
      .or_insert_with(|| CacheEntry {
        value: None,
        tags: tags.clone(),
        created_at: Utc::now(),
        expires_at: None,
        state: EntryState::Revalidating,
        version: retired,
        last_error: None,
      });
    entry.state = EntryState::Revalidating;
    let entry = entry.clone();
    self.write_through(fingerprint, &entry);
    entry.version
  }

  pub fn remove(&self, fingerprint: &Fingerprint) -> Option<CacheEntry<V>> {
    let mut slots = self.slots.lock();
    let removed = slots.entries.remove(fingerprint)?;
    slots.retired.insert(fingerprint.clone(), removed.version);
    if let Err(e) = self.storage.forget(fingerprint) {
      tracing::warn!(%fingerprint, error = %e, "failed to remove persisted entry");
    }
    Some(removed)
  }

  /// Fingerprints of every entry carrying `tag`.
  pub fn keys_with_tag(&self, tag: &str) -> Vec<Fingerprint> {
    self
      .slots
      .lock()
      .entries
      .iter()
      .filter(|(_, e)| e.has_tag(tag))
      .map(|(fp, _)| fp.clone())
      .collect()
  }

  pub fn fingerprints(&self) -> Vec<Fingerprint> {
    self.slots.lock().entries.keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.slots.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Load entries from the persistence hook. Entries restored mid-revalidation become
  /// `Stale`, since no fetch survives a restart.
  pub fn restore(&self) -> color_eyre::Result<Vec<(Fingerprint, CacheEntry<V>)>> {
    let restored = self.storage.restore()?;
    let mut slots = self.slots.lock();
    let mut loaded = Vec::with_capacity(restored.len());
    for (fingerprint, mut entry) in restored {
      if entry.state == EntryState::Revalidating {
        entry.state = EntryState::Stale;
      }
      slots.entries.insert(fingerprint.clone(), entry.clone());
      loaded.push((fingerprint, entry));
    }
    Ok(loaded)
  }

  fn write_through(&self, fingerprint: &Fingerprint, entry: &CacheEntry<V>) {
    if let Err(e) = self.storage.persist(fingerprint, entry) {
      tracing::warn!(%fingerprint, error = %e, "failed to persist entry");
    }
  }
}

impl<V: Clone + 'static> Default for EntryStore<V> {
  fn default() -> Self {
    Self::new()
  }
}
