//! Persistence hook trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::entry::CacheEntry;
use crate::fingerprint::Fingerprint;

/// Durable mirror of the entry store.
///
/// The engine writes through on every entry mutation and calls `restore` once at
/// construction. Failures are logged by the caller and never fail the in-memory operation.
pub trait CacheStorage<V>: Send + Sync {
  /// Store (or replace) an entry.
  fn persist(&self, fingerprint: &Fingerprint, entry: &CacheEntry<V>) -> Result<()>;

  /// Drop an entry.
  fn forget(&self, fingerprint: &Fingerprint) -> Result<()>;

  /// Load every stored entry.
  fn restore(&self) -> Result<Vec<(Fingerprint, CacheEntry<V>)>>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
#[derive(Debug, Default)]
pub struct NoopStorage;

impl<V> CacheStorage<V> for NoopStorage {
  fn persist(&self, _fingerprint: &Fingerprint, _entry: &CacheEntry<V>) -> Result<()> {
    Ok(()) // Discard
  }

  fn forget(&self, _fingerprint: &Fingerprint) -> Result<()> {
    Ok(())
  }

  fn restore(&self) -> Result<Vec<(Fingerprint, CacheEntry<V>)>> {
    Ok(Vec::new()) // Nothing stored
  }
}

/// SQLite-based cache storage implementation.
///
/// Entries are stored as JSON blobs, with state and version mirrored into columns so
/// the database can be inspected without decoding payloads.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Create a new SQLite storage at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Create a storage backed by a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("syncache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  /// Delete every stored entry. Returns the number of rows removed.
  pub fn clear(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM cache_entries", [])
      .map_err(|e| eyre!("Failed to clear cache entries: {}", e))
  }

  /// Number of stored entries.
  pub fn len(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;

    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    fingerprint TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    state TEXT NOT NULL,
    version INTEGER NOT NULL,
    persisted_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_state ON cache_entries(state);
"#;

impl<V> CacheStorage<V> for SqliteStorage
where
  V: Serialize + DeserializeOwned,
{
  fn persist(&self, fingerprint: &Fingerprint, entry: &CacheEntry<V>) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let data = serde_json::to_vec(entry).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (fingerprint, data, state, version, persisted_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![
          fingerprint.as_str(),
          data,
          entry.state.to_string(),
          entry.version as i64
        ],
      )
      .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    Ok(())
  }

  fn forget(&self, fingerprint: &Fingerprint) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE fingerprint = ?",
        params![fingerprint.as_str()],
      )
      .map_err(|e| eyre!("Failed to delete entry: {}", e))?;

    Ok(())
  }

  fn restore(&self) -> Result<Vec<(Fingerprint, CacheEntry<V>)>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT fingerprint, data FROM cache_entries ORDER BY fingerprint")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut entries = Vec::with_capacity(rows.len());
    for (fingerprint, data) in rows {
      // Skip rows written by an incompatible payload type rather than failing the restore
      match serde_json::from_slice::<CacheEntry<V>>(&data) {
        Ok(entry) => entries.push((Fingerprint::from_raw(fingerprint), entry)),
        Err(e) => tracing::warn!(%fingerprint, error = %e, "skipping undecodable cache entry"),
      }
    }

    Ok(entries)
  }
}
