//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::types::{CacheSummary, CachedEntry, CachedResponse, RequestKey};

/// Trait for named cache store backends.
///
/// A backend holds any number of named stores (generations). Entries are
/// keyed by request identity and only ever written in whole batches.
pub trait CacheStorage: Send + Sync {
  /// Look up a single request in the named store.
  fn match_entry(&self, cache_name: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Create the named store if absent and write all entries atomically.
  /// Either every entry is stored or none is.
  fn put_all(&self, cache_name: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()>;

  /// Whether the named store exists.
  fn has_cache(&self, cache_name: &str) -> Result<bool>;

  /// List every named store with its entry count.
  fn cache_names(&self) -> Result<Vec<CacheSummary>>;

  /// Delete a named store and all its entries. Returns false if it did not exist.
  fn delete_cache(&self, cache_name: &str) -> Result<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway database that lives only as long as this value.
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

    Ok(data_dir.join("caseificio").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per named store (cache generation)
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Captured responses keyed by request identity
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_name ON cache_entries(cache_name);
"#;

impl CacheStorage for SqliteStorage {
  fn match_entry(&self, cache_name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![cache_name, key.cache_hash()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", key, cache_name, e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntry {
          response: CachedResponse::new(status, headers, body),
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_all(&self, cache_name: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    let mut conn = self.lock()?;

    // Rolled back on drop unless committed
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_stores (name, created_at) VALUES (?, datetime('now'))",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to create cache {}: {}", cache_name, e))?;

    for (key, response) in entries {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers for {}: {}", key, e))?;

      tx.execute(
        "INSERT OR REPLACE INTO cache_entries
           (cache_name, key_hash, method, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          cache_name,
          key.cache_hash(),
          key.method,
          key.url,
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn has_cache(&self, cache_name: &str) -> Result<bool> {
    let conn = self.lock()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", cache_name, e))?;

    Ok(found.is_some())
  }

  fn cache_names(&self) -> Result<Vec<CacheSummary>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT s.name, s.created_at, COUNT(e.key_hash) FROM cache_stores s
         LEFT JOIN cache_entries e ON e.cache_name = s.name
         GROUP BY s.name
         ORDER BY s.created_at, s.name",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, i64)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read cache row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, created_at, entries)| {
        Ok(CacheSummary {
          name,
          entries: entries.max(0) as usize,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }

  fn delete_cache(&self, cache_name: &str) -> Result<bool> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", cache_name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![cache_name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(status: u16, body: &str) -> CachedResponse {
    CachedResponse::new(
      status,
      vec![("content-type".to_string(), "text/html".to_string())],
      body.as_bytes().to_vec(),
    )
  }

  #[test]
  fn test_put_all_then_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let entries = vec![
      (RequestKey::get("/"), response(200, "home")),
      (RequestKey::get("/formaggi"), response(200, "formaggi")),
    ];

    storage.put_all("caseificio-v1", &entries).unwrap();

    let entry = storage
      .match_entry("caseificio-v1", &RequestKey::get("/formaggi"))
      .unwrap()
      .unwrap();
    assert_eq!(entry.response, response(200, "formaggi"));
    assert!(storage.has_cache("caseificio-v1").unwrap());
  }

  #[test]
  fn test_match_is_scoped_to_cache_name_and_method() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put_all("caseificio-v1", &[(RequestKey::get("/"), response(200, "home"))])
      .unwrap();

    assert!(storage
      .match_entry("caseificio-v2", &RequestKey::get("/"))
      .unwrap()
      .is_none());
    assert!(storage
      .match_entry("caseificio-v1", &RequestKey::new("POST", "/"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_missing_cache() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert!(!storage.has_cache("caseificio-v1").unwrap());
    assert!(storage.cache_names().unwrap().is_empty());
    assert!(!storage.delete_cache("caseificio-v1").unwrap());
  }

  #[test]
  fn test_put_all_with_no_entries_creates_store() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put_all("caseificio-v1", &[]).unwrap();

    let caches = storage.cache_names().unwrap();
    assert_eq!(caches.len(), 1);
    assert_eq!(caches[0].name, "caseificio-v1");
    assert_eq!(caches[0].entries, 0);
  }

  #[test]
  fn test_put_all_adds_to_existing_store() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put_all("caseificio-v1", &[(RequestKey::get("/"), response(200, "old"))])
      .unwrap();
    storage
      .put_all(
        "caseificio-v1",
        &[
          (RequestKey::get("/"), response(200, "new")),
          (RequestKey::get("/calendario"), response(200, "calendario")),
        ],
      )
      .unwrap();

    let root = storage
      .match_entry("caseificio-v1", &RequestKey::get("/"))
      .unwrap()
      .unwrap();
    assert_eq!(root.response.body, b"new");
    assert_eq!(storage.cache_names().unwrap()[0].entries, 2);
  }

  #[test]
  fn test_cache_names_counts_entries_per_store() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put_all("caseificio-v1", &[(RequestKey::get("/"), response(200, "a"))])
      .unwrap();
    storage
      .put_all(
        "caseificio-v2",
        &[
          (RequestKey::get("/"), response(200, "b")),
          (RequestKey::get("/statistiche"), response(200, "c")),
        ],
      )
      .unwrap();

    let mut caches = storage.cache_names().unwrap();
    caches.sort_by(|a, b| a.name.cmp(&b.name));
    let counts: Vec<(&str, usize)> = caches
      .iter()
      .map(|c| (c.name.as_str(), c.entries))
      .collect();
    assert_eq!(counts, vec![("caseificio-v1", 1), ("caseificio-v2", 2)]);
  }

  #[test]
  fn test_delete_cache_removes_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put_all("caseificio-v1", &[(RequestKey::get("/"), response(200, "a"))])
      .unwrap();

    assert!(storage.delete_cache("caseificio-v1").unwrap());
    assert!(!storage.has_cache("caseificio-v1").unwrap());
    assert!(storage
      .match_entry("caseificio-v1", &RequestKey::get("/"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_open_creates_parent_directory() {
    let dir = std::env::temp_dir().join(format!("caseificio-test-{}", std::process::id()));
    let path = dir.join("nested").join("cache.db");

    let storage = SqliteStorage::open(&path).unwrap();
    storage
      .put_all("caseificio-v1", &[(RequestKey::get("/"), response(200, "a"))])
      .unwrap();
    drop(storage);

    let reopened = SqliteStorage::open(&path).unwrap();
    assert!(reopened.has_cache("caseificio-v1").unwrap());

    let _ = std::fs::remove_dir_all(&dir);
  }

  #[test]
  fn test_parse_datetime() {
    let dt = parse_datetime("2024-05-01 08:30:00").unwrap();
    assert_eq!(dt.to_rfc3339(), "2024-05-01T08:30:00+00:00");
    assert!(parse_datetime("not a date").is_err());
  }
}
