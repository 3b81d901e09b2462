//! Bucket storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CachedEntry, RequestKey};
use crate::net::Response;

/// Trait for cache storage backends.
///
/// A backend holds any number of named buckets, each mapping request keys to
/// stored responses. Buckets are created on first write.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the bucket if it doesn't exist yet.
  #[cfg(test)]
  fn open(&self, bucket: &str) -> Result<()>;

  /// Whether a bucket with this name exists.
  fn has(&self, bucket: &str) -> Result<bool>;

  /// Names of all buckets, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a bucket and all its entries. Returns false if it didn't exist.
  fn delete(&self, bucket: &str) -> Result<bool>;

  /// Store a response, replacing any previous entry for the key.
  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store several responses atomically: either all are written or none.
  fn put_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Look up the stored response for a key.
  fn match_entry(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Keys stored in a bucket, in insertion order.
  fn entry_keys(&self, bucket: &str) -> Result<Vec<RequestKey>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the storage at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as this value.
  #[cfg(test)]
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

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per stored response, keyed by sha256("<METHOD> <url>")
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, key_hash),
    FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
);
"#;

fn ensure_bucket(conn: &Connection, bucket: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to create bucket {}: {}", bucket, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
  if response.is_partial() {
    return Err(eyre!("Refusing to store partial response for {}", key));
  }

  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (bucket, key_hash, method, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        bucket,
        key.cache_hash(),
        key.method(),
        key.url(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  #[cfg(test)]
  fn open(&self, bucket: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_bucket(&conn, bucket)
  }

  fn has(&self, bucket: &str) -> Result<bool> {
    let conn = self.lock()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM buckets WHERE name = ?",
        params![bucket],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up bucket {}: {}", bucket, e))?;

    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, bucket: &str) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    Ok(removed > 0)
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    ensure_bucket(&conn, bucket)?;
    insert_entry(&conn, bucket, key, response)
  }

  fn put_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.lock()?;

    // Dropping the transaction without commit rolls everything back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_bucket(&tx, bucket)?;
    for (key, response) in entries {
      insert_entry(&tx, bucket, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_entry(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM entries
         WHERE bucket = ? AND key_hash = ?",
        params![bucket, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
          },
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn entry_keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE bucket = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![bucket], |row| {
        Ok(RequestKey::from_parts(row.get(0)?, row.get(1)?))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", bucket, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry key: {}", e))?;

    Ok(keys)
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

  fn key(url: &str) -> RequestKey {
    RequestKey::from_parts("GET".to_string(), url.to_string())
  }

  fn html(body: &str) -> Response {
    Response {
      status: 200,
      headers: vec![("content-type".to_string(), "text/html".to_string())],
      body: body.as_bytes().to_vec(),
    }
  }

  #[test]
  fn test_put_then_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put("v1", &key("https://app.test/"), &html("home"))
      .unwrap();

    let entry = storage
      .match_entry("v1", &key("https://app.test/"))
      .unwrap()
      .unwrap();
    assert_eq!(entry.response, html("home"));
  }

  #[test]
  fn test_put_creates_bucket_lazily() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert!(!storage.has("v1").unwrap());

    storage
      .put("v1", &key("https://app.test/"), &html("home"))
      .unwrap();
    assert!(storage.has("v1").unwrap());
  }

  #[test]
  fn test_put_overwrites_existing_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("https://app.test/"), &html("old")).unwrap();
    storage.put("v1", &key("https://app.test/"), &html("new")).unwrap();

    let entry = storage.match_entry("v1", &key("https://app.test/")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"new");
    assert_eq!(storage.entry_keys("v1").unwrap().len(), 1);
  }

  #[test]
  fn test_match_is_scoped_to_bucket() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("https://app.test/"), &html("home")).unwrap();
    storage.open("v2").unwrap();

    assert!(storage.match_entry("v2", &key("https://app.test/")).unwrap().is_none());
    assert!(storage.match_entry("missing", &key("https://app.test/")).unwrap().is_none());
  }

  #[test]
  fn test_keys_in_creation_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("b").unwrap();
    storage.open("a").unwrap();
    storage.open("b").unwrap();

    assert_eq!(storage.keys().unwrap(), vec!["b".to_string(), "a".to_string()]);
  }

  #[test]
  fn test_delete_removes_bucket_and_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("https://app.test/"), &html("home")).unwrap();

    assert!(storage.delete("v1").unwrap());
    assert!(!storage.has("v1").unwrap());
    assert!(storage.entry_keys("v1").unwrap().is_empty());

    // Recreating the bucket doesn't resurrect old entries
    storage.open("v1").unwrap();
    assert!(storage.match_entry("v1", &key("https://app.test/")).unwrap().is_none());

    assert!(!storage.delete("never-existed").unwrap());
  }

  #[test]
  fn test_put_all_is_atomic() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let entries = vec![
      (key("https://app.test/"), html("home")),
      (key("https://app.test/video"), Response::new(206, "partial")),
    ];

    assert!(storage.put_all("v1", &entries).is_err());
    assert!(!storage.has("v1").unwrap());
    assert!(storage.match_entry("v1", &key("https://app.test/")).unwrap().is_none());
  }

  #[test]
  fn test_put_all_stores_every_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let entries = vec![
      (key("https://app.test/"), html("home")),
      (key("https://app.test/index.html"), html("index")),
    ];

    storage.put_all("v1", &entries).unwrap();

    let keys = storage.entry_keys("v1").unwrap();
    assert_eq!(keys, vec![key("https://app.test/"), key("https://app.test/index.html")]);
  }

  #[test]
  fn test_put_refuses_partial_response() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let result = storage.put("v1", &key("https://app.test/video"), &Response::new(206, "x"));
    assert!(result.is_err());
  }

  #[test]
  fn test_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.put("v1", &key("https://app.test/"), &html("home")).unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["v1".to_string()]);
    let entry = storage.match_entry("v1", &key("https://app.test/")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"home");
  }

  #[test]
  fn test_parse_datetime() {
    let dt = parse_datetime("2024-03-01 12:30:45").unwrap();
    assert_eq!(dt.to_rfc3339(), "2024-03-01T12:30:45+00:00");
    assert!(parse_datetime("yesterday").is_err());
  }
}
