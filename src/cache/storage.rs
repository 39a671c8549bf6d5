//! Generation store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{StorageError, StorageResult};
use crate::http::Response;

use super::traits::{CanonicalKey, GenerationId};

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// The stored response, exactly as received
  pub response: Response,
  /// When the entry was written (informational, never used for eviction)
  pub cached_at: DateTime<Utc>,
}

/// Summary of a stored generation.
#[derive(Debug, Clone)]
pub struct GenerationInfo {
  /// Storage name, e.g. `app-static-v1`
  pub name: String,
  pub label: String,
  pub version: String,
  pub entries: usize,
  pub created_at: DateTime<Utc>,
}

/// Trait for generation store backends.
///
/// Point reads and per-key upserts may run concurrently; the last writer on a key wins.
pub trait GenerationStore: Send + Sync + 'static {
  fn has_generation(&self, name: &str) -> StorageResult<bool>;

  /// All stored generations, by name.
  fn generations(&self) -> StorageResult<Vec<GenerationInfo>>;

  /// Look up one entry in one generation.
  fn get(&self, generation: &str, key: &CanonicalKey) -> StorageResult<Option<CachedEntry>>;

  /// Upsert one entry, creating the generation on first write.
  fn put(
    &self,
    generation: &GenerationId,
    key: &CanonicalKey,
    response: &Response,
  ) -> StorageResult<()>;

  /// Upsert a batch of entries atomically: either the generation and all entries are
  /// persisted, or nothing is.
  fn put_all(
    &self,
    generation: &GenerationId,
    entries: &[(CanonicalKey, Response)],
  ) -> StorageResult<()>;

  /// Keys stored in a generation.
  fn keys(&self, generation: &str) -> StorageResult<Vec<CanonicalKey>>;

  /// Delete a generation and all of its entries atomically.
  /// Returns whether the generation existed.
  fn delete_generation(&self, name: &str) -> StorageResult<bool>;
}

/// SQLite-based generation store.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> StorageResult<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| StorageError::Backend {
        message: format!("Failed to create cache directory: {}", e),
      })?;
    }

    let conn = Connection::open(&path).map_err(|e| StorageError::Backend {
      message: format!("Failed to open cache database at {}: {}", path.display(), e),
    })?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory store.
  #[cfg(test)]
  pub fn open_in_memory() -> StorageResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> StorageResult<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> StorageResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StorageError::Backend {
        message: "Could not determine data directory".to_string(),
      })?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  fn run_migrations(&self) -> StorageResult<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| StorageError::Backend {
        message: format!("Failed to run cache migrations: {}", e),
      })
  }

  fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| StorageError::Lock {
      message: e.to_string(),
    })
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    label TEXT NOT NULL,
    version TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_generation ON entries(generation);
"#;

const INSERT_GENERATION: &str = "INSERT OR IGNORE INTO generations (name, label, version, created_at)
   VALUES (?, ?, ?, datetime('now'))";

const UPSERT_ENTRY: &str =
  "INSERT OR REPLACE INTO entries (generation, key_hash, method, url, status, headers, body, cached_at)
   VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))";

fn insert_generation(conn: &Connection, generation: &GenerationId) -> StorageResult<()> {
  conn.execute(
    INSERT_GENERATION,
    params![generation.storage_name(), generation.name, generation.version],
  )?;
  Ok(())
}

fn upsert_entry(
  conn: &Connection,
  generation: &str,
  key: &CanonicalKey,
  response: &Response,
) -> StorageResult<()> {
  let headers = serde_json::to_string(&response.headers)?;
  conn.execute(
    UPSERT_ENTRY,
    params![
      generation,
      key.hash(),
      key.method(),
      key.url(),
      response.status,
      headers,
      response.body
    ],
  )?;
  Ok(())
}

impl GenerationStore for SqliteStorage {
  fn has_generation(&self, name: &str) -> StorageResult<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM generations WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.is_some())
  }

  fn generations(&self) -> StorageResult<Vec<GenerationInfo>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT g.name, g.label, g.version, g.created_at,
              (SELECT COUNT(*) FROM entries e WHERE e.generation = g.name)
       FROM generations g
       ORDER BY g.name",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, i64>(4)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(name, label, version, created_at, entries)| {
        Ok::<_, StorageError>(GenerationInfo {
          name,
          label,
          version,
          entries: entries as usize,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }

  fn get(&self, generation: &str, key: &CanonicalKey) -> StorageResult<Option<CachedEntry>> {
    let conn = self.lock()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE generation = ? AND key_hash = ?",
        params![generation, key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, cached_at)) => Ok(Some(CachedEntry {
        response: Response {
          status,
          headers: serde_json::from_str(&headers)?,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(
    &self,
    generation: &GenerationId,
    key: &CanonicalKey,
    response: &Response,
  ) -> StorageResult<()> {
    let conn = self.lock()?;
    insert_generation(&conn, generation)?;
    upsert_entry(&conn, &generation.storage_name(), key, response)
  }

  fn put_all(
    &self,
    generation: &GenerationId,
    entries: &[(CanonicalKey, Response)],
  ) -> StorageResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    insert_generation(&tx, generation)?;
    let name = generation.storage_name();
    for (key, response) in entries {
      upsert_entry(&tx, &name, key, response)?;
    }

    // Dropping the transaction on an early return rolls everything back
    tx.commit()?;
    Ok(())
  }

  fn keys(&self, generation: &str) -> StorageResult<Vec<CanonicalKey>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT method, url FROM entries WHERE generation = ? ORDER BY url, method",
    )?;

    let keys = stmt
      .query_map(params![generation], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })?
      .map(|r| r.map(|(method, url)| CanonicalKey::from_stored(method, url)))
      .collect::<Result<Vec<_>, _>>()?;

    Ok(keys)
  }

  fn delete_generation(&self, name: &str) -> StorageResult<bool> {
    let delete_failed = |e: rusqlite::Error| StorageError::GenerationDelete {
      name: name.to_string(),
      message: e.to_string(),
    };

    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(delete_failed)?;
    tx.execute("DELETE FROM entries WHERE generation = ?", params![name])
      .map_err(delete_failed)?;
    let removed = tx
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(delete_failed)?;
    tx.commit().map_err(delete_failed)?;

    Ok(removed > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> StorageResult<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StorageError::Serialization {
      message: format!("Failed to parse datetime '{}': {}", s, e),
    })
}
