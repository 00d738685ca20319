//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::sync::Arc;

use crate::db::Database;
use crate::net::{RequestKey, ResponseSnapshot};

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored snapshot
  pub response: ResponseSnapshot,
  /// When the snapshot was stored
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Each call is atomic on its own. Writes to one key are last-write-wins.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if it doesn't exist yet.
  fn open_partition(&self, name: &str) -> Result<()>;

  /// All partition names in creation order.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Delete a partition and everything in it. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Look up an entry in one partition.
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Look up an entry in any partition, oldest partition first.
  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store an entry, replacing any previous one under the same key.
  fn put(&self, partition: &str, key: &RequestKey, response: &ResponseSnapshot) -> Result<()>;

  /// Store several entries in one transaction; either all land or none do.
  fn put_all(&self, partition: &str, entries: &[(RequestKey, ResponseSnapshot)]) -> Result<()>;

  /// URLs stored in a partition.
  fn keys(&self, partition: &str) -> Result<Vec<String>>;

  /// Delete every partition not named in `keep`, then run `finish` inside the
  /// same transaction. If `finish` fails nothing is deleted. Returns the
  /// deleted names in creation order.
  fn retain_partitions<F>(&self, keep: &[&str], finish: F) -> Result<Vec<String>>
  where
    F: FnOnce(&Transaction<'_>) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn open_partition(&self, name: &str) -> Result<()> {
    self.db.with_conn(|conn| ensure_partition(conn, name))
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT name FROM partitions ORDER BY seq")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let names = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list partitions: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

      Ok(names)
    })
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    self.db.with_conn(|conn| {
      let tx = begin(conn)?;
      let removed = drop_partition(&tx, name)?;

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

      Ok(removed)
    })
  }

  fn retain_partitions<F>(&self, keep: &[&str], finish: F) -> Result<Vec<String>>
  where
    F: FnOnce(&Transaction<'_>) -> Result<()>,
  {
    self.db.with_conn(|conn| {
      let tx = begin(conn)?;

      let names = {
        let mut stmt = tx
          .prepare("SELECT name FROM partitions ORDER BY seq")
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
        let names = stmt
          .query_map([], |row| row.get::<_, String>(0))
          .map_err(|e| eyre!("Failed to list partitions: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read partition name: {}", e))?;
        names
      };

      let mut removed = Vec::new();
      for name in names {
        if !keep.contains(&name.as_str()) {
          drop_partition(&tx, &name)?;
          removed.push(name);
        }
      }

      finish(&tx)?;

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

      Ok(removed)
    })
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.db.with_conn(|conn| {
      let row = conn
        .query_row(
          "SELECT status, status_text, headers, body, cached_at FROM entries
           WHERE partition = ? AND request_key = ?",
          params![partition, key.cache_hash()],
          read_entry,
        )
        .optional()
        .map_err(|e| eyre!("Failed to read cache entry {}: {}", key.url(), e))?;

      row.map(decode_entry).transpose()
    })
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.db.with_conn(|conn| {
      let row = conn
        .query_row(
          "SELECT e.status, e.status_text, e.headers, e.body, e.cached_at FROM entries e
           INNER JOIN partitions p ON p.name = e.partition
           WHERE e.request_key = ?
           ORDER BY p.seq
           LIMIT 1",
          params![key.cache_hash()],
          read_entry,
        )
        .optional()
        .map_err(|e| eyre!("Failed to match cache entry {}: {}", key.url(), e))?;

      row.map(decode_entry).transpose()
    })
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &ResponseSnapshot) -> Result<()> {
    self.put_all(partition, &[(key.clone(), response.clone())])
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, ResponseSnapshot)]) -> Result<()> {
    self.db.with_conn(|conn| {
      let tx = begin(conn)?;
      ensure_partition(&tx, partition)?;

      for (key, response) in entries {
        let headers = serde_json::to_string(&response.headers)
          .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

        tx.execute(
          "INSERT OR REPLACE INTO entries (partition, request_key, url, status, status_text, headers, body, cached_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
          params![
            partition,
            key.cache_hash(),
            key.url(),
            response.status,
            response.status_text,
            headers,
            response.body
          ],
        )
        .map_err(|e| eyre!("Failed to store cache entry {}: {}", key.url(), e))?;
      }

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

      Ok(())
    })
  }

  fn keys(&self, partition: &str) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT url FROM entries WHERE partition = ? ORDER BY url")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let urls = stmt
        .query_map(params![partition], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read key: {}", e))?;

      Ok(urls)
    })
  }
}

type EntryRow = (u16, String, String, Vec<u8>, String);

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_entry((status, status_text, headers, body, cached_at): EntryRow) -> Result<CachedResponse> {
  let headers =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

  Ok(CachedResponse {
    response: ResponseSnapshot {
      status,
      status_text,
      headers,
      body,
    },
    cached_at: parse_datetime(&cached_at)?,
  })
}

fn begin(conn: &mut Connection) -> Result<Transaction<'_>> {
  conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin transaction: {}", e))
}

fn ensure_partition(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;

  Ok(())
}

fn drop_partition(conn: &Connection, name: &str) -> Result<bool> {
  conn
    .execute("DELETE FROM entries WHERE partition = ?", params![name])
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
  let removed = conn
    .execute("DELETE FROM partitions WHERE name = ?", params![name])
    .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

  Ok(removed > 0)
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
