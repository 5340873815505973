//! Response namespace storage trait and SQLite implementation.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::db::{Database, Location, Schema};
use crate::http::Response;

/// Trait for response cache backends.
///
/// Entries are grouped into named namespaces and kept in insertion order.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if it doesn't exist yet.
  fn open(&self, namespace: &str) -> Result<()>;

  /// Names of every existing namespace, oldest first.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Drop a namespace and all of its entries. Returns whether it existed.
  fn delete_namespace(&self, namespace: &str) -> Result<bool>;

  /// Exact match for a request key within one namespace.
  fn match_request(&self, namespace: &str, request_key: &str) -> Result<Option<Response>>;

  /// Exact match for a request key in any namespace.
  fn match_any(&self, request_key: &str) -> Result<Option<Response>>;

  /// Store a response, replacing any previous entry for the same key.
  fn put(&self, namespace: &str, request_key: &str, response: &Response) -> Result<()>;

  /// Request keys of a namespace, oldest insertion first.
  fn keys(&self, namespace: &str) -> Result<Vec<String>>;

  /// Remove the given keys from a namespace.
  fn delete_entries(&self, namespace: &str, request_keys: &[String]) -> Result<usize>;

  fn entry_count(&self, namespace: &str) -> Result<usize>;
}

/// Schema for the response cache.
const RESPONSE_SCHEMA: Schema = Schema {
  name: "responses",
  version: 1,
  ddl: r#"
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- seq doubles as insertion order for eviction
CREATE TABLE IF NOT EXISTS entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (namespace, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_namespace ON entries(namespace, seq);
"#,
};

/// SQLite-based response cache.
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn open_at(location: &Location) -> Result<Self> {
    Ok(Self {
      db: Database::open(location, &RESPONSE_SCHEMA)?,
    })
  }

  pub fn in_memory() -> Result<Self> {
    Self::open_at(&Location::Memory)
  }
}

impl CacheStorage for SqliteStorage {
  fn open(&self, namespace: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM namespaces ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace: {}", e))?;
    Ok(names)
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE namespace = ?", params![namespace])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", namespace, e))?;
    let deleted = tx
      .execute("DELETE FROM namespaces WHERE name = ?", params![namespace])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", namespace, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(deleted > 0)
  }

  fn match_request(&self, namespace: &str, request_key: &str) -> Result<Option<Response>> {
    let conn = self.db.conn()?;
    let row = conn
      .query_row(
        "SELECT status, headers, body FROM entries WHERE namespace = ? AND request_hash = ?",
        params![namespace, request_hash(request_key)],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {}: {}", request_key, e))?;

    Ok(row.and_then(|(status, headers, body)| decode_entry(request_key, status, &headers, body)))
  }

  fn match_any(&self, request_key: &str) -> Result<Option<Response>> {
    let conn = self.db.conn()?;
    let row = conn
      .query_row(
        "SELECT e.status, e.headers, e.body FROM entries e
         INNER JOIN namespaces n ON n.name = e.namespace
         WHERE e.request_hash = ?
         ORDER BY n.rowid
         LIMIT 1",
        params![request_hash(request_key)],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {}: {}", request_key, e))?;

    Ok(row.and_then(|(status, headers, body)| decode_entry(request_key, status, &headers, body)))
  }

  fn put(&self, namespace: &str, request_key: &str, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;

    // REPLACE re-inserts, so a refreshed entry moves to the back of the eviction order
    tx.execute(
      "INSERT OR REPLACE INTO entries (namespace, request_hash, request_key, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        namespace,
        request_hash(request_key),
        request_key,
        response.status,
        headers,
        response.body.as_ref(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", request_key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn keys(&self, namespace: &str) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT request_key FROM entries WHERE namespace = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![namespace], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", namespace, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;
    Ok(keys)
  }

  fn delete_entries(&self, namespace: &str, request_keys: &[String]) -> Result<usize> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut deleted = 0;
    for key in request_keys {
      deleted += tx
        .execute(
          "DELETE FROM entries WHERE namespace = ? AND request_hash = ?",
          params![namespace, request_hash(key)],
        )
        .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(deleted)
  }

  fn entry_count(&self, namespace: &str) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", namespace, e))?;
    Ok(count as usize)
  }
}

type RawEntry = (u16, String, Vec<u8>);

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

/// SHA256 of the request key, for stable fixed-length lookups.
fn request_hash(request_key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request_key.as_bytes());
  hex::encode(hasher.finalize())
}

/// Rebuild a response. An unreadable entry is logged and treated as a miss.
fn decode_entry(request_key: &str, status: u16, headers: &str, body: Vec<u8>) -> Option<Response> {
  match serde_json::from_str::<BTreeMap<String, String>>(headers) {
    Ok(headers) => Some(Response {
      status,
      headers,
      body: Bytes::from(body),
    }),
    Err(e) => {
      tracing::warn!(request = request_key, error = %e, "unreadable cache entry, treating as miss");
      None
    }
  }
}
