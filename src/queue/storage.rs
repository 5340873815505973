//! Durable storage for the action queue: one key holding the whole queue.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

use super::action::OfflineAction;
use crate::db::{Database, Location, Schema};

/// Fixed key under which the serialized queue lives.
pub const QUEUE_KEY: &str = "offline_actions_queue";

/// Trait for queue persistence backends.
pub trait QueueStorage: Send + Sync {
  /// Load every stored action. Unreadable data yields an empty queue.
  fn load(&self) -> Result<Vec<OfflineAction>>;

  /// Replace the stored queue.
  fn save(&self, actions: &[OfflineAction]) -> Result<()>;
}

const QUEUE_SCHEMA: Schema = Schema {
  name: "queue",
  version: 1,
  ddl: r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#,
};

/// SQLite-backed key-value storage.
pub struct SqliteQueueStorage {
  db: Database,
}

impl SqliteQueueStorage {
  pub fn open_at(location: &Location) -> Result<Self> {
    Ok(Self {
      db: Database::open(location, &QUEUE_SCHEMA)?,
    })
  }

  pub fn in_memory() -> Result<Self> {
    Self::open_at(&Location::Memory)
  }

  fn read_raw(&self) -> Result<Option<String>> {
    let conn = self.db.conn()?;
    conn
      .query_row(
        "SELECT value FROM kv WHERE key = ?",
        params![QUEUE_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queue: {}", e))
  }

  #[cfg(test)]
  fn write_raw(&self, value: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
        params![QUEUE_KEY, value],
      )
      .map_err(|e| eyre!("Failed to write queue: {}", e))?;
    Ok(())
  }
}

impl QueueStorage for SqliteQueueStorage {
  fn load(&self) -> Result<Vec<OfflineAction>> {
    let Some(raw) = self.read_raw()? else {
      return Ok(Vec::new());
    };

    match serde_json::from_str(&raw) {
      Ok(actions) => Ok(actions),
      Err(e) => {
        tracing::warn!(error = %e, "stored queue is unreadable, starting empty");
        Ok(Vec::new())
      }
    }
  }

  fn save(&self, actions: &[OfflineAction]) -> Result<()> {
    let value =
      serde_json::to_string(actions).map_err(|e| eyre!("Failed to serialize queue: {}", e))?;

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![QUEUE_KEY, value],
      )
      .map_err(|e| eyre!("Failed to write queue: {}", e))?;
    Ok(())
  }
}
