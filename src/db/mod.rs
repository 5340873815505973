//! SQLite connection wrapper shared by the persistent stores.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Where a store keeps its data.
#[derive(Debug, Clone)]
pub enum Location {
  File(PathBuf),
  Memory,
}

impl Location {
  pub fn file(dir: &Path, name: &str) -> Self {
    Location::File(dir.join(name))
  }
}

/// A versioned schema. The DDL runs once, when `PRAGMA user_version` is below `version`.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
  pub name: &'static str,
  pub version: i32,
  pub ddl: &'static str,
}

/// Database connection wrapper
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database and bring its schema up to date
  pub fn open(location: &Location, schema: &Schema) -> Result<Self> {
    let conn = match location {
      Location::File(path) => {
        if let Some(parent) = path.parent() {
          std::fs::create_dir_all(parent)
            .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
        }
        Connection::open(path)
          .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?
      }
      Location::Memory => Connection::open_in_memory()
        .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?,
    };

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations(schema)?;

    Ok(db)
  }

  /// Apply the schema if the stored version is older
  fn run_migrations(&self, schema: &Schema) -> Result<()> {
    let conn = self.conn()?;

    let current: i32 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read {} schema version: {}", schema.name, e))?;

    if current >= schema.version {
      return Ok(());
    }

    conn
      .execute_batch(schema.ddl)
      .map_err(|e| eyre!("Failed to run {} migrations: {}", schema.name, e))?;
    conn
      .execute_batch(&format!("PRAGMA user_version = {}", schema.version))
      .map_err(|e| eyre!("Failed to record {} schema version: {}", schema.name, e))?;

    tracing::debug!(store = schema.name, version = schema.version, "schema created");
    Ok(())
  }

  /// Lock the connection
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// A database that is opened on first use.
pub struct LazyDatabase {
  location: Location,
  schema: Schema,
  db: OnceLock<Database>,
}

impl LazyDatabase {
  pub fn new(location: Location, schema: Schema) -> Self {
    Self {
      location,
      schema,
      db: OnceLock::new(),
    }
  }

  /// Get the database, opening it if this is the first access.
  pub fn get(&self) -> Result<&Database> {
    if let Some(db) = self.db.get() {
      return Ok(db);
    }
    let opened = Database::open(&self.location, &self.schema)?;
    Ok(self.db.get_or_init(|| opened))
  }

  pub fn is_open(&self) -> bool {
    self.db.get().is_some()
  }
}
