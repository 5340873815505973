//! Image store trait and SQLite implementation.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};

use super::record::{CachedImage, ImageMeta};
use crate::db::{LazyDatabase, Location, Schema};

/// Trait for image store backends.
pub trait ImageStore: Send + Sync {
  /// Get a live record and refresh its access time. Expired records are deleted.
  fn get(&self, id: &str) -> Result<Option<CachedImage>>;

  /// Insert or wholesale replace a record.
  fn put(&self, image: &CachedImage) -> Result<()>;

  /// Remove one record. Returns whether it existed.
  fn delete(&self, id: &str) -> Result<bool>;

  /// Records grouped under a playlist, most recently accessed first.
  fn list_by_playlist(&self, playlist_id: &str) -> Result<Vec<ImageMeta>>;

  /// All records, least recently accessed first.
  fn list_by_last_accessed(&self) -> Result<Vec<ImageMeta>>;

  /// Delete every expired record.
  fn purge_expired(&self) -> Result<usize>;

  fn count(&self) -> Result<usize>;

  /// Trim the store down to the `keep` most recently accessed records.
  fn evict_least_recently_used(&self, keep: usize) -> Result<usize> {
    let all = self.list_by_last_accessed()?;
    let excess = all.len().saturating_sub(keep);
    let mut removed = 0;
    for meta in all.into_iter().take(excess) {
      if self.delete(&meta.id)? {
        removed += 1;
      }
    }
    Ok(removed)
  }
}

/// Image store that doesn't keep anything.
/// Used when the image store is disabled - every lookup misses.
pub struct NoopImageStore;

impl ImageStore for NoopImageStore {
  fn get(&self, _id: &str) -> Result<Option<CachedImage>> {
    Ok(None) // Always miss
  }

  fn put(&self, _image: &CachedImage) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _id: &str) -> Result<bool> {
    Ok(false)
  }

  fn list_by_playlist(&self, _playlist_id: &str) -> Result<Vec<ImageMeta>> {
    Ok(Vec::new())
  }

  fn list_by_last_accessed(&self) -> Result<Vec<ImageMeta>> {
    Ok(Vec::new())
  }

  fn purge_expired(&self) -> Result<usize> {
    Ok(0)
  }

  fn count(&self) -> Result<usize> {
    Ok(0)
  }
}

/// Schema for the image store.
const IMAGE_SCHEMA: Schema = Schema {
  name: "images",
  version: 1,
  ddl: r#"
CREATE TABLE IF NOT EXISTS images (
    id TEXT PRIMARY KEY,
    blob BLOB NOT NULL,
    mime_type TEXT NOT NULL,
    playlist_id TEXT,
    last_accessed_at INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS by_playlist ON images(playlist_id);
CREATE INDEX IF NOT EXISTS by_last_accessed ON images(last_accessed_at);
"#,
};

const META_COLUMNS: &str =
  "id, mime_type, playlist_id, length(blob), last_accessed_at, expires_at";

/// SQLite-based image store, opened lazily on first use.
pub struct SqliteImageStore {
  db: LazyDatabase,
}

impl SqliteImageStore {
  pub fn new(location: Location) -> Self {
    Self {
      db: LazyDatabase::new(location, IMAGE_SCHEMA),
    }
  }

  pub fn in_memory() -> Self {
    Self::new(Location::Memory)
  }
}

impl ImageStore for SqliteImageStore {
  fn get(&self, id: &str) -> Result<Option<CachedImage>> {
    let mut conn = self.db.get()?.conn()?;
    // Read and touch in one transaction so concurrent touches can't lose updates
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let row = tx
      .query_row(
        "SELECT blob, mime_type, playlist_id, last_accessed_at, expires_at
         FROM images WHERE id = ?",
        params![id],
        |row| {
          Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, Option<i64>>(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read image {}: {}", id, e))?;

    let Some((blob, mime_type, playlist_id, last_accessed, expires)) = row else {
      return Ok(None);
    };

    let now = Utc::now();
    let expires_at = expires.map(from_millis).transpose()?;
    if expires_at.is_some_and(|at| at <= now) {
      tx.execute("DELETE FROM images WHERE id = ?", params![id])
        .map_err(|e| eyre!("Failed to purge expired image {}: {}", id, e))?;
      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
      tracing::debug!(id, "expired image purged on read");
      return Ok(None);
    }

    // Strictly increasing even when two touches land in the same millisecond
    let touched = now.timestamp_millis().max(last_accessed + 1);
    tx.execute(
      "UPDATE images SET last_accessed_at = ? WHERE id = ?",
      params![touched, id],
    )
    .map_err(|e| eyre!("Failed to touch image {}: {}", id, e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(Some(CachedImage {
      id: id.to_string(),
      blob: Bytes::from(blob),
      mime_type,
      playlist_id,
      last_accessed_at: from_millis(touched)?,
      expires_at,
    }))
  }

  fn put(&self, image: &CachedImage) -> Result<()> {
    let conn = self.db.get()?.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO images (id, blob, mime_type, playlist_id, last_accessed_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          image.id,
          image.blob.as_ref(),
          image.mime_type,
          image.playlist_id,
          image.last_accessed_at.timestamp_millis(),
          image.expires_at.map(|at| at.timestamp_millis()),
        ],
      )
      .map_err(|e| eyre!("Failed to store image {}: {}", image.id, e))?;
    Ok(())
  }

  fn delete(&self, id: &str) -> Result<bool> {
    let conn = self.db.get()?.conn()?;
    let deleted = conn
      .execute("DELETE FROM images WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete image {}: {}", id, e))?;
    Ok(deleted > 0)
  }

  fn list_by_playlist(&self, playlist_id: &str) -> Result<Vec<ImageMeta>> {
    let conn = self.db.get()?.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {META_COLUMNS} FROM images
         WHERE playlist_id = ? ORDER BY last_accessed_at DESC"
      ))
      .map_err(|e| eyre!("Failed to prepare playlist scan: {}", e))?;

    let rows = stmt
      .query_map(params![playlist_id], read_meta)
      .map_err(|e| eyre!("Failed to scan playlist {}: {}", playlist_id, e))?;
    collect_meta(rows)
  }

  fn list_by_last_accessed(&self) -> Result<Vec<ImageMeta>> {
    let conn = self.db.get()?.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {META_COLUMNS} FROM images
         ORDER BY last_accessed_at ASC"
      ))
      .map_err(|e| eyre!("Failed to prepare access scan: {}", e))?;

    let rows = stmt
      .query_map([], read_meta)
      .map_err(|e| eyre!("Failed to scan images: {}", e))?;
    collect_meta(rows)
  }

  fn purge_expired(&self) -> Result<usize> {
    let conn = self.db.get()?.conn()?;
    let purged = conn
      .execute(
        "DELETE FROM images WHERE expires_at IS NOT NULL AND expires_at <= ?",
        params![Utc::now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to purge expired images: {}", e))?;
    Ok(purged)
  }

  fn count(&self) -> Result<usize> {
    let conn = self.db.get()?.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count images: {}", e))?;
    Ok(count as usize)
  }
}

type RawMeta = (String, String, Option<String>, i64, i64, Option<i64>);

fn read_meta(row: &Row<'_>) -> rusqlite::Result<RawMeta> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn collect_meta(
  rows: impl Iterator<Item = rusqlite::Result<RawMeta>>,
) -> Result<Vec<ImageMeta>> {
  let mut out = Vec::new();
  for row in rows {
    let (id, mime_type, playlist_id, size, last_accessed, expires) =
      row.map_err(|e| eyre!("Failed to read image row: {}", e))?;
    out.push(ImageMeta {
      id,
      mime_type,
      playlist_id,
      size: size.max(0) as u64,
      last_accessed_at: from_millis(last_accessed)?,
      expires_at: expires.map(from_millis).transpose()?,
    });
  }
  Ok(out)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| eyre!("Invalid timestamp {}", ms))
}
