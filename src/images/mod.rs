//! Content-addressable image store.
//!
//! Maps an image identifier (extracted from the resource path) to its binary
//! payload plus access metadata. Reads refresh `last_accessed_at`, so the
//! store can be trimmed in LRU order independently of the HTTP response cache.

mod record;
mod storage;

pub use record::{CachedImage, ImageMeta};
pub use storage::{ImageStore, NoopImageStore, SqliteImageStore};
