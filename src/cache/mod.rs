//! Generic response cache organised in versioned namespaces.
//!
//! This module is the equivalent of a browser Cache API:
//! - One namespace per content class (static assets, dynamic/API, images)
//! - Exact request matching, entries kept in insertion order
//! - Cache-first, network-first and stale-while-revalidate strategies

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheSource, Served};
