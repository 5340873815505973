//! Offline resilience layer for the slideshow client.
//!
//! Read requests go through a tiered [`interceptor::FetchInterceptor`]
//! (image store, response namespaces, network). Mutations go through the
//! durable [`queue::OfflineQueue`], drained when [`connectivity`] reports the
//! client back online. [`app::OfflineContext`] wires everything together.

pub mod app;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod http;
pub mod images;
pub mod interceptor;
pub mod lifecycle;
pub mod prefetch;
pub mod queue;

#[cfg(test)]
mod testing;
