//! Album catalog indexing for photo libraries.
//!
//! A crawl ([`scan::find_albums_for_user`]) walks each user's root directories breadth
//! first and mirrors every directory holding media as an album row. The
//! [`watcher::FsWatcher`] then keeps the catalog current from filesystem notifications,
//! one path at a time.

pub mod album_tree;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod ignore_rules;
pub mod jobs;
pub mod media_type;
pub mod models;
pub mod scan;
pub mod scan_cache;
pub mod schema;
pub mod watcher;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
