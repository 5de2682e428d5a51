//! Content-addressed cache of derived artifacts.
//!
//! Pipeline outputs and copies of source files land in
//! `<kind>s/cache/<stem>_<hash>.<ext>`, where the hash is the SHA-256 of the
//! file's own bytes. Files are immutable once they have been renamed into
//! place; everything mutable (access counters, validity, dependencies) lives
//! in an index kept as a metadata store at
//! `caches/metadata/caches_metadata.json`.
//!
//! The cache is not the source of truth. Deleting it loses nothing but
//! derived files that the pipeline can produce again.

mod entry;
pub mod error;
mod store;

pub use crate::entry::{AccessBucket, CacheEntry, CacheStats, CacheValidation};
pub use crate::store::CacheStore;

/// Kind under which the index itself is stored.
pub const INDEX_KIND: &str = "cache";
