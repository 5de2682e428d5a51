//! Storage primitives for the asset tree.
//!
//! Everything that touches bytes on disk goes through here: the
//! [`StorageBackend`] abstraction rooted at the asset directory, path
//! validation, the on-disk layout helpers and the [`HashIndex`] that keeps
//! SHA-256 digests of artifact files.

pub mod backend;
pub mod error;
pub mod file;
pub mod hash;
pub mod layout;
mod path;

pub use crate::backend::{LocalBackend, StorageBackend};
pub use crate::file::FileInfo;
pub use crate::hash::HashIndex;
pub use crate::path::{temporary_sibling, validate as validate_path};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
