//! Path validation and security utilities.
//!
//! Every relative path handed to a backend passes through [`validate`] so
//! that nothing can climb out of the asset root.

use crate::error::{ErrorKind, Result};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Validates a storage path relative to the asset root.
///
/// `..` is resolved lexically and may never pop past the root. Absolute
/// prefixes are stripped (the path is always treated as relative), null bytes
/// and Windows drive prefixes are rejected, and a path that normalizes to
/// nothing is invalid.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use wold_storage::validate_path;
/// assert!(validate_path("models/metadata/models_metadata.json").is_ok());
/// assert!(validate_path("textures/../models/cache").is_ok());
/// assert!(validate_path("../outside.json").is_err());
/// assert!(validate_path("a\0b").is_err());
/// assert_eq!(
///     validate_path("models/./cache//cube_lod0.glb/").unwrap(),
///     Path::new("models/cache/cube_lod0.glb")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let mut kept = Vec::new();
    for component in original.components() {
        match component {
            Component::Normal(segment) => {
                // Path::components() lets interior NULs through on Unix, and
                // the syscall layer would silently truncate at them.
                if segment.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(original.to_path_buf()));
                }
                kept.push(segment);
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(original.to_path_buf())),
            Component::ParentDir => {
                if kept.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(original.to_path_buf()));
                }
            },
        }
    }
    if kept.is_empty() {
        exn::bail!(ErrorKind::InvalidPath(original.to_path_buf()));
    }
    Ok(kept.into_iter().collect())
}

/// A hidden sibling of `path` to stage writes before renaming into place.
///
/// The name includes the process id and a process-wide counter, so two
/// writers in the same directory never collide on the staging file.
pub fn temporary_sibling(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let sequence = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{file_name}.{}.{sequence}.tmp", std::process::id()))
}
