//! On-disk layout of the asset tree.
//!
//! All paths here are relative to the asset root and are what gets handed to
//! a [`StorageBackend`](crate::StorageBackend):
//!
//! ```text
//! <kind>s/metadata/<kind>s_metadata.json   per-kind metadata store
//! <kind>s/cache/<stem>_<hash>.<ext>        content-addressed derived artifacts
//! <kind>s/data/<name>.json                 artifacts authored as JSON
//! logs/<type>_<name>.log                   rotating log files
//! ```

use std::path::{Path, PathBuf};

/// Length of a lowercase hex SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Directory name for a kind. Kinds ending in a consonant + `y` take `ies`
/// (`dependency` becomes `dependencies`), everything else gets an `s`.
pub fn plural(kind: &str) -> String {
    let mut chars = kind.chars().rev();
    match (chars.next(), chars.next()) {
        (Some('y'), Some(c)) if !"aeiou".contains(c) => format!("{}ies", &kind[..kind.len() - 1]),
        _ => format!("{kind}s"),
    }
}

pub fn kind_dir(kind: &str) -> PathBuf {
    PathBuf::from(plural(kind))
}

pub fn metadata_file(kind: &str) -> PathBuf {
    let plural = plural(kind);
    PathBuf::from(&plural).join("metadata").join(format!("{plural}_metadata.json"))
}

pub fn cache_dir(kind: &str) -> PathBuf {
    kind_dir(kind).join("cache")
}

pub fn data_dir(kind: &str) -> PathBuf {
    kind_dir(kind).join("data")
}

pub fn log_file(log_type: &str, name: &str) -> PathBuf {
    PathBuf::from("logs").join(format!("{log_type}_{name}.log"))
}

/// Name of a content-addressed cache file: `<stem>_<hash>.<ext>`.
pub fn cache_file_name(stem: &str, hash: &str, ext: &str) -> String {
    match ext.is_empty() {
        true => format!("{stem}_{hash}"),
        false => format!("{stem}_{hash}.{ext}"),
    }
}

/// Split a cache file name back into `(stem, hash, ext)`.
///
/// Returns `None` when the name doesn't carry a full-length hex digest, which
/// is how stray files in a cache directory get told apart from real entries.
pub fn parse_cache_file_name(file_name: &str) -> Option<(&str, &str, &str)> {
    let (base, ext) = match file_name.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (file_name, ""),
    };
    let (stem, hash) = base.rsplit_once('_')?;
    let valid = hash.len() == HASH_HEX_LEN && hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    (valid && !stem.is_empty()).then_some((stem, hash, ext))
}

/// Artifact name derived from a source file: the base name without its
/// final extension.
pub fn artifact_name(path: impl AsRef<Path>) -> Option<String> {
    path.as_ref().file_stem().map(|s| s.to_string_lossy().into_owned()).filter(|s| !s.is_empty())
}

/// File extension without the dot, lowercased. Empty when there is none.
pub fn format_of(path: impl AsRef<Path>) -> String {
    path.as_ref().extension().map(|e| e.to_string_lossy().to_ascii_lowercase()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("model", "models")]
    #[case("texture", "textures")]
    #[case("dependency", "dependencies")]
    #[case("key", "keys")]
    #[case("cache", "caches")]
    fn test_plural(#[case] kind: &str, #[case] expected: &str) {
        assert_eq!(plural(kind), expected);
    }

    #[test]
    fn test_metadata_file() {
        assert_eq!(metadata_file("model"), Path::new("models/metadata/models_metadata.json"));
        assert_eq!(cache_dir("texture"), Path::new("textures/cache"));
        assert_eq!(data_dir("scene"), Path::new("scenes/data"));
        assert_eq!(log_file("system", "registry"), Path::new("logs/system_registry.log"));
    }

    #[test]
    fn test_cache_file_name_round_trip() {
        let hash = "a".repeat(HASH_HEX_LEN);
        let name = cache_file_name("cube_lod0", &hash, "glb");
        assert_eq!(name, format!("cube_lod0_{hash}.glb"));
        assert_eq!(parse_cache_file_name(&name), Some(("cube_lod0", hash.as_str(), "glb")));
    }

    #[rstest]
    #[case("cube.glb")]
    #[case("cube_abc.glb")]
    #[case("_0000000000000000000000000000000000000000000000000000000000000000.glb")]
    fn test_parse_rejects_non_cache_names(#[case] name: &str) {
        assert_eq!(parse_cache_file_name(name), None);
    }

    #[rstest]
    #[case("assets/models/Cube.GLB", Some("Cube"), "glb")]
    #[case("sky.png", Some("sky"), "png")]
    #[case("README", Some("README"), "")]
    fn test_name_and_format(#[case] path: &str, #[case] name: Option<&str>, #[case] format: &str) {
        assert_eq!(artifact_name(path).as_deref(), name);
        assert_eq!(format_of(path), format);
    }
}
