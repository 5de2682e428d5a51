use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use time::OffsetDateTime;
use wold_storage::layout;

/// Index record for one cache file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Logical name the file is looked up by (the `<stem>` part).
    pub name: String,
    pub kind: String,
    /// File name inside the kind's cache directory.
    pub file: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub size_bytes: u64,
    /// Digest embedded in `file` at insertion time.
    pub content_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed_at: OffsetDateTime,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default = "valid")]
    pub is_valid: bool,
    /// Names of the artifacts this file was derived from.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn valid() -> bool {
    true
}

impl CacheEntry {
    /// Location of the file relative to the asset root.
    pub fn relative_path(&self) -> PathBuf {
        layout::cache_dir(&self.kind).join(&self.file)
    }

    /// Key under which the entry is indexed.
    pub(crate) fn key(&self) -> String {
        index_key(&self.kind, &self.file)
    }

    pub fn access_bucket(&self) -> AccessBucket {
        AccessBucket::of(self.access_count)
    }
}

pub(crate) fn index_key(kind: &str, file: &str) -> String {
    format!("{}/{file}", layout::plural(kind))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessBucket {
    #[serde(rename = "0-10")]
    Rare,
    #[serde(rename = "11-50")]
    Occasional,
    #[serde(rename = "51-100")]
    Frequent,
    #[serde(rename = "100+")]
    Hot,
}
impl AccessBucket {
    pub fn of(access_count: u64) -> Self {
        match access_count {
            0..=10 => Self::Rare,
            11..=50 => Self::Occasional,
            51..=100 => Self::Frequent,
            _ => Self::Hot,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheValidation {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    /// Entries whose file was gone; they are dropped from the index.
    pub missing: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub total_size: u64,
    pub invalid: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_format: BTreeMap<String, usize>,
    pub by_access_bucket: BTreeMap<AccessBucket, usize>,
}
impl CacheStats {
    pub(crate) fn collect<'a>(entries: impl IntoIterator<Item = &'a CacheEntry>) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            stats.total += 1;
            stats.total_size += entry.size_bytes;
            stats.invalid += usize::from(!entry.is_valid);
            *stats.by_kind.entry(entry.kind.clone()).or_default() += 1;
            *stats.by_format.entry(entry.format.clone()).or_default() += 1;
            *stats.by_access_bucket.entry(entry.access_bucket()).or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, AccessBucket::Rare)]
    #[case(10, AccessBucket::Rare)]
    #[case(11, AccessBucket::Occasional)]
    #[case(50, AccessBucket::Occasional)]
    #[case(51, AccessBucket::Frequent)]
    #[case(100, AccessBucket::Frequent)]
    #[case(101, AccessBucket::Hot)]
    fn test_access_bucket(#[case] count: u64, #[case] expected: AccessBucket) {
        assert_eq!(AccessBucket::of(count), expected);
    }

    #[test]
    fn test_bucket_labels() {
        assert_eq!(serde_json::to_value(AccessBucket::Hot).unwrap(), "100+");
        let stats = CacheStats {
            by_access_bucket: [(AccessBucket::Rare, 2)].into_iter().collect(),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&stats).unwrap()["by_access_bucket"]["0-10"], 2);
    }
}
