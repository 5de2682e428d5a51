use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted shape of one registered dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub dep_type: String,
    pub version: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Derived from the other records' `depends_on`; kept for readers of the
    /// JSON document, ignored when loading.
    #[serde(default)]
    pub depended_on_by: Vec<String>,
    #[serde(default = "required")]
    pub is_required: bool,
    #[serde(default)]
    pub is_circular: bool,
}

fn required() -> bool {
    true
}

/// Outcome of [`DependencyGraph::register`](crate::DependencyGraph::register).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub record: DependencyRecord,
    /// Set when the node ended up on a cycle. Registration still succeeds.
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphValidation {
    /// Direct or transitive dependencies that were never registered.
    pub missing: Vec<String>,
    pub has_circular: bool,
}
impl GraphValidation {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty() && !self.has_circular
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DependencyBucket {
    #[serde(rename = "0")]
    None,
    #[serde(rename = "1-5")]
    Few,
    #[serde(rename = "6-10")]
    Several,
    #[serde(rename = "10+")]
    Many,
}
impl DependencyBucket {
    pub fn of(count: usize) -> Self {
        match count {
            0 => Self::None,
            1..=5 => Self::Few,
            6..=10 => Self::Several,
            _ => Self::Many,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub total: usize,
    pub required: usize,
    pub optional: usize,
    pub circular: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_dependency_count: BTreeMap<DependencyBucket, usize>,
}
impl GraphStats {
    pub(crate) fn collect<'a>(records: impl IntoIterator<Item = &'a DependencyRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            match record.is_required {
                true => stats.required += 1,
                false => stats.optional += 1,
            }
            stats.circular += usize::from(record.is_circular);
            *stats.by_type.entry(record.dep_type.clone()).or_default() += 1;
            *stats.by_dependency_count.entry(DependencyBucket::of(record.depends_on.len())).or_default() += 1;
        }
        stats
    }
}
