use derive_more::Display;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use wold_graph::DependencyBucket;

/// Something [`validate()`](super::ArtifactRegistry::validate) found wrong.
/// Never fatal; the report carries it.
#[derive(Debug, Display, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum ValidationWarning {
    #[display("content hash drifted: recorded {expected}, found {actual}")]
    HashDrift { expected: String, actual: String },
    #[display("source file {} is missing", path.display())]
    MissingSource { path: PathBuf },
    #[display("required field `{field}` is empty")]
    MissingField { field: String },
    #[display("dependency `{name}` is not registered")]
    MissingDependency { name: String },
    #[display("artifact is on a dependency cycle")]
    Circular,
    #[display("{message}")]
    Content { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub kind: String,
    pub name: String,
    /// The source file could be read.
    pub exists: bool,
    pub hash_matches: bool,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub(crate) fn new(kind: &str, name: &str) -> Self {
        Self { kind: kind.to_string(), name: name.to_string(), exists: false, hash_matches: false, warnings: Vec::new() }
    }

    pub fn is_valid(&self) -> bool {
        self.exists && self.hash_matches && self.warnings.is_empty()
    }

    pub fn has_circular(&self) -> bool {
        self.warnings.contains(&ValidationWarning::Circular)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub kind: String,
    pub total: usize,
    pub total_size: u64,
    pub by_format: BTreeMap<String, usize>,
    pub by_version: BTreeMap<String, usize>,
    /// How many records have each `has_*` / `is_*` flag set.
    pub features: BTreeMap<String, usize>,
    /// Kind-specific groupings, e.g. textures by color space.
    pub groups: BTreeMap<String, BTreeMap<String, usize>>,
    pub by_dependency_count: BTreeMap<DependencyBucket, usize>,
}
