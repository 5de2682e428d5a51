use crate::migrate::CURRENT_SCHEMA;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use time::OffsetDateTime;

pub const DEFAULT_VERSION: &str = "1.0";

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn epoch() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
}

/// Fields shared by every artifact record, whatever its kind.
///
/// Most fields tolerate being absent on read so that half-written legacy
/// records still load; validation flags the gaps later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Common {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub source_path: PathBuf,
    /// File extension without the dot, lowercase.
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the file at `source_path`.
    #[serde(default)]
    pub content_hash: String,
    #[serde(default = "epoch", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default = "epoch", with = "time::serde::rfc3339")]
    pub last_modified_at: OffsetDateTime,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub schema: u32,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}
impl Common {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            name: name.into(),
            kind: kind.into(),
            source_path: PathBuf::new(),
            format: String::new(),
            size_bytes: 0,
            content_hash: String::new(),
            created_at: now,
            last_modified_at: now,
            version: default_version(),
            schema: CURRENT_SCHEMA,
            parameters: Map::new(),
        }
    }
}

/// A metadata record: common fields, kind-specific attributes, and whatever
/// else was found in the file.
///
/// The `extra` map catches keys that neither [`Common`] nor `A` know about, so
/// a record written by a newer build survives being rewritten by this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<A> {
    #[serde(flatten)]
    pub common: Common,
    #[serde(flatten)]
    pub attributes: A,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
impl<A> Record<A> {
    pub fn new(common: Common, attributes: A) -> Self {
        Self { common, attributes, extra: Map::new() }
    }

    pub fn name(&self) -> &str {
        &self.common.name
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}
impl Bounds {
    /// Smallest box containing every point, or `None` for no points.
    pub fn enclosing<I: IntoIterator<Item = [f64; 3]>>(points: I) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        Some(points.fold(Self { min: first, max: first }, |b, p| b.union(&Self { min: p, max: p })))
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut out = *self;
        for axis in 0..3 {
            out.min[axis] = out.min[axis].min(other.min[axis]);
            out.max[axis] = out.max[axis].max(other.max[axis]);
        }
        out
    }

    pub fn extents(&self) -> [f64; 3] {
        [self.max[0] - self.min[0], self.max[1] - self.min[1], self.max[2] - self.min[2]]
    }
}
