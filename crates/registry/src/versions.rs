//! Release history of named elements.
//!
//! Each entry is one `major.minor.patch` version of an element, keyed
//! `<name>_<version>`, with its author, change list and the versions of
//! other elements it needs. Versions are ordered numerically, so `1.10.0`
//! comes after `1.9.0`.

use crate::context::Context;
use crate::error::{ErrorKind, Result};
use derive_more::Display;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::instrument;
use wold_metadata::MetadataStore;

/// Kind under which versions are stored.
pub const KIND: &str = "version";

/// A parsed `major.minor.patch`. A missing patch (`1.0`) counts as `0`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{major}.{minor}.{patch}")]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl FromStr for SemVer {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ErrorKind::Constraint(format!("`{s}` is not a major.minor.patch version"));
        let parts: Vec<&str> = s.trim().split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            exn::bail!(invalid());
        }
        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse::<u64>().or_raise(invalid)?;
        }
        let [major, minor, patch] = numbers;
        Ok(Self { major, minor, patch })
    }
}

fn key(name: &str, version: &str) -> String {
    format!("{name}_{version}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub is_stable: bool,
    #[serde(default)]
    pub is_beta: bool,
    #[serde(default)]
    pub is_alpha: bool,
    /// Element name to the exact version needed.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified_at: OffsetDateTime,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VersionRecord {
    /// Stored versions were checked on creation; anything else sorts first.
    fn semver(&self) -> Option<SemVer> {
        self.version.parse().ok()
    }
}

/// What [`VersionManager::create`] needs besides the name and version.
#[derive(Debug, Clone, Default)]
pub struct NewVersion {
    pub author: String,
    pub description: String,
    pub changes: Vec<String>,
    pub dependencies: BTreeMap<String, String>,
    pub is_stable: bool,
    pub is_beta: bool,
    pub is_alpha: bool,
}

impl NewVersion {
    pub fn new(author: impl Into<String>, description: impl Into<String>) -> Self {
        Self { author: author.into(), description: description.into(), ..Self::default() }
    }

    pub fn changes(self, changes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { changes: changes.into_iter().map(Into::into).collect(), ..self }
    }

    pub fn depends_on(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), version.into());
        self
    }

    pub fn stable(self) -> Self {
        Self { is_stable: true, ..self }
    }

    pub fn beta(self) -> Self {
        Self { is_beta: true, ..self }
    }

    pub fn alpha(self) -> Self {
        Self { is_alpha: true, ..self }
    }
}

/// Which pre-releases a lookup may return. The default is neither.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Channels {
    pub beta: bool,
    pub alpha: bool,
}

impl Channels {
    pub fn all() -> Self {
        Self { beta: true, alpha: true }
    }

    fn admits(self, record: &VersionRecord) -> bool {
        (self.beta || !record.is_beta) && (self.alpha || !record.is_alpha)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionCheck {
    pub has_description: bool,
    pub has_changes: bool,
    /// `<name>@<version>` of every dependency with no entry of its own.
    pub missing_dependencies: Vec<String>,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum MajorBucket {
    #[serde(rename = "0.x")]
    Zero,
    #[serde(rename = "1.x")]
    One,
    #[serde(rename = "2.x")]
    Two,
    #[serde(rename = "3.x")]
    Three,
    #[serde(rename = "4.x+")]
    Later,
}
impl MajorBucket {
    pub fn of(major: u64) -> Self {
        match major {
            0 => Self::Zero,
            1 => Self::One,
            2 => Self::Two,
            3 => Self::Three,
            _ => Self::Later,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionStats {
    pub total: usize,
    pub stable: usize,
    pub beta: usize,
    pub alpha: usize,
    pub by_name: BTreeMap<String, usize>,
    pub by_major: BTreeMap<MajorBucket, usize>,
}

#[derive(Debug)]
pub struct VersionManager {
    ctx: Context,
    store: MetadataStore<VersionRecord>,
}

fn store_failed() -> ErrorKind {
    ErrorKind::Store(KIND.to_string())
}

impl VersionManager {
    #[instrument(skip_all)]
    pub async fn open(ctx: Context) -> Result<Self> {
        let store = MetadataStore::open(ctx.backend.clone(), KIND).await.or_raise(store_failed)?;
        Ok(Self { ctx, store })
    }

    /// Record a new version of `name`.
    ///
    /// # Errors
    /// [`Constraint`](ErrorKind::Constraint) for an empty name, a version
    /// that isn't `major.minor.patch`, or one that already exists.
    #[instrument(skip_all, fields(name = %name, version = %version))]
    pub async fn create(&self, name: &str, version: &str, new: NewVersion) -> Result<VersionRecord> {
        if name.trim().is_empty() {
            exn::bail!(ErrorKind::Constraint("version name is empty".to_string()));
        }
        let semver: SemVer = version.parse()?;
        let now = OffsetDateTime::now_utc();
        let record = VersionRecord {
            name: name.to_string(),
            version: version.trim().to_string(),
            author: new.author,
            description: new.description,
            changes: new.changes,
            is_stable: new.is_stable,
            is_beta: new.is_beta,
            is_alpha: new.is_alpha,
            dependencies: new.dependencies,
            created_at: now,
            last_modified_at: now,
            extra: Map::new(),
        };
        let key = key(name, &record.version);
        let inserted = self
            .store
            .modify(|records| {
                if records.contains_key(&key) {
                    return None;
                }
                records.insert(key.clone(), record.clone());
                Some(())
            })
            .await
            .or_raise(store_failed);
        if self.ctx.ledger().track("create_version", inserted).await?.is_none() {
            exn::bail!(ErrorKind::Constraint(format!("{name} {version} already exists")));
        }
        tracing::info!(version = %semver, "Version created");
        Ok(record)
    }

    /// Append `changes` and merge `dependencies` into an existing version.
    ///
    /// # Errors
    /// [`NotFound`](ErrorKind::NotFound) when there's no such version.
    #[instrument(skip_all, fields(name = %name, version = %version))]
    pub async fn update(
        &self,
        name: &str,
        version: &str,
        changes: Vec<String>,
        dependencies: BTreeMap<String, String>,
    ) -> Result<VersionRecord> {
        let now = OffsetDateTime::now_utc();
        let updated = self
            .store
            .update(&key(name, version), |record| {
                record.changes.extend(changes);
                record.dependencies.extend(dependencies);
                record.last_modified_at = now;
            })
            .await
            .or_raise(store_failed);
        match self.ctx.ledger().track("update_version", updated).await? {
            Some(record) => Ok(record),
            None => exn::bail!(ErrorKind::NotFound(format!("{name} {version}"))),
        }
    }

    pub async fn get(&self, name: &str, version: &str) -> Option<VersionRecord> {
        self.store.get(&key(name, version)).await
    }

    /// Versions of `name` that `channels` admits, newest first.
    pub async fn history(&self, name: &str, channels: Channels) -> Vec<VersionRecord> {
        let mut versions: Vec<VersionRecord> = self
            .store
            .snapshot()
            .await
            .into_values()
            .filter(|r| r.name == name && channels.admits(r))
            .collect();
        versions.sort_by(|a, b| b.semver().cmp(&a.semver()));
        versions
    }

    pub async fn latest(&self, name: &str, channels: Channels) -> Option<VersionRecord> {
        self.history(name, channels).await.into_iter().next()
    }

    /// How `first` orders against `second`, both versions of `name`.
    ///
    /// # Errors
    /// [`NotFound`](ErrorKind::NotFound) unless both versions exist.
    pub async fn compare(&self, name: &str, first: &str, second: &str) -> Result<Ordering> {
        let mut found = Vec::with_capacity(2);
        for version in [first, second] {
            match self.get(name, version).await {
                Some(record) => found.push(record.semver()),
                None => exn::bail!(ErrorKind::NotFound(format!("{name} {version}"))),
            }
        }
        Ok(found[0].cmp(&found[1]))
    }

    /// A version is valid with a description, at least one change and every
    /// dependency recorded here.
    ///
    /// # Errors
    /// [`NotFound`](ErrorKind::NotFound) when there's no such version.
    pub async fn validate(&self, name: &str, version: &str) -> Result<VersionCheck> {
        let records = self.store.snapshot().await;
        let Some(record) = records.get(&key(name, version)) else {
            exn::bail!(ErrorKind::NotFound(format!("{name} {version}")));
        };
        let missing_dependencies: Vec<String> = record
            .dependencies
            .iter()
            .filter(|(dep, version)| !records.contains_key(&key(dep, version)))
            .map(|(dep, version)| format!("{dep}@{version}"))
            .collect();
        let has_description = !record.description.trim().is_empty();
        let has_changes = !record.changes.is_empty();
        Ok(VersionCheck {
            has_description,
            has_changes,
            is_valid: has_description && has_changes && missing_dependencies.is_empty(),
            missing_dependencies,
        })
    }

    pub async fn stats(&self) -> VersionStats {
        let mut stats = VersionStats::default();
        for record in self.store.snapshot().await.into_values() {
            stats.total += 1;
            stats.stable += usize::from(record.is_stable);
            stats.beta += usize::from(record.is_beta);
            stats.alpha += usize::from(record.is_alpha);
            let major = record.semver().map_or(0, |v| v.major);
            *stats.by_major.entry(MajorBucket::of(major)).or_default() += 1;
            *stats.by_name.entry(record.name).or_default() += 1;
        }
        stats
    }
}
