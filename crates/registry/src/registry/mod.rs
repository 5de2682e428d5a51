//! One registry per artifact kind, all built from the same generic type.
//!
//! An [`ArtifactRegistry`] ingests files of its kind: it hashes them, runs
//! the kind's decoder, fills in the common fields and persists the record.
//! Dependencies found by the decoder (or passed in by the caller) go into the
//! shared [`DependencyGraph`](wold_graph::DependencyGraph), and a changed
//! file invalidates every cached artifact derived from it.

mod erased;
mod report;
mod scan;

pub use self::erased::AnyRegistry;
pub use self::report::{RegistryStats, ValidationReport, ValidationWarning};
pub use self::scan::ScanEvent;

use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::events::EventPayload;
use crate::kind::Kind;
use exn::{OptionExt, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::instrument;
use wold_codec::Decoded;
use wold_codec::document::{self, Authored, Component, Document, Template};
use wold_graph::{DependencyBucket, NodeInfo};
use wold_metadata::{ARTIFACT_MIGRATIONS, CURRENT_SCHEMA, Common, MetadataStore, Record};
use wold_storage::layout;

/// Topic every successful registration is announced on.
pub const REGISTERED_TOPIC: &str = "assets.registered";

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Defaults to the file's base name.
    pub name: Option<String>,
    /// Wins over the version found in the file.
    pub version: Option<String>,
    /// Added to whatever the decoder reports.
    pub dependencies: Vec<String>,
}

impl RegisterOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    pub fn depends_on(mut self, dependencies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies.extend(dependencies.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Created,
    /// Same content as last time; only `last_modified_at` moved.
    Unchanged,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registered<A> {
    pub record: Record<A>,
    pub outcome: Outcome,
    /// Non-fatal findings, such as the artifact landing on a dependency cycle.
    pub warnings: Vec<String>,
}

pub struct ArtifactRegistry<K: Kind> {
    ctx: Context,
    store: MetadataStore<Record<K::Attributes>>,
    /// Held for a whole registration, from reading the previous record to
    /// linking the new one.
    registering: Mutex<()>,
    kind: PhantomData<fn() -> K>,
}

impl<K: Kind> std::fmt::Debug for ArtifactRegistry<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRegistry").field("kind", &K::NAME).field("store", &self.store).finish_non_exhaustive()
    }
}

fn store_failed<K: Kind>() -> ErrorKind {
    ErrorKind::Store(K::NAME.to_string())
}

fn valid_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(['/', '\\']) && !name.starts_with('.')
}

impl<K: Kind> ArtifactRegistry<K> {
    #[instrument(skip_all, fields(kind = K::NAME))]
    pub async fn open(ctx: Context) -> Result<Self> {
        let store = MetadataStore::open_with(ctx.backend.clone(), K::NAME, ARTIFACT_MIGRATIONS)
            .await
            .or_raise(store_failed::<K>)?;
        Ok(Self { ctx, store, registering: Mutex::new(()), kind: PhantomData })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub async fn get(&self, name: &str) -> Option<Record<K::Attributes>> {
        self.store.get(name).await
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.store.contains(name).await
    }

    /// Every record, ordered by name.
    pub async fn list(&self) -> Vec<Record<K::Attributes>> {
        self.store.snapshot().await.into_values().collect()
    }

    pub async fn find(&self, mut select: impl FnMut(&Record<K::Attributes>) -> bool) -> Vec<Record<K::Attributes>> {
        self.store.snapshot().await.into_values().filter(|r| select(r)).collect()
    }

    pub async fn len(&self) -> usize {
        self.store.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.store.is_empty().await
    }

    async fn require(&self, name: &str) -> Result<Record<K::Attributes>> {
        self.store.get(name).await.ok_or_raise(|| ErrorKind::NotFound(format!("{} `{name}`", K::NAME)))
    }

    /// Ingest the file at `path`.
    ///
    /// Registering a file whose content hash hasn't changed only refreshes
    /// `last_modified_at`; the decoder doesn't run again. A changed hash
    /// replaces the attributes, keeps `created_at`, and marks every cache
    /// entry derived from this artifact invalid.
    ///
    /// # Errors
    /// [`NotFound`](ErrorKind::NotFound) when `path` doesn't exist,
    /// [`Decode`](ErrorKind::Decode) when the format isn't one of this kind's
    /// or the decoder rejects the bytes, [`Store`](ErrorKind::Store) when the
    /// record can't be persisted.
    #[instrument(skip_all, fields(kind = K::NAME, path = %path.as_ref().display(), name = tracing::field::Empty, outcome = tracing::field::Empty))]
    pub async fn register(&self, path: impl AsRef<Path>, options: RegisterOptions) -> Result<Registered<K::Attributes>> {
        let result = self.register_untracked(path.as_ref(), options).await;
        self.ctx.ledger().track("register", result).await
    }

    /// [`register()`](Self::register) without the error ledger, for callers
    /// that record the failure themselves.
    pub(crate) async fn register_untracked(
        &self,
        path: &Path,
        options: RegisterOptions,
    ) -> Result<Registered<K::Attributes>> {
        let _registering = self.registering.lock().await;
        let hashed = match self.ctx.hashes.hash_file(path).await {
            Ok(hashed) => hashed,
            Err(err) if err.is_not_found() => exn::bail!(ErrorKind::NotFound(path.display().to_string())),
            Err(err) => return Err(err).or_raise(|| ErrorKind::Io(path.to_path_buf())),
        };
        let name = match options.name {
            Some(name) => name,
            None => layout::artifact_name(path)
                .ok_or_raise(|| ErrorKind::Constraint(format!("{} has no usable file name", path.display())))?,
        };
        if !valid_name(&name) {
            exn::bail!(ErrorKind::Constraint(format!("`{name}` is not a valid artifact name")));
        }
        tracing::Span::current().record("name", name.as_str());
        let format = layout::format_of(path);
        if !K::FORMATS.contains(&format.as_str()) {
            exn::bail!(ErrorKind::Decode(format!("{name}: `{format}` is not a {} format", K::NAME)));
        }

        let now = OffsetDateTime::now_utc();
        let source_path = self.ctx.source_path_of(&hashed.path);
        let previous = self.store.get(&name).await;

        if let Some(previous) = previous.as_ref().filter(|p| p.common.content_hash == hashed.content_hash) {
            let mut record = previous.clone();
            record.common.last_modified_at = now;
            record.common.source_path = source_path;
            if let Some(version) = options.version {
                record.common.version = version;
            }
            self.store.put(&name, record.clone()).await.or_raise(store_failed::<K>)?;
            let known = self.ctx.graph.get(&name).await.map(|d| d.depends_on).unwrap_or_default();
            let warnings = self.link(&name, &record.common.version, merge(known, options.dependencies)).await?;
            return Ok(self.announce(record, Outcome::Unchanged, warnings));
        }

        let bytes = self.ctx.read_file(&hashed.path).await?;
        let decoded: Decoded<K::Attributes> = {
            let (format, name, size) = (format.clone(), name.clone(), hashed.size);
            tokio::task::spawn_blocking(move || K::decode(&bytes, &format, &name, size))
                .await
                .or_raise(|| ErrorKind::Decode(path.display().to_string()))?
                .or_raise(|| ErrorKind::Decode(path.display().to_string()))?
        };

        let mut common = match &previous {
            Some(previous) => previous.common.clone(),
            None => Common { created_at: now, ..Common::new(K::NAME, &name) },
        };
        common.name = name.clone();
        common.kind = K::NAME.to_string();
        common.source_path = source_path;
        common.format = format;
        common.size_bytes = hashed.size;
        common.content_hash = hashed.content_hash.clone();
        common.last_modified_at = now;
        common.schema = CURRENT_SCHEMA;
        if let Some(version) = options.version.or(decoded.version) {
            common.version = version;
        }
        match K::AUTHORED {
            true => common.parameters = decoded.parameters,
            false => common.parameters.extend(decoded.parameters),
        }

        let mut attributes = decoded.attributes;
        let (outcome, extra) = match previous {
            Some(previous) => {
                K::carry_over(&previous.attributes, &mut attributes);
                (Outcome::Updated, previous.extra)
            },
            None => (Outcome::Created, Default::default()),
        };
        let record = Record { common, attributes, extra };
        self.store.put(&name, record.clone()).await.or_raise(store_failed::<K>)?;

        let warnings = self
            .link(&name, &record.common.version, merge(decoded.dependencies, options.dependencies))
            .await?;
        if outcome == Outcome::Updated {
            self.ctx
                .cache
                .invalidate_dependents(&name)
                .await
                .or_raise(|| ErrorKind::Store(wold_cache::INDEX_KIND.to_string()))?;
        }
        Ok(self.announce(record, outcome, warnings))
    }

    async fn link(&self, name: &str, version: &str, dependencies: Vec<String>) -> Result<Vec<String>> {
        let info = NodeInfo::new(K::NAME, version);
        match self.ctx.graph.register(name, info, dependencies).await {
            Ok(registration) => Ok(registration.warning.into_iter().collect()),
            Err(err) if err.is_constraint() => {
                Err(err).or_raise(|| ErrorKind::Constraint(format!("dependencies of `{name}`")))
            },
            Err(err) => Err(err).or_raise(|| ErrorKind::Store(wold_graph::KIND.to_string())),
        }
    }

    fn announce(
        &self,
        record: Record<K::Attributes>,
        outcome: Outcome,
        warnings: Vec<String>,
    ) -> Registered<K::Attributes> {
        tracing::Span::current().record("outcome", tracing::field::debug(outcome));
        for warning in &warnings {
            tracing::warn!(kind = K::NAME, name = %record.common.name, warning = %warning, "Registered with warning");
        }
        let registered = EventPayload::AssetRegistered {
            kind: K::NAME.to_string(),
            name: record.common.name.clone(),
            outcome,
        };
        match serde_json::to_value(&registered) {
            Ok(payload) => {
                self.ctx.bus.publish(REGISTERED_TOPIC, payload);
            },
            Err(err) => tracing::warn!(error = ?err, "Could not serialize registration notice"),
        }
        Registered { record, outcome, warnings }
    }

    /// Put `record` back exactly as it was, with `dependencies` as its graph
    /// edges. Nothing is announced and no cache entry is invalidated.
    pub async fn restore(&self, record: Record<K::Attributes>, dependencies: Vec<String>) -> Result<()> {
        let _registering = self.registering.lock().await;
        let name = record.common.name.clone();
        let version = record.common.version.clone();
        self.store.put(&name, record).await.or_raise(store_failed::<K>)?;
        self.link(&name, &version, dependencies).await?;
        tracing::debug!(kind = K::NAME, name = %name, "Restored");
        Ok(())
    }

    /// Change a record in place. Name and kind can't be changed this way;
    /// `last_modified_at` advances.
    pub async fn update<F>(&self, name: &str, edit: F) -> Result<Record<K::Attributes>>
    where
        F: FnOnce(&mut Record<K::Attributes>) + Send,
    {
        let now = OffsetDateTime::now_utc();
        let updated = self
            .store
            .update(name, |record| {
                edit(record);
                record.common.name = name.to_string();
                record.common.kind = K::NAME.to_string();
                record.common.last_modified_at = now;
            })
            .await;
        let result = match updated {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(Error::from(ErrorKind::NotFound(format!("{} `{name}`", K::NAME)))),
            Err(err) => Err(err).or_raise(store_failed::<K>),
        };
        self.ctx.ledger().track("update", result).await
    }

    /// Remove a record, its graph node and its cached derivatives. Returns
    /// `false` if there was no such record.
    ///
    /// # Errors
    /// [`Constraint`](ErrorKind::Constraint) while other artifacts still
    /// depend on it.
    #[instrument(skip_all, fields(kind = K::NAME, name = %name))]
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let result = self.delete_inner(name).await;
        self.ctx.ledger().track("delete", result).await
    }

    async fn delete_inner(&self, name: &str) -> Result<bool> {
        if !self.store.contains(name).await {
            return Ok(false);
        }
        let dependents = self.ctx.graph.dependents(name, false).await;
        if !dependents.is_empty() {
            exn::bail!(ErrorKind::Constraint(format!("`{name}` is still required by {}", dependents.join(", "))));
        }
        let removed = self.store.delete(name).await.or_raise(store_failed::<K>)?;
        if self.ctx.graph.get(name).await.is_some_and(|d| d.dep_type == K::NAME) {
            self.ctx.graph.unregister(name).await.or_raise(|| ErrorKind::Store(wold_graph::KIND.to_string()))?;
        }
        self.ctx
            .cache
            .remove(name, K::NAME)
            .await
            .or_raise(|| ErrorKind::Store(wold_cache::INDEX_KIND.to_string()))?;
        tracing::info!(kind = K::NAME, name, "Deleted");
        Ok(removed)
    }

    /// Absolute location of the artifact's file.
    pub async fn source_file(&self, name: &str) -> Result<PathBuf> {
        let record = self.require(name).await?;
        self.ctx.locate(&record.common.source_path)
    }

    /// The record and the current bytes of its file.
    pub async fn read_source(&self, name: &str) -> Result<(Record<K::Attributes>, Vec<u8>)> {
        let record = self.require(name).await?;
        let path = self.ctx.locate(&record.common.source_path)?;
        let bytes = self.ctx.read_file(&path).await?;
        Ok((record, bytes))
    }

    /// Rewrite the artifact's JSON document and register the result.
    ///
    /// # Errors
    /// [`Constraint`](ErrorKind::Constraint) for kinds that aren't JSON
    /// documents, and whatever `edit` returns. The file is untouched when
    /// `edit` fails.
    pub async fn edit_document<F>(&self, name: &str, edit: F) -> Result<Registered<K::Attributes>>
    where
        F: FnOnce(&mut Document) -> Result<()> + Send,
    {
        let result = async {
            if !K::AUTHORED {
                exn::bail!(ErrorKind::Constraint(format!("{} artifacts are not JSON documents", K::NAME)));
            }
            let record = self.require(name).await?;
            let path = self.ctx.locate(&record.common.source_path)?;
            let bytes = self.ctx.read_file(&path).await?;
            let mut doc = document::parse(&bytes).or_raise(|| ErrorKind::Decode(name.to_string()))?;
            edit(&mut doc)?;
            let bytes = document::to_bytes(&doc).or_raise(|| ErrorKind::Decode(name.to_string()))?;
            self.ctx.write_file(&path, &bytes).await?;
            self.register_untracked(&path, RegisterOptions::named(name)).await
        }
        .await;
        self.ctx.ledger().track("edit_document", result).await
    }

    /// Set one entry of the record's `parameters`. For JSON-authored kinds
    /// the document is rewritten so the file and the record agree.
    pub async fn set_parameter(&self, name: &str, key: &str, value: Value) -> Result<Record<K::Attributes>> {
        if key.trim().is_empty() {
            exn::bail!(ErrorKind::Constraint("parameter name is empty".to_string()));
        }
        match K::AUTHORED {
            true => {
                let registered = self
                    .edit_document(name, |doc| {
                        document::set_parameter(doc, key, value);
                        Ok(())
                    })
                    .await?;
                Ok(registered.record)
            },
            false => {
                self.update(name, |record| {
                    record.common.parameters.insert(key.to_string(), value);
                })
                .await
            },
        }
    }

    /// Recompute the hash, check the record's fields and the kind's own
    /// rules, and look for unresolved or circular dependencies. Problems are
    /// reported as warnings; only a missing record is an error.
    #[instrument(skip_all, fields(kind = K::NAME, name = %name))]
    pub async fn validate(&self, name: &str) -> Result<ValidationReport> {
        let result = self.validate_inner(name).await;
        self.ctx.ledger().track("validate", result).await
    }

    async fn validate_inner(&self, name: &str) -> Result<ValidationReport> {
        let record = self.require(name).await?;
        let mut report = ValidationReport::new(K::NAME, name);
        for (field, empty) in [
            ("source_path", record.common.source_path.as_os_str().is_empty()),
            ("format", record.common.format.is_empty()),
            ("content_hash", record.common.content_hash.is_empty()),
            ("version", record.common.version.is_empty()),
        ] {
            if empty {
                report.warnings.push(ValidationWarning::MissingField { field: field.to_string() });
            }
        }

        if !record.common.source_path.as_os_str().is_empty() {
            let path = self.ctx.locate(&record.common.source_path)?;
            self.ctx.hashes.forget(&path);
            match self.ctx.hashes.hash_file(&path).await {
                Ok(hashed) => {
                    report.exists = true;
                    report.hash_matches = hashed.content_hash == record.common.content_hash;
                    if !report.hash_matches {
                        report.warnings.push(ValidationWarning::HashDrift {
                            expected: record.common.content_hash.clone(),
                            actual: hashed.content_hash.clone(),
                        });
                    }
                    let bytes = self.ctx.read_file(&hashed.path).await?;
                    let findings = K::check(&bytes, &record.attributes);
                    report.warnings.extend(findings.into_iter().map(|message| ValidationWarning::Content { message }));
                },
                Err(err) if err.is_not_found() => {
                    report.warnings.push(ValidationWarning::MissingSource { path: record.common.source_path.clone() });
                },
                Err(err) => return Err(err).or_raise(|| ErrorKind::Io(path)),
            }
        }

        match self.ctx.graph.validate(name).await {
            Ok(graph) => {
                if graph.has_circular {
                    report.warnings.push(ValidationWarning::Circular);
                }
                let missing = graph.missing.into_iter().map(|name| ValidationWarning::MissingDependency { name });
                report.warnings.extend(missing);
            },
            Err(err) if err.is_not_found() => {},
            Err(err) => return Err(err).or_raise(|| ErrorKind::Store(wold_graph::KIND.to_string())),
        }
        Ok(report)
    }

    /// Counters over every record of this kind.
    pub async fn stats(&self) -> RegistryStats {
        let records = self.store.snapshot().await;
        let mut stats = RegistryStats { kind: K::NAME.to_string(), ..Default::default() };
        for (name, record) in &records {
            stats.total += 1;
            stats.total_size += record.common.size_bytes;
            *stats.by_format.entry(record.common.format.clone()).or_default() += 1;
            *stats.by_version.entry(record.common.version.clone()).or_default() += 1;
            if let Ok(Value::Object(attributes)) = serde_json::to_value(&record.attributes) {
                let present = attributes
                    .into_iter()
                    .filter(|(key, value)| (key.starts_with("has_") || key.starts_with("is_")) && *value == Value::Bool(true));
                for (key, _) in present {
                    *stats.features.entry(key).or_default() += 1;
                }
            }
            for (group, value) in K::groups(&record.attributes) {
                *stats.groups.entry(group.to_string()).or_insert_with(BTreeMap::new).entry(value).or_default() += 1;
            }
            let dependency_count = self.ctx.graph.get(name).await.map_or(0, |d| d.depends_on.len());
            *stats.by_dependency_count.entry(DependencyBucket::of(dependency_count)).or_default() += 1;
        }
        stats
    }
}

impl<K> ArtifactRegistry<K>
where
    K: Kind,
    K::Attributes: Authored,
{
    /// Write a new JSON document for `name` under `<kind>s/data/` and
    /// register it.
    ///
    /// # Errors
    /// [`Constraint`](ErrorKind::Constraint) when the name is taken, either
    /// in the registry or on disk.
    #[instrument(skip_all, fields(kind = K::NAME, name = %name))]
    pub async fn create(&self, name: &str, template: Template) -> Result<Registered<K::Attributes>> {
        let result = self.create_inner(name, template).await;
        self.ctx.ledger().track("create", result).await
    }

    async fn create_inner(&self, name: &str, template: Template) -> Result<Registered<K::Attributes>> {
        if !valid_name(name) {
            exn::bail!(ErrorKind::Constraint(format!("`{name}` is not a valid artifact name")));
        }
        if self.store.contains(name).await {
            exn::bail!(ErrorKind::Constraint(format!("{} `{name}` already exists", K::NAME)));
        }
        let relative = layout::data_dir(K::NAME).join(format!("{name}.json"));
        if self.ctx.backend.exists(&relative).await.or_raise(|| ErrorKind::Io(relative.clone()))? {
            exn::bail!(ErrorKind::Constraint(format!("{} is already on disk", relative.display())));
        }
        let doc = document::create::<K::Attributes>(name, template);
        let bytes = document::to_bytes(&doc).or_raise(|| ErrorKind::Decode(name.to_string()))?;
        self.ctx.backend.write_atomic(&relative, &bytes).await.or_raise(|| ErrorKind::Io(relative.clone()))?;
        let absolute = self.ctx.backend.resolve(&relative).or_raise(|| ErrorKind::Io(relative.clone()))?;
        let registered = self.register_untracked(&absolute, RegisterOptions::named(name)).await;
        if registered.is_err()
            && let Err(cleanup) = self.ctx.backend.remove_if_exists(&relative).await
        {
            tracing::warn!(path = %relative.display(), error = ?cleanup, "Could not remove unregistered document");
        }
        registered
    }

    /// Attach a sub-element to a composite document and update the record's
    /// flags to match.
    ///
    /// # Errors
    /// [`Constraint`](ErrorKind::Constraint) when this kind has no place for
    /// the component.
    pub async fn add_component(&self, name: &str, component: &Component) -> Result<Registered<K::Attributes>> {
        self.edit_document(name, |doc| {
            document::add_component::<K::Attributes>(doc, component).or_raise(|| {
                ErrorKind::Constraint(format!("a {} cannot hold a {} component", K::NAME, component.label()))
            })
        })
        .await
    }
}

/// `first` followed by whatever of `second` it doesn't already contain.
fn merge(first: Vec<String>, second: Vec<String>) -> Vec<String> {
    let mut merged = Vec::with_capacity(first.len() + second.len());
    for name in first.into_iter().chain(second) {
        if !name.is_empty() && !merged.contains(&name) {
            merged.push(name);
        }
    }
    merged
}

#[cfg(test)]
mod tests;
