use crate::error::{ErrorKind, Result};
use crate::migrate::{self, Migration, MigrationContext};
use async_stream::stream;
use exn::ResultExt;
use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::instrument;
use wold_storage::{BackendHandle, layout};

/// Durable `name → record` map backed by a single JSON document.
///
/// The whole map lives in memory; every successful mutation rewrites the
/// document with an atomic replace, so a fresh process always observes the
/// last committed state. A mutation whose write fails leaves both the
/// document and the in-memory map as they were.
///
/// Readers share the lock, mutators take it exclusively. Two processes
/// writing the same store race with last-writer-wins.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use wold_metadata::{MetadataStore, Record, Common, models::TextureAttributes};
/// use wold_storage::LocalBackend;
///
/// # async fn example() -> wold_metadata::error::Result<()> {
/// let backend = Arc::new(LocalBackend::new("assets", "/srv/wold/assets").unwrap());
/// let store = MetadataStore::<Record<TextureAttributes>>::open(backend, "texture").await?;
/// let record = Record::new(Common::new("texture", "sky"), TextureAttributes::default());
/// store.put("sky", record).await?;
/// assert!(store.contains("sky").await);
/// # Ok(())
/// # }
/// ```
pub struct MetadataStore<R> {
    backend: BackendHandle,
    kind: String,
    path: PathBuf,
    migrations: &'static [Migration],
    records: RwLock<BTreeMap<String, R>>,
}

impl<R> std::fmt::Debug for MetadataStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("backend", &self.backend.name())
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl<R> MetadataStore<R>
where
    R: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Open the store for `kind` without any record migrations.
    ///
    /// # Errors
    /// [`StoreCorrupt`](ErrorKind::StoreCorrupt) when the document exists but
    /// isn't a JSON object of valid records, [`Storage`](ErrorKind::Storage)
    /// when it can't be read at all. A missing or empty document is an empty
    /// store.
    pub async fn open(backend: BackendHandle, kind: impl Into<String>) -> Result<Self> {
        Self::open_with(backend, kind, &[]).await
    }

    /// Open the store for `kind`, upgrading old records through `migrations`
    /// before they are deserialized. Upgraded records are written back on the
    /// next mutation.
    #[instrument(skip_all, fields(kind = tracing::field::Empty, records = tracing::field::Empty))]
    pub async fn open_with(
        backend: BackendHandle,
        kind: impl Into<String>,
        migrations: &'static [Migration],
    ) -> Result<Self> {
        let kind = kind.into();
        tracing::Span::current().record("kind", kind.as_str());
        let path = layout::metadata_file(&kind);
        let records = load(&backend, &kind, &path, migrations).await?;
        tracing::Span::current().record("records", records.len());
        Ok(Self {
            backend,
            kind,
            path,
            migrations,
            records: RwLock::new(records),
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Location of the backing document, relative to the asset root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, name: &str) -> Option<R> {
        self.records.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.records.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Copy of everything currently in memory.
    pub async fn snapshot(&self) -> BTreeMap<String, R> {
        self.records.read().await.clone()
    }

    /// Names in key order.
    pub async fn names(&self) -> Vec<String> {
        self.records.read().await.keys().cloned().collect()
    }

    /// Lazily yield every record in key order.
    ///
    /// Names are taken up front; each record is fetched when it is pulled, so a
    /// record deleted mid-iteration is skipped and one replaced mid-iteration
    /// is yielded in its new form. The lock is never held across a yield.
    pub fn iter(&self) -> impl Stream<Item = (String, R)> + Send + '_ {
        stream! {
            let names: Vec<String> = self.records.read().await.keys().cloned().collect();
            for name in names {
                let record = self.records.read().await.get(&name).cloned();
                if let Some(record) = record {
                    yield (name, record);
                }
            }
        }
    }

    /// Insert or fully replace the record under `name`.
    #[instrument(skip_all, fields(kind = %self.kind, name = tracing::field::Empty))]
    pub async fn put(&self, name: impl Into<String>, record: R) -> Result<()> {
        let name = name.into();
        tracing::Span::current().record("name", name.as_str());
        self.commit(|records| {
            records.insert(name, record);
            Some(())
        })
        .await?;
        Ok(())
    }

    /// Insert or replace several records with a single write.
    pub async fn put_many<I>(&self, records: I) -> Result<usize>
    where
        I: IntoIterator<Item = (String, R)> + Send,
        I::IntoIter: Send,
    {
        let incoming: Vec<(String, R)> = records.into_iter().collect();
        if incoming.is_empty() {
            return Ok(0);
        }
        let count = incoming.len();
        self.commit(move |records| {
            records.extend(incoming);
            Some(())
        })
        .await?;
        Ok(count)
    }

    /// Swap the whole map for `records` with a single write.
    pub async fn replace(&self, records: BTreeMap<String, R>) -> Result<()> {
        self.commit(move |current| {
            *current = records;
            Some(())
        })
        .await?;
        Ok(())
    }

    /// Edit a record in place. Returns the edited record, or `None` (and
    /// writes nothing) if there is no record under `name`.
    pub async fn update<F>(&self, name: &str, edit: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut R) + Send,
    {
        self.commit(|records| {
            let record = records.get_mut(name)?;
            edit(record);
            Some(record.clone())
        })
        .await
    }

    /// Remove a record. Returns `false` (and writes nothing) when there was
    /// nothing to remove.
    #[instrument(skip_all, fields(kind = %self.kind, name = %name))]
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let removed = self.commit(|records| records.remove(name).map(|_| ())).await?;
        Ok(removed.is_some())
    }

    /// Remove every record `select` picks, with a single write. The removed
    /// records are returned; an empty result means nothing was written.
    pub async fn remove_where<F>(&self, mut select: F) -> Result<Vec<(String, R)>>
    where
        F: FnMut(&str, &R) -> bool + Send,
    {
        let removed = self.commit(|records| {
            let names: Vec<String> = records.iter().filter(|(n, r)| select(n, r)).map(|(n, _)| n.clone()).collect();
            let removed: Vec<(String, R)> =
                names.into_iter().filter_map(|n| records.remove(&n).map(|r| (n, r))).collect();
            (!removed.is_empty()).then_some(removed)
        });
        Ok(removed.await?.unwrap_or_default())
    }

    /// Run `edit` over every record, with a single write if any call
    /// reported a change. Returns the number of changed records.
    pub async fn update_where<F>(&self, mut edit: F) -> Result<usize>
    where
        F: FnMut(&str, &mut R) -> bool + Send,
    {
        let changed = self.commit(|records| {
            let changed = records.iter_mut().filter_map(|(n, r)| edit(n, r).then_some(())).count();
            (changed > 0).then_some(changed)
        });
        Ok(changed.await?.unwrap_or_default())
    }

    /// Read and change the whole map as one step: no other write can land
    /// between what `change` sees and what it returns. `None` from `change`
    /// writes nothing.
    pub async fn modify<T, F>(&self, change: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut BTreeMap<String, R>) -> Option<T> + Send,
        T: Send,
    {
        self.commit(change).await
    }

    /// Throw away the in-memory map and read the document again, e.g. after
    /// another process has written it.
    pub async fn reload(&self) -> Result<usize> {
        let fresh = load(&self.backend, &self.kind, &self.path, self.migrations).await?;
        let count = fresh.len();
        *self.records.write().await = fresh;
        Ok(count)
    }

    /// Apply `change` to a copy of the map, persist the copy and only then
    /// swap it in. `None` from `change` means nothing changed and skips the
    /// write.
    async fn commit<T, F>(&self, change: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut BTreeMap<String, R>) -> Option<T> + Send,
        T: Send,
    {
        let mut records = self.records.write().await;
        let mut staged = records.clone();
        let Some(output) = change(&mut staged) else {
            return Ok(None);
        };
        let bytes = serde_json::to_vec_pretty(&staged).or_raise(|| ErrorKind::Serialize(self.kind.clone()))?;
        self.backend.write_atomic(&self.path, &bytes).await.or_raise(|| ErrorKind::Storage(self.path.clone()))?;
        *records = staged;
        Ok(Some(output))
    }
}

async fn load<R: DeserializeOwned>(
    backend: &BackendHandle,
    kind: &str,
    path: &Path,
    migrations: &[Migration],
) -> Result<BTreeMap<String, R>> {
    let bytes = match backend.read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.is_not_found() => return Ok(BTreeMap::new()),
        Err(err) => return Err(err).or_raise(|| ErrorKind::Storage(path.to_path_buf())),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }
    let document: Map<String, Value> =
        serde_json::from_slice(&bytes).or_raise(|| ErrorKind::StoreCorrupt(path.to_path_buf()))?;

    let mut migrated = 0usize;
    let mut records = BTreeMap::new();
    for (name, mut raw) in document {
        let ctx = MigrationContext { kind, name: &name };
        if migrate::apply(&ctx, &mut raw, migrations).map_err(|_| ErrorKind::StoreCorrupt(path.to_path_buf()))? {
            migrated += 1;
        }
        let record = serde_json::from_value(raw).or_raise(|| ErrorKind::StoreCorrupt(path.to_path_buf()))?;
        records.insert(name, record);
    }
    if migrated > 0 {
        tracing::info!(path = %path.display(), migrated, "Migrated metadata records to the current schema");
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::ARTIFACT_MIGRATIONS;
    use crate::models::{Common, ModelAttributes, Record};
    use futures::StreamExt;
    use serde::Deserialize;
    use std::sync::Arc;
    use tempfile::TempDir;
    use wold_storage::LocalBackend;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn note(text: &str) -> Note {
        Note { text: text.to_string() }
    }

    fn backend() -> (TempDir, BackendHandle) {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new("test", temp_dir.path()).unwrap();
        (temp_dir, Arc::new(backend))
    }

    #[tokio::test]
    async fn test_missing_document_is_empty_store() {
        let (_temp_dir, backend) = backend();
        let store = MetadataStore::<Note>::open(backend, "note").await.unwrap();
        assert!(store.is_empty().await);
        assert_eq!(store.path(), Path::new("notes/metadata/notes_metadata.json"));
    }

    #[tokio::test]
    async fn test_empty_document_is_empty_store() {
        let (_temp_dir, backend) = backend();
        backend.write(Path::new("notes/metadata/notes_metadata.json"), b"  \n").await.unwrap();
        let store = MetadataStore::<Note>::open(backend, "note").await.unwrap();
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_corrupt_document_refuses_to_open() {
        let (_temp_dir, backend) = backend();
        backend.write(Path::new("notes/metadata/notes_metadata.json"), b"{\"a\": ").await.unwrap();
        let err = MetadataStore::<Note>::open(backend, "note").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::StoreCorrupt(_)));
    }

    #[tokio::test]
    async fn test_non_object_document_refuses_to_open() {
        let (_temp_dir, backend) = backend();
        backend.write(Path::new("notes/metadata/notes_metadata.json"), b"[1, 2]").await.unwrap();
        let err = MetadataStore::<Note>::open(backend, "note").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::StoreCorrupt(_)));
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (_temp_dir, backend) = backend();
        let store = MetadataStore::<Note>::open(backend, "note").await.unwrap();
        store.put("a", note("first")).await.unwrap();
        store.put("a", note("second")).await.unwrap();
        assert_eq!(store.get("a").await, Some(note("second")));
        assert_eq!(store.len().await, 1);
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.get("a").await, None);
    }

    #[tokio::test]
    async fn test_fresh_open_matches_snapshot() {
        let (_temp_dir, backend) = backend();
        let store = MetadataStore::<Note>::open(backend.clone(), "note").await.unwrap();
        store.put_many([("b".to_string(), note("bee")), ("a".to_string(), note("ay"))]).await.unwrap();
        store.update("a", |n| n.text.push('!')).await.unwrap();
        let reopened = MetadataStore::<Note>::open(backend, "note").await.unwrap();
        assert_eq!(reopened.snapshot().await, store.snapshot().await);
        assert_eq!(reopened.get("a").await, Some(note("ay!")));
    }

    #[tokio::test]
    async fn test_update_missing_writes_nothing() {
        let (_temp_dir, backend) = backend();
        let store = MetadataStore::<Note>::open(backend.clone(), "note").await.unwrap();
        assert_eq!(store.update("ghost", |n| n.text.clear()).await.unwrap(), None);
        assert!(!backend.exists(store.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let (temp_dir, backend) = backend();
        let store = MetadataStore::<Note>::open(backend, "note").await.unwrap();
        store.put("kept", note("kept")).await.unwrap();
        // A directory where the document should be makes the final rename fail.
        let document = temp_dir.path().join("notes/metadata/notes_metadata.json");
        std::fs::remove_file(&document).unwrap();
        std::fs::create_dir_all(document.join("blocker")).unwrap();

        let err = store.put("lost", note("lost")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Storage(_)));
        assert_eq!(store.get("lost").await, None);
        assert_eq!(store.get("kept").await, Some(note("kept")));
    }

    #[tokio::test]
    async fn test_iter_yields_in_key_order() {
        let (_temp_dir, backend) = backend();
        let store = MetadataStore::<Note>::open(backend, "note").await.unwrap();
        for name in ["c", "a", "b"] {
            store.put(name, note(name)).await.unwrap();
        }
        let names: Vec<String> = store.iter().map(|(name, _)| name).collect().await;
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_legacy_records_are_migrated_and_unknown_keys_kept() {
        let (_temp_dir, backend) = backend();
        let legacy = br#"{
            "cube": {
                "path": "models/cube.glb",
                "size": 2048,
                "vertices": 8,
                "faces": 12,
                "created": "2024-01-01T00:00:00",
                "last_modified": "2024-01-02T00:00:00",
                "rig": "humanoid"
            }
        }"#;
        backend.write(Path::new("models/metadata/models_metadata.json"), legacy).await.unwrap();
        let store = MetadataStore::<Record<ModelAttributes>>::open_with(backend.clone(), "model", ARTIFACT_MIGRATIONS)
            .await
            .unwrap();
        let cube = store.get("cube").await.unwrap();
        assert_eq!(cube.common.name, "cube");
        assert_eq!(cube.common.size_bytes, 2048);
        assert_eq!(cube.attributes.vertex_count, 8);
        assert_eq!(cube.attributes.face_count, 12);
        assert_eq!(cube.common.version, "1.0");
        assert_eq!(cube.extra["rig"], "humanoid");

        store.put("sphere", Record::new(Common::new("model", "sphere"), ModelAttributes::default())).await.unwrap();
        let raw: Value = serde_json::from_slice(&backend.read(store.path()).await.unwrap()).unwrap();
        assert_eq!(raw["cube"]["schema"], 1);
        assert_eq!(raw["cube"]["rig"], "humanoid");
        assert!(raw["cube"].get("vertices").is_none());
    }

    #[tokio::test]
    async fn test_reload_picks_up_external_writes() {
        let (_temp_dir, backend) = backend();
        let store = MetadataStore::<Note>::open(backend.clone(), "note").await.unwrap();
        let other = MetadataStore::<Note>::open(backend, "note").await.unwrap();
        other.put("x", note("from elsewhere")).await.unwrap();
        assert_eq!(store.get("x").await, None);
        assert_eq!(store.reload().await.unwrap(), 1);
        assert_eq!(store.get("x").await, Some(note("from elsewhere")));
    }

    #[tokio::test]
    async fn test_bulk_remove_and_update() {
        let (_temp_dir, backend) = backend();
        let store = MetadataStore::<Note>::open(backend.clone(), "note").await.unwrap();
        store.put_many([("a".to_string(), note("keep")), ("b".to_string(), note("drop")), ("c".to_string(), note("drop"))]).await.unwrap();

        let removed = store.remove_where(|_, n| n.text == "drop").await.unwrap();
        assert_eq!(removed.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(), ["b", "c"]);
        assert!(store.remove_where(|_, _| false).await.unwrap().is_empty());

        let changed = store.update_where(|_, n| {
            n.text.push('!');
            true
        });
        assert_eq!(changed.await.unwrap(), 1);
        let fresh = MetadataStore::<Note>::open(backend, "note").await.unwrap();
        assert_eq!(fresh.snapshot().await, store.snapshot().await);
        assert_eq!(fresh.get("a").await, Some(note("keep!")));
    }
}
