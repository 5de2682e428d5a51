use crate::INDEX_KIND;
use crate::entry::{CacheEntry, CacheStats, CacheValidation, index_key};
use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use futures::TryStreamExt;
use serde_json::Map;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::instrument;
use wold_metadata::MetadataStore;
use wold_storage::{BackendHandle, HashIndex, layout};

/// The cache directories of every kind plus their shared index.
///
/// Counter updates (`access_count`, `last_accessed_at`) happen under the
/// store's own mutex so two concurrent `get`s never lose an increment.
#[derive(Debug)]
pub struct CacheStore {
    backend: BackendHandle,
    index: MetadataStore<CacheEntry>,
    counters: Mutex<()>,
}

impl CacheStore {
    #[instrument(skip_all)]
    pub async fn open(backend: BackendHandle) -> Result<Self> {
        let index = MetadataStore::open(backend.clone(), INDEX_KIND).await.or_raise(|| ErrorKind::Index)?;
        Ok(Self { backend, index, counters: Mutex::new(()) })
    }

    /// Location of the index document, relative to the asset root.
    pub fn index_path(&self) -> &Path {
        self.index.path()
    }

    /// Copy `source` into the cache for `kind`. The logical name is the file
    /// stem and the format its extension. Returns the absolute path of the
    /// cached copy.
    ///
    /// # Errors
    /// [`NotFound`](ErrorKind::NotFound) when `source` doesn't exist.
    pub async fn add(&self, source: impl AsRef<Path>, kind: &str) -> Result<PathBuf> {
        let source = source.as_ref();
        let bytes = match fs::read(source).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                exn::bail!(ErrorKind::NotFound(source.to_path_buf()))
            },
            Err(err) => return Err(err).or_raise(|| ErrorKind::File(source.to_path_buf())),
        };
        let name = layout::artifact_name(source)
            .ok_or_raise(|| ErrorKind::InvalidName(source.to_string_lossy().into_owned()))?;
        self.insert_bytes(&name, kind, &layout::format_of(source), &bytes, Vec::new()).await
    }

    /// Write `bytes` as a cache file for `(name, kind)` and index it.
    ///
    /// The file goes through a staging file and a rename, so it is either
    /// absent or complete. Inserting bytes that are already cached keeps the
    /// existing file and its access history. Returns the absolute path.
    #[instrument(skip_all, fields(name = %name, kind = %kind))]
    pub async fn insert_bytes(
        &self,
        name: &str,
        kind: &str,
        ext: &str,
        bytes: &[u8],
        dependencies: Vec<String>,
    ) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            exn::bail!(ErrorKind::InvalidName(name.to_string()));
        }
        let hash = HashIndex::hash_bytes(bytes);
        let file = layout::cache_file_name(name, &hash, ext);
        let relative = layout::cache_dir(kind).join(&file);
        let key = index_key(kind, &file);

        let existed = self.backend.exists(&relative).await.or_raise(|| ErrorKind::File(relative.clone()))?;
        if !existed {
            self.backend.write_atomic(&relative, bytes).await.or_raise(|| ErrorKind::File(relative.clone()))?;
        }

        let now = OffsetDateTime::now_utc();
        let previous = self.index.get(&key).await;
        let entry = CacheEntry {
            name: name.to_string(),
            kind: kind.to_string(),
            file,
            format: ext.to_ascii_lowercase(),
            size_bytes: bytes.len() as u64,
            content_hash: hash,
            created_at: previous.as_ref().map_or(now, |p| p.created_at),
            last_accessed_at: previous.as_ref().map_or(now, |p| p.last_accessed_at),
            access_count: previous.as_ref().map_or(0, |p| p.access_count),
            is_valid: true,
            dependencies,
            extra: previous.map(|p| p.extra).unwrap_or_else(Map::new),
        };
        if let Err(err) = self.index.put(&key, entry).await {
            if !existed && let Err(cleanup) = self.backend.remove_if_exists(&relative).await {
                tracing::warn!(path = %relative.display(), error = ?cleanup, "Could not remove unindexed cache file");
            }
            return Err(err).or_raise(|| ErrorKind::Index);
        }
        tracing::debug!(path = %relative.display(), reused = existed, "Cached");
        self.backend.resolve(&relative).or_raise(|| ErrorKind::File(relative))
    }

    /// Newest valid cache file for `(name, kind)` whose file still exists.
    /// Counts as an access.
    #[instrument(skip_all, fields(name = %name, kind = %kind))]
    pub async fn get(&self, name: &str, kind: &str) -> Result<Option<PathBuf>> {
        let _guard = self.counters.lock().await;
        let mut candidates: Vec<CacheEntry> = self
            .index
            .snapshot()
            .await
            .into_values()
            .filter(|e| e.name == name && e.kind == kind && e.is_valid)
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for entry in candidates {
            let relative = entry.relative_path();
            if !self.backend.exists(&relative).await.or_raise(|| ErrorKind::File(relative.clone()))? {
                continue;
            }
            let now = OffsetDateTime::now_utc();
            self.index
                .update(&entry.key(), |e| {
                    e.access_count += 1;
                    e.last_accessed_at = now;
                })
                .await
                .or_raise(|| ErrorKind::Index)?;
            return Ok(Some(self.backend.resolve(&relative).or_raise(|| ErrorKind::File(relative))?));
        }
        Ok(None)
    }

    /// Index entries, optionally only those of one kind.
    pub async fn entries(&self, kind: Option<&str>) -> Vec<CacheEntry> {
        self.index.snapshot().await.into_values().filter(|e| kind.is_none_or(|k| e.kind == k)).collect()
    }

    /// Drop every cache file for `(name, kind)`.
    pub async fn remove(&self, name: &str, kind: &str) -> Result<bool> {
        Ok(self.clear_where(|e| e.name == name && e.kind == kind).await? > 0)
    }

    /// Drop the one cache file `file` of `kind`, leaving other versions of
    /// the same name alone.
    pub async fn remove_file(&self, kind: &str, file: &str) -> Result<bool> {
        Ok(self.clear_where(|e| e.kind == kind && e.file == file).await? > 0)
    }

    /// Drop every cache file, or only those of `kind`.
    pub async fn clear(&self, kind: Option<&str>) -> Result<usize> {
        self.clear_where(|e| kind.is_none_or(|k| e.kind == k)).await
    }

    /// Drop every entry `filter` selects, e.g. by age or size. The index is
    /// written first; files are removed afterwards, so a failure can orphan a
    /// file but never leaves an entry pointing at nothing.
    #[instrument(skip_all, fields(removed = tracing::field::Empty))]
    pub async fn clear_where<F>(&self, mut filter: F) -> Result<usize>
    where
        F: FnMut(&CacheEntry) -> bool + Send,
    {
        let removed = self.index.remove_where(|_, e| filter(e)).await.or_raise(|| ErrorKind::Index)?;
        tracing::Span::current().record("removed", removed.len());
        for (_, entry) in &removed {
            let relative = entry.relative_path();
            if let Err(err) = self.backend.remove_if_exists(&relative).await {
                tracing::warn!(path = %relative.display(), error = ?err, "Could not remove cache file");
            }
        }
        Ok(removed.len())
    }

    /// Rehash every cache file against the digest in its name. Entries whose
    /// file is gone are dropped; the rest get their `is_valid` flag set.
    #[instrument(skip_all)]
    pub async fn validate(&self) -> Result<CacheValidation> {
        let entries = self.index.snapshot().await;
        let mut report = CacheValidation { total: entries.len(), ..Default::default() };
        let mut missing = Vec::new();
        let mut verdicts = std::collections::HashMap::new();
        for (key, entry) in &entries {
            let relative = entry.relative_path();
            match self.backend.read(&relative).await {
                Ok(bytes) => {
                    let valid = HashIndex::hash_bytes(&bytes) == entry.content_hash;
                    match valid {
                        true => report.valid += 1,
                        false => {
                            tracing::warn!(path = %relative.display(), "Cache file no longer matches its hash");
                            report.invalid += 1
                        },
                    }
                    verdicts.insert(key.clone(), valid);
                },
                Err(err) if err.is_not_found() => {
                    report.missing += 1;
                    missing.push(key.clone());
                },
                Err(err) => return Err(err).or_raise(|| ErrorKind::File(relative)),
            }
        }
        self.index.remove_where(|key, _| missing.contains(&key.to_string())).await.or_raise(|| ErrorKind::Index)?;
        self.index
            .update_where(|key, e| match verdicts.get(key) {
                Some(&valid) if valid != e.is_valid => {
                    e.is_valid = valid;
                    true
                },
                _ => false,
            })
            .await
            .or_raise(|| ErrorKind::Index)?;
        Ok(report)
    }

    /// Index files found in `kind`'s cache directory that the index doesn't
    /// know about, e.g. after the index was deleted. A file whose contents no
    /// longer match the digest in its name is indexed as invalid. Returns the
    /// number of entries added.
    #[instrument(skip_all, fields(kind = %kind))]
    pub async fn rediscover(&self, kind: &str) -> Result<usize> {
        let dir = layout::cache_dir(kind);
        let files: Vec<_> =
            self.backend.list_stream(Some(dir.as_path())).try_collect().await.or_raise(|| ErrorKind::File(dir.clone()))?;
        let known = self.index.snapshot().await;
        let mut found = Vec::new();
        for info in files {
            let Some(file) = info.path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let Some((stem, hash, ext)) = layout::parse_cache_file_name(&file) else {
                continue;
            };
            let key = index_key(kind, &file);
            if known.contains_key(&key) {
                continue;
            }
            let bytes = self.backend.read(&info.path).await.or_raise(|| ErrorKind::File(info.path.clone()))?;
            let entry = CacheEntry {
                name: stem.to_string(),
                kind: kind.to_string(),
                format: ext.to_ascii_lowercase(),
                size_bytes: bytes.len() as u64,
                content_hash: hash.to_string(),
                created_at: info.modified,
                last_accessed_at: info.modified,
                access_count: 0,
                is_valid: HashIndex::hash_bytes(&bytes) == hash,
                dependencies: Vec::new(),
                extra: Map::new(),
                file,
            };
            found.push((key, entry));
        }
        self.index.put_many(found).await.or_raise(|| ErrorKind::Index)
    }

    /// Mark every valid entry derived from `name` invalid, e.g. because its
    /// source changed. Returns how many were marked.
    pub async fn invalidate_dependents(&self, name: &str) -> Result<usize> {
        let marked = self
            .index
            .update_where(|_, e| {
                let hit = e.is_valid && e.dependencies.iter().any(|d| d == name);
                if hit {
                    e.is_valid = false;
                }
                hit
            })
            .await
            .or_raise(|| ErrorKind::Index)?;
        if marked > 0 {
            tracing::info!(name, marked, "Invalidated derived cache entries");
        }
        Ok(marked)
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats::collect(self.index.snapshot().await.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use wold_storage::LocalBackend;

    async fn cache() -> (TempDir, BackendHandle, CacheStore) {
        let temp_dir = TempDir::new().unwrap();
        let backend: BackendHandle = Arc::new(LocalBackend::new("test", temp_dir.path().join("assets")).unwrap());
        let cache = CacheStore::open(backend.clone()).await.unwrap();
        (temp_dir, backend, cache)
    }

    #[tokio::test]
    async fn test_add_then_get_returns_same_bytes() {
        let (temp_dir, _backend, cache) = cache().await;
        let source = temp_dir.path().join("sky.png");
        std::fs::write(&source, b"not really a png").unwrap();

        let cached = cache.add(&source, "texture").await.unwrap();
        let hash = HashIndex::hash_bytes(b"not really a png");
        assert_eq!(cached.file_name().unwrap().to_string_lossy(), format!("sky_{hash}.png"));
        assert!(cached.starts_with(temp_dir.path().join("assets/textures/cache")));

        let got = cache.get("sky", "texture").await.unwrap().unwrap();
        assert_eq!(std::fs::read(&got).unwrap(), b"not really a png");
        assert_eq!(cache.get("sky", "model").await.unwrap(), None);
        assert_eq!(cache.entries(None).await[0].access_count, 1);
    }

    #[tokio::test]
    async fn test_add_missing_source() {
        let (temp_dir, _backend, cache) = cache().await;
        let err = cache.add(temp_dir.path().join("nope.wav"), "audio").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_reinsert_keeps_access_history() {
        let (_temp_dir, _backend, cache) = cache().await;
        cache.insert_bytes("cube_lod0", "model", "glb", b"glb", vec!["cube".into()]).await.unwrap();
        cache.get("cube_lod0", "model").await.unwrap();
        cache.insert_bytes("cube_lod0", "model", "glb", b"glb", vec!["cube".into()]).await.unwrap();
        let entries = cache.entries(Some("model")).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].access_count, 1);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let (_temp_dir, backend, cache) = cache().await;
        cache.insert_bytes("a", "audio", "wav", b"1", vec![]).await.unwrap();
        let reopened = CacheStore::open(backend).await.unwrap();
        assert_eq!(reopened.entries(None).await, cache.entries(None).await);
        assert_eq!(reopened.index_path(), Path::new("caches/metadata/caches_metadata.json"));
    }

    #[tokio::test]
    async fn test_invalid_names_are_rejected() {
        let (_temp_dir, _backend, cache) = cache().await;
        for name in ["", "../x", ".hidden"] {
            let err = cache.insert_bytes(name, "model", "glb", b"x", vec![]).await.unwrap_err();
            assert!(matches!(&*err, ErrorKind::InvalidName(_)), "{name:?}");
        }
    }

    #[tokio::test]
    async fn test_validate_counts_and_flags() {
        let (_temp_dir, backend, cache) = cache().await;
        cache.insert_bytes("good", "texture", "png", b"good", vec![]).await.unwrap();
        let bad = cache.insert_bytes("bad", "texture", "png", b"bad", vec![]).await.unwrap();
        let gone = cache.insert_bytes("gone", "texture", "png", b"gone", vec![]).await.unwrap();
        std::fs::write(&bad, b"tampered").unwrap();
        std::fs::remove_file(&gone).unwrap();

        let report = cache.validate().await.unwrap();
        assert_eq!(report, CacheValidation { total: 3, valid: 1, invalid: 1, missing: 1 });
        let entries = cache.entries(None).await;
        assert_eq!(entries.len(), 2);
        assert!(!entries.iter().find(|e| e.name == "bad").unwrap().is_valid);
        assert_eq!(cache.get("bad", "texture").await.unwrap(), None);

        // Flags are persisted.
        let reopened = CacheStore::open(backend).await.unwrap();
        assert_eq!(reopened.stats().await.invalid, 1);
    }

    #[tokio::test]
    async fn test_invalidate_dependents() {
        let (_temp_dir, _backend, cache) = cache().await;
        cache.insert_bytes("cube_lod0", "model", "glb", b"0", vec!["cube".into()]).await.unwrap();
        cache.insert_bytes("cube_lod1", "model", "glb", b"1", vec!["cube".into()]).await.unwrap();
        cache.insert_bytes("tree_lod0", "model", "glb", b"2", vec!["tree".into()]).await.unwrap();
        assert_eq!(cache.invalidate_dependents("cube").await.unwrap(), 2);
        assert_eq!(cache.invalidate_dependents("cube").await.unwrap(), 0);
        assert!(cache.get("tree_lod0", "model").await.unwrap().is_some());
        assert!(cache.get("cube_lod0", "model").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let (_temp_dir, _backend, cache) = cache().await;
        let a = cache.insert_bytes("a", "model", "glb", b"a", vec![]).await.unwrap();
        cache.insert_bytes("b", "model", "glb", b"b", vec![]).await.unwrap();
        cache.insert_bytes("c", "audio", "wav", b"c", vec![]).await.unwrap();

        assert!(cache.remove("a", "model").await.unwrap());
        assert!(!a.exists());
        assert!(!cache.remove("a", "model").await.unwrap());
        assert_eq!(cache.clear(Some("model")).await.unwrap(), 1);
        assert_eq!(cache.clear_where(|e| e.size_bytes > 100).await.unwrap(), 0);
        assert_eq!(cache.clear(None).await.unwrap(), 1);
        assert_eq!(cache.stats().await, CacheStats::default());
    }

    #[tokio::test]
    async fn test_rediscover_flags_tampered_files() {
        let (_temp_dir, backend, cache) = cache().await;
        let kept = cache.insert_bytes("kept", "model", "obj", b"kept", vec![]).await.unwrap();
        let hash = HashIndex::hash_bytes(b"orphan");
        backend
            .write(&layout::cache_dir("model").join(layout::cache_file_name("orphan", &hash, "obj")), b"orphan")
            .await
            .unwrap();
        let wrong = HashIndex::hash_bytes(b"something else");
        backend
            .write(&layout::cache_dir("model").join(layout::cache_file_name("liar", &wrong, "obj")), b"liar")
            .await
            .unwrap();
        backend.write(&layout::cache_dir("model").join("notes.txt"), b"stray").await.unwrap();

        assert_eq!(cache.rediscover("model").await.unwrap(), 2);
        let entries = cache.entries(Some("model")).await;
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().find(|e| e.name == "orphan").unwrap().is_valid);
        assert!(!entries.iter().find(|e| e.name == "liar").unwrap().is_valid);
        assert!(kept.exists());
        assert_eq!(cache.rediscover("model").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let (_temp_dir, _backend, cache) = cache().await;
        cache.insert_bytes("a", "model", "glb", b"12345", vec![]).await.unwrap();
        cache.insert_bytes("b", "texture", "png", b"123", vec![]).await.unwrap();
        for _ in 0..11 {
            cache.get("a", "model").await.unwrap();
        }
        let stats = cache.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.total_size, 8);
        assert_eq!(stats.by_kind["model"], 1);
        assert_eq!(stats.by_format["png"], 1);
        assert_eq!(stats.by_access_bucket[&crate::AccessBucket::Occasional], 1);
        assert_eq!(stats.by_access_bucket[&crate::AccessBucket::Rare], 1);
    }
}
