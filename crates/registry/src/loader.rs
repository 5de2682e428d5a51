//! Lazily decoded, in-memory copies of registered resources.
//!
//! The live set is bounded: loading past capacity evicts whatever was used
//! least recently. A resource's `is_loaded` flag follows its membership.
//!
//! Decoding never happens under the live-set lock. Two tasks loading the
//! same cold resource may both decode it; the second insert wins.

use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use image::DynamicImage;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;
use wold_codec::audio::{self, SampleBuffer};
use wold_codec::texture;
use wold_graph::NodeInfo;
use wold_metadata::models::ResourceAttributes;
use wold_metadata::{CURRENT_SCHEMA, Common, MetadataStore, Record};
use wold_storage::layout;

/// Kind under which resources are stored and cached.
pub const KIND: &str = "resource";

const TEXT_FORMATS: &[&str] = &["txt", "md", "csv", "xml", "yaml", "yml", "toml", "ini", "cfg", "glsl", "vert", "frag"];

pub type ResourceRecord = Record<ResourceAttributes>;

/// A decoded resource.
#[derive(Debug, Clone)]
pub enum Resource {
    Json(Value),
    Text(String),
    Image(DynamicImage),
    Audio(SampleBuffer),
}

impl Resource {
    /// Which decoder handles `format`, if any.
    fn decoder(format: &str) -> Option<fn(&[u8]) -> Result<Resource>> {
        match format {
            "json" => Some(decode_json),
            f if TEXT_FORMATS.contains(&f) => Some(decode_text),
            f if texture::FORMATS.contains(&f) => Some(decode_image),
            f if audio::FORMATS.contains(&f) => Some(decode_audio),
            _ => None,
        }
    }
}

fn decode_json(bytes: &[u8]) -> Result<Resource> {
    let value = serde_json::from_slice(bytes).or_raise(|| ErrorKind::Decode("JSON resource".into()))?;
    Ok(Resource::Json(value))
}

fn decode_text(bytes: &[u8]) -> Result<Resource> {
    let text = String::from_utf8(bytes.to_vec()).or_raise(|| ErrorKind::Decode("text resource".into()))?;
    Ok(Resource::Text(text))
}

fn decode_image(bytes: &[u8]) -> Result<Resource> {
    let image = texture::read(bytes).or_raise(|| ErrorKind::Decode("image resource".into()))?;
    Ok(Resource::Image(image))
}

fn decode_audio(bytes: &[u8]) -> Result<Resource> {
    let buffer = audio::read(bytes).or_raise(|| ErrorKind::Decode("audio resource".into()))?;
    Ok(Resource::Audio(buffer))
}

#[derive(Debug, Clone, Default)]
pub struct ResourceOptions {
    pub name: Option<String>,
    pub is_shared: bool,
    pub dependencies: Vec<String>,
    /// Also keep a copy in the cache, which `load` falls back to when the
    /// original file goes missing.
    pub cache: bool,
}

#[derive(Debug, Default)]
struct Live {
    entries: HashMap<String, (Arc<Resource>, u64)>,
    clock: u64,
}

impl Live {
    fn touch(&mut self, name: &str) -> Option<Arc<Resource>> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(name).map(|(resource, used)| {
            *used = clock;
            resource.clone()
        })
    }

    /// Insert `resource` and return the names evicted to stay within
    /// `capacity`.
    fn insert(&mut self, name: &str, resource: Arc<Resource>, capacity: usize) -> Vec<String> {
        self.clock += 1;
        self.entries.insert(name.to_string(), (resource, self.clock));
        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            let Some(oldest) = self.entries.iter().min_by_key(|(_, (_, used))| *used).map(|(n, _)| n.clone()) else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }
}

pub struct ResourceLoader {
    ctx: Context,
    store: MetadataStore<ResourceRecord>,
    live: Mutex<Live>,
    capacity: usize,
}

impl std::fmt::Debug for ResourceLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLoader")
            .field("capacity", &self.capacity)
            .field("live", &self.live.lock().entries.len())
            .finish_non_exhaustive()
    }
}

fn store_failed() -> ErrorKind {
    ErrorKind::Store(KIND.to_string())
}

impl ResourceLoader {
    /// Open the resource store. Records still flagged `is_loaded` by an
    /// earlier process are cleared, since nothing is live yet.
    #[instrument(skip_all, fields(capacity = capacity))]
    pub async fn open(ctx: Context, capacity: usize) -> Result<Self> {
        let store = MetadataStore::open(ctx.backend.clone(), KIND).await.or_raise(store_failed)?;
        store
            .update_where(|_, record: &mut ResourceRecord| std::mem::take(&mut record.attributes.is_loaded))
            .await
            .or_raise(store_failed)?;
        Ok(Self { ctx, store, live: Mutex::new(Live::default()), capacity: capacity.max(1) })
    }

    pub async fn record(&self, name: &str) -> Option<ResourceRecord> {
        self.store.get(name).await
    }

    pub async fn records(&self) -> Vec<ResourceRecord> {
        self.store.snapshot().await.into_values().collect()
    }

    /// Index the file at `path` as a resource.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn register(&self, path: impl AsRef<Path>, options: ResourceOptions) -> Result<ResourceRecord> {
        let result = self.register_inner(path.as_ref(), options).await;
        self.ctx.ledger().track("register_resource", result).await
    }

    async fn register_inner(&self, path: &Path, options: ResourceOptions) -> Result<ResourceRecord> {
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
        let format = layout::format_of(path);
        let now = OffsetDateTime::now_utc();
        let previous = self.store.get(&name).await;

        let mut common = match &previous {
            Some(previous) => previous.common.clone(),
            None => Common { created_at: now, ..Common::new(KIND, &name) },
        };
        common.source_path = self.ctx.source_path_of(&hashed.path);
        common.format = format.clone();
        common.size_bytes = hashed.size;
        common.content_hash = hashed.content_hash.clone();
        common.last_modified_at = now;
        common.schema = CURRENT_SCHEMA;

        let attributes = ResourceAttributes {
            is_loaded: self.is_loaded(&name),
            is_cached: options.cache,
            is_shared: options.is_shared,
            dependencies: options.dependencies.clone(),
        };
        if options.cache {
            let bytes = self.ctx.read_file(&hashed.path).await?;
            self.ctx
                .cache
                .insert_bytes(&name, KIND, &format, &bytes, options.dependencies.clone())
                .await
                .or_raise(|| ErrorKind::Store(wold_cache::INDEX_KIND.to_string()))?;
        }
        let extra = previous.map(|p| p.extra).unwrap_or_default();
        let record = Record { common, attributes, extra };
        self.store.put(&name, record.clone()).await.or_raise(store_failed)?;
        self.ctx
            .graph
            .register(&name, NodeInfo::new(KIND, &record.common.version), options.dependencies)
            .await
            .or_raise(|| ErrorKind::Store(wold_graph::KIND.to_string()))?;
        Ok(record)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.live.lock().entries.contains_key(name)
    }

    /// Names currently in the live set.
    pub fn loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live.lock().entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// The decoded resource, from the live set unless `force_reload`.
    ///
    /// Returns `None` for formats nothing here can decode.
    ///
    /// # Errors
    /// [`NotFound`](ErrorKind::NotFound) when there is no such resource, or
    /// neither its file nor a cached copy exists.
    /// [`Constraint`](ErrorKind::Constraint) when the resource sits on a
    /// dependency cycle. [`Decode`](ErrorKind::Decode) when the decoder fails.
    #[instrument(skip_all, fields(name = %name, force_reload = force_reload, hit = tracing::field::Empty))]
    pub async fn load(&self, name: &str, force_reload: bool) -> Result<Option<Arc<Resource>>> {
        let hit = match force_reload {
            true => None,
            false => self.live.lock().touch(name),
        };
        if let Some(resource) = hit {
            tracing::Span::current().record("hit", true);
            return Ok(Some(resource));
        }
        tracing::Span::current().record("hit", false);
        let result = self.load_inner(name).await;
        self.ctx.ledger().track("load", result).await
    }

    async fn load_inner(&self, name: &str) -> Result<Option<Arc<Resource>>> {
        let record = self.store.get(name).await.ok_or_raise(|| ErrorKind::NotFound(format!("resource `{name}`")))?;
        if self.ctx.graph.get(name).await.is_some_and(|d| d.is_circular) {
            exn::bail!(ErrorKind::Constraint(format!("resource `{name}` is on a dependency cycle")));
        }
        let Some(decode) = Resource::decoder(&record.common.format) else {
            tracing::debug!(name, format = %record.common.format, "No decoder for format");
            return Ok(None);
        };

        let path = self.locate(name, &record).await?;
        let bytes = self.ctx.read_file(&path).await?;
        let resource = tokio::task::spawn_blocking(move || decode(&bytes))
            .await
            .or_raise(|| ErrorKind::Decode(name.to_string()))?
            .or_raise(|| ErrorKind::Decode(name.to_string()))?;
        let resource = Arc::new(resource);

        let evicted = self.live.lock().insert(name, resource.clone(), self.capacity);
        if !evicted.is_empty() {
            tracing::debug!(evicted = ?evicted, "Evicted from the live set");
        }
        self.store
            .update_where(|key, r| {
                let loaded = key == name || (r.attributes.is_loaded && !evicted.iter().any(|e| e == key));
                std::mem::replace(&mut r.attributes.is_loaded, loaded) != loaded
            })
            .await
            .or_raise(store_failed)?;
        Ok(Some(resource))
    }

    /// The primary file, or the cached copy when the primary is gone.
    async fn locate(&self, name: &str, record: &ResourceRecord) -> Result<PathBuf> {
        let primary = self.ctx.locate(&record.common.source_path)?;
        if self.ctx.file_exists(&primary).await {
            return Ok(primary);
        }
        let cached = self
            .ctx
            .cache
            .get(name, KIND)
            .await
            .or_raise(|| ErrorKind::Store(wold_cache::INDEX_KIND.to_string()))?;
        match cached {
            Some(path) => {
                tracing::info!(name, path = %path.display(), "Loading resource from the cache");
                Ok(path)
            },
            None => Err(Error::from(ErrorKind::NotFound(primary.display().to_string()))),
        }
    }

    /// The live copy if there is one, otherwise [`load()`](Self::load).
    pub async fn get(&self, name: &str) -> Result<Option<Arc<Resource>>> {
        self.load(name, false).await
    }

    /// Drop `name` from the live set. Returns `false` if it wasn't loaded.
    pub async fn unload(&self, name: &str) -> Result<bool> {
        let removed = self.live.lock().entries.remove(name).is_some();
        if removed {
            self.store
                .update(name, |record| record.attributes.is_loaded = false)
                .await
                .or_raise(store_failed)?;
        }
        Ok(removed)
    }

    /// Unload everything.
    pub async fn clear(&self) -> Result<usize> {
        let count = {
            let mut live = self.live.lock();
            let count = live.entries.len();
            live.entries.clear();
            count
        };
        self.store
            .update_where(|_, record| std::mem::take(&mut record.attributes.is_loaded))
            .await
            .or_raise(store_failed)?;
        Ok(count)
    }
}
