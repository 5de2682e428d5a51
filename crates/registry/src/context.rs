use crate::error::{ErrorKind, Ledger, Result};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::instrument;
use wold_cache::CacheStore;
use wold_graph::DependencyGraph;
use wold_observe::{CommunicationManager, ErrorManager};
use wold_storage::{BackendHandle, HashIndex, temporary_sibling};

/// Everything the registries share: the asset tree, the hash cache, the
/// derived-artifact cache, the dependency graph, the error ledger and the
/// message bus.
///
/// Cloning is cheap; every clone points at the same components.
#[derive(Debug, Clone)]
pub struct Context {
    pub backend: BackendHandle,
    pub hashes: Arc<HashIndex>,
    pub cache: Arc<CacheStore>,
    pub graph: Arc<DependencyGraph>,
    pub errors: Arc<ErrorManager>,
    pub bus: Arc<CommunicationManager>,
}

impl Context {
    #[instrument(skip_all, fields(backend = %backend.name()))]
    pub async fn open(backend: BackendHandle, hash_block_size: usize) -> Result<Self> {
        let cache = CacheStore::open(backend.clone()).await.or_raise(|| ErrorKind::Store("cache".to_string()))?;
        let graph =
            DependencyGraph::open(backend.clone()).await.or_raise(|| ErrorKind::Store("dependency".to_string()))?;
        let errors = ErrorManager::open(backend.clone()).await.or_raise(|| ErrorKind::Store("error".to_string()))?;
        Ok(Self {
            backend,
            hashes: Arc::new(HashIndex::with_block_size(hash_block_size)),
            cache: Arc::new(cache),
            graph: Arc::new(graph),
            errors: Arc::new(errors),
            bus: Arc::new(CommunicationManager::new()),
        })
    }

    pub(crate) fn ledger(&self) -> Ledger {
        Ledger::new(self.errors.clone())
    }

    /// Absolute location of a record's `source_path`.
    pub fn locate(&self, source_path: &Path) -> Result<PathBuf> {
        if source_path.is_absolute() {
            return Ok(source_path.to_path_buf());
        }
        self.backend.resolve(source_path).or_raise(|| ErrorKind::Io(source_path.to_path_buf()))
    }

    /// What gets stored as `source_path`: relative to the asset root when the
    /// file lives under it, absolute otherwise.
    pub fn source_path_of(&self, absolute: &Path) -> PathBuf {
        self.backend.relativize(absolute).unwrap_or_else(|| absolute.to_path_buf())
    }

    pub(crate) async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let missing = || ErrorKind::NotFound(path.display().to_string());
        match self.backend.relativize(path) {
            Some(relative) => match self.backend.read(&relative).await {
                Ok(bytes) => Ok(bytes),
                Err(err) if err.is_not_found() => exn::bail!(missing()),
                Err(err) => Err(err).or_raise(|| ErrorKind::Io(path.to_path_buf())),
            },
            None => match fs::read(path).await {
                Ok(bytes) => Ok(bytes),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => exn::bail!(missing()),
                Err(err) => Err(err).or_raise(|| ErrorKind::Io(path.to_path_buf())),
            },
        }
    }

    /// Replace the file at `path` atomically, whether or not it lives under
    /// the asset root.
    pub(crate) async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(relative) = self.backend.relativize(path) {
            return self.backend.write_atomic(&relative, bytes).await.or_raise(|| ErrorKind::Io(path.to_path_buf()));
        }
        let staging = temporary_sibling(path);
        fs::write(&staging, bytes).await.or_raise(|| ErrorKind::Io(staging.clone()))?;
        if let Err(err) = fs::rename(&staging, path).await {
            if let Err(cleanup) = fs::remove_file(&staging).await {
                tracing::warn!(path = %staging.display(), error = ?cleanup, "Could not remove staging file");
            }
            return Err(err).or_raise(|| ErrorKind::Io(path.to_path_buf()));
        }
        Ok(())
    }

    /// Whether anything exists at `path`. Errors count as "no".
    pub(crate) async fn file_exists(&self, path: &Path) -> bool {
        match self.backend.relativize(path) {
            Some(relative) => self.backend.exists(&relative).await.unwrap_or(false),
            None => fs::try_exists(path).await.unwrap_or(false),
        }
    }
}
