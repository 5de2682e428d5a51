//! The asset registry proper.
//!
//! One [`ArtifactRegistry`] per artifact kind, all sharing a [`Context`]:
//! the asset tree, the hash index, the cache of derived files, the
//! dependency graph, the error ledger and the message bus. On top of those
//! sit the [`ResourceLoader`], the [`PipelineRunner`], the [`EventManager`],
//! the [`SettingsManager`] and the [`VersionManager`]. [`Assets`] opens the
//! whole set from a [`Config`].

mod context;
pub mod error;
pub mod events;
pub mod kind;
pub mod loader;
pub mod pipeline;
pub mod registry;
pub mod settings;
pub mod versions;

pub use crate::context::Context;
pub use crate::events::{EventDefinition, EventManager, EventPayload, Handler, ParamType, TriggerReport};
pub use crate::kind::{ArtifactKind, Kind};
pub use crate::loader::{Resource, ResourceLoader, ResourceOptions};
pub use crate::pipeline::{Job, JobHandle, JobReport, PipelineRunner};
pub use crate::registry::{
    AnyRegistry, ArtifactRegistry, Outcome, RegisterOptions, Registered, RegistryStats, ScanEvent, ValidationReport,
    ValidationWarning,
};
pub use crate::settings::{Constraints, NewSetting, Setting, SettingType, SettingsManager};
pub use crate::versions::{Channels, NewVersion, SemVer, VersionManager, VersionRecord};

use crate::error::{ErrorKind, Result};
use crate::kind::{Animation, Audio, Config as ConfigKind, Effect, Event, Material, Model, Prefab, Scene, Shader, State, Texture};
use exn::ResultExt;
use std::sync::Arc;
use tracing::instrument;
use wold_config::Config;
use wold_observe::{ConnectionManager, LogManager};
use wold_storage::{BackendHandle, LocalBackend};

/// One registry per kind.
#[derive(Debug)]
pub struct Registries {
    pub models: ArtifactRegistry<Model>,
    pub textures: ArtifactRegistry<Texture>,
    pub audio: ArtifactRegistry<Audio>,
    pub animations: ArtifactRegistry<Animation>,
    pub materials: ArtifactRegistry<Material>,
    pub shaders: ArtifactRegistry<Shader>,
    pub scenes: ArtifactRegistry<Scene>,
    pub prefabs: ArtifactRegistry<Prefab>,
    pub effects: ArtifactRegistry<Effect>,
    pub configs: ArtifactRegistry<ConfigKind>,
    pub states: ArtifactRegistry<State>,
    pub events: ArtifactRegistry<Event>,
}

impl Registries {
    pub async fn open(ctx: &Context) -> Result<Self> {
        Ok(Self {
            models: ArtifactRegistry::open(ctx.clone()).await?,
            textures: ArtifactRegistry::open(ctx.clone()).await?,
            audio: ArtifactRegistry::open(ctx.clone()).await?,
            animations: ArtifactRegistry::open(ctx.clone()).await?,
            materials: ArtifactRegistry::open(ctx.clone()).await?,
            shaders: ArtifactRegistry::open(ctx.clone()).await?,
            scenes: ArtifactRegistry::open(ctx.clone()).await?,
            prefabs: ArtifactRegistry::open(ctx.clone()).await?,
            effects: ArtifactRegistry::open(ctx.clone()).await?,
            configs: ArtifactRegistry::open(ctx.clone()).await?,
            states: ArtifactRegistry::open(ctx.clone()).await?,
            events: ArtifactRegistry::open(ctx.clone()).await?,
        })
    }

    pub fn get(&self, kind: ArtifactKind) -> &dyn AnyRegistry {
        match kind {
            ArtifactKind::Model => &self.models,
            ArtifactKind::Texture => &self.textures,
            ArtifactKind::Audio => &self.audio,
            ArtifactKind::Animation => &self.animations,
            ArtifactKind::Material => &self.materials,
            ArtifactKind::Shader => &self.shaders,
            ArtifactKind::Scene => &self.scenes,
            ArtifactKind::Prefab => &self.prefabs,
            ArtifactKind::Effect => &self.effects,
            ArtifactKind::Config => &self.configs,
            ArtifactKind::State => &self.states,
            ArtifactKind::Event => &self.events,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &dyn AnyRegistry> {
        ArtifactKind::ALL.into_iter().map(|kind| self.get(kind))
    }
}

/// Everything, opened over one asset root.
#[derive(Debug)]
pub struct Assets {
    pub context: Context,
    pub registries: Arc<Registries>,
    pub loader: ResourceLoader,
    pub pipeline: Arc<PipelineRunner>,
    pub events: EventManager,
    pub settings: SettingsManager,
    pub versions: VersionManager,
    pub logs: LogManager,
    pub connections: ConnectionManager,
}

impl Assets {
    /// Open the asset tree at `config.assets_root`, creating it if needed.
    #[instrument(skip_all, fields(root = %config.assets_root.display()))]
    pub async fn open(config: &Config) -> Result<Self> {
        let root = &config.assets_root;
        tokio::fs::create_dir_all(root).await.or_raise(|| ErrorKind::Io(root.clone()))?;
        let root = tokio::fs::canonicalize(root).await.or_raise(|| ErrorKind::Io(root.clone()))?;
        let backend: BackendHandle =
            Arc::new(LocalBackend::new("assets", &root).or_raise(|| ErrorKind::Io(root.clone()))?);
        Self::open_with(backend, config).await
    }

    pub async fn open_with(backend: BackendHandle, config: &Config) -> Result<Self> {
        let context = Context::open(backend.clone(), config.hashing.block_size).await?;
        let registries = Arc::new(Registries::open(&context).await?);
        let loader = ResourceLoader::open(context.clone(), config.loader.capacity).await?;
        let pipeline =
            Arc::new(PipelineRunner::new(context.clone(), registries.clone(), config.pipeline.clone()));
        let events = EventManager::new(registries.clone());
        let settings = SettingsManager::open(context.clone()).await?;
        let versions = VersionManager::open(context.clone()).await?;
        let logs = LogManager::open(backend).await.or_raise(|| ErrorKind::Store(wold_observe::log::KIND.to_string()))?;
        tracing::debug!("Asset registry open");
        Ok(Self {
            context,
            registries,
            loader,
            pipeline,
            events,
            settings,
            versions,
            logs,
            connections: ConnectionManager::new(),
        })
    }
}
