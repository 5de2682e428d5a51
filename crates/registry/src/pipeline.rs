//! Transformation jobs over registered artifacts.
//!
//! Every job reads a source artifact, produces one or more derived files,
//! writes each into the cache (staged, then renamed) and registers it with
//! the source as its dependency. A job that fails or is cancelled takes its
//! outputs back: new ones are removed and outputs left by an earlier run are
//! restored as they were. The source is never touched,
//! except for the `has_mipmaps` flag a successful mipmap run sets.

use crate::Registries;
use crate::context::Context;
use crate::error::{ErrorKind, Result};
use crate::events::EventPayload;
use crate::kind::{ArtifactKind, Kind};
use crate::registry::{ArtifactRegistry, RegisterOptions, Registered};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use wold_codec::error::Result as CodecResult;
use wold_codec::mesh::{MeshSimplifier, QuadricSimplifier};
use wold_codec::{animation, audio, model, shader, texture};
use wold_config::PipelineConfig;

/// Topic a summary of every finished job is published on.
pub const PIPELINE_TOPIC: &str = "pipeline";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Decimate to at most `target_vertex_count` vertices.
    OptimizeModel { name: String, target_vertex_count: usize },
    ConvertFormat { kind: ArtifactKind, name: String, target_format: String },
    /// One output per ratio, `<name>_lod<i>`. Empty ratios mean the
    /// configured defaults.
    GenerateLod {
        name: String,
        #[serde(default)]
        ratios: Vec<f32>,
    },
    GenerateMipmaps { name: String, level_count: usize },
    CompressTexture { name: String, quality: u8, target_format: String },
    ResizeTexture { name: String, max_side: u32, maintain_aspect: bool },
    NormalizeAudio { name: String },
    TrimSilence { name: String, top_db: f32 },
    ResampleAnimation { name: String, target_fps: f64 },
    ExtractKeyframes { name: String, delta_threshold: f32 },
    /// Strip comments and blank lines from a shader.
    OptimizeShader { name: String },
}

impl Job {
    pub fn label(&self) -> &'static str {
        match self {
            Self::OptimizeModel { .. } => "optimize_model",
            Self::ConvertFormat { .. } => "convert_format",
            Self::GenerateLod { .. } => "generate_lod",
            Self::GenerateMipmaps { .. } => "generate_mipmaps",
            Self::CompressTexture { .. } => "compress_texture",
            Self::ResizeTexture { .. } => "resize_texture",
            Self::NormalizeAudio { .. } => "normalize_audio",
            Self::TrimSilence { .. } => "trim_silence",
            Self::ResampleAnimation { .. } => "resample_animation",
            Self::ExtractKeyframes { .. } => "extract_keyframes",
            Self::OptimizeShader { .. } => "optimize_shader",
        }
    }

    /// Name of the artifact the job reads.
    pub fn source(&self) -> &str {
        match self {
            Self::OptimizeModel { name, .. }
            | Self::ConvertFormat { name, .. }
            | Self::GenerateLod { name, .. }
            | Self::GenerateMipmaps { name, .. }
            | Self::CompressTexture { name, .. }
            | Self::ResizeTexture { name, .. }
            | Self::NormalizeAudio { name }
            | Self::TrimSilence { name, .. }
            | Self::ResampleAnimation { name, .. }
            | Self::ExtractKeyframes { name, .. }
            | Self::OptimizeShader { name } => name,
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::OptimizeModel { .. } | Self::GenerateLod { .. } => ArtifactKind::Model,
            Self::ConvertFormat { kind, .. } => *kind,
            Self::GenerateMipmaps { .. } | Self::CompressTexture { .. } | Self::ResizeTexture { .. } => {
                ArtifactKind::Texture
            },
            Self::NormalizeAudio { .. } | Self::TrimSilence { .. } => ArtifactKind::Audio,
            Self::ResampleAnimation { .. } | Self::ExtractKeyframes { .. } => ArtifactKind::Animation,
            Self::OptimizeShader { .. } => ArtifactKind::Shader,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job: &'static str,
    pub source: String,
    /// Registered outputs, in the order they were produced.
    pub outputs: Vec<String>,
    pub warnings: Vec<String>,
}

/// One output of a running job, with what it replaced.
#[derive(Debug)]
struct Output {
    kind: ArtifactKind,
    name: String,
    /// Cache file this run wrote. `None` when the bytes were already cached.
    cache_file: Option<String>,
    /// Record and graph edges the output had before this run.
    prior: Option<(Value, Vec<String>)>,
}

/// Outputs produced so far, so a failed job can take them back.
#[derive(Debug, Default)]
struct Produced {
    outputs: Vec<Output>,
    warnings: Vec<String>,
}

/// A job running on its own task.
#[derive(Debug)]
pub struct JobHandle {
    token: CancellationToken,
    handle: JoinHandle<Result<JobReport>>,
}

impl JobHandle {
    /// Ask the job to stop at its next step boundary.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<JobReport> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(err).or_raise(|| ErrorKind::Pipeline("job task".to_string())),
        }
    }
}

#[derive(Debug)]
pub struct PipelineRunner {
    ctx: Context,
    registries: Arc<Registries>,
    config: PipelineConfig,
}

/// Run CPU-bound codec work off the async threads.
async fn blocking<T, F>(step: &str, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> CodecResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .or_raise(|| ErrorKind::Pipeline(step.to_string()))?
        .or_raise(|| ErrorKind::Pipeline(step.to_string()))
}

fn checkpoint(token: &CancellationToken, job: &Job) -> Result<()> {
    match token.is_cancelled() {
        true => exn::bail!(ErrorKind::Cancelled(format!("{} of `{}`", job.label(), job.source()))),
        false => Ok(()),
    }
}

impl PipelineRunner {
    pub fn new(ctx: Context, registries: Arc<Registries>, config: PipelineConfig) -> Self {
        Self { ctx, registries, config }
    }

    pub async fn run(&self, job: Job) -> Result<JobReport> {
        self.run_with(job, CancellationToken::new()).await
    }

    /// Start `job` on its own task.
    pub fn spawn(self: &Arc<Self>, job: Job) -> JobHandle {
        let token = CancellationToken::new();
        let runner = self.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move { runner.run_with(job, child).await });
        JobHandle { token, handle }
    }

    /// Run `job`, checking `token` between steps.
    #[instrument(skip_all, fields(job = job.label(), source = %job.source(), outputs = tracing::field::Empty))]
    pub async fn run_with(&self, job: Job, token: CancellationToken) -> Result<JobReport> {
        let mut produced = Produced::default();
        let result = match checkpoint(&token, &job) {
            Ok(()) => self.execute(&job, &token, &mut produced).await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.take_back(&produced).await;
            produced.outputs.clear();
        }
        let outputs: Vec<String> = produced.outputs.into_iter().map(|output| output.name).collect();
        tracing::Span::current().record("outputs", outputs.len());

        let finished = EventPayload::PipelineFinished {
            job: job.label().to_string(),
            source: job.source().to_string(),
            outputs: outputs.clone(),
            ok: result.is_ok(),
        };
        match serde_json::to_value(&finished) {
            Ok(payload) => {
                self.ctx.bus.publish(PIPELINE_TOPIC, payload);
            },
            Err(err) => tracing::warn!(error = ?err, "Could not serialize pipeline summary"),
        }

        let result = result.map(|()| JobReport {
            job: job.label(),
            source: job.source().to_string(),
            outputs,
            warnings: produced.warnings,
        });
        self.ctx.ledger().track(job.label(), result).await
    }

    /// Put every output back the way it was before the run: new records
    /// and cache files go, records that existed already are restored.
    async fn take_back(&self, produced: &Produced) {
        for output in produced.outputs.iter().rev() {
            let (kind, name) = (output.kind, &output.name);
            let registry = self.registries.get(kind);
            let undone = match &output.prior {
                Some((record, dependencies)) => registry.restore(record.clone(), dependencies.clone()).await,
                None => registry.delete(name).await.map(|_| ()),
            };
            if let Err(err) = undone {
                tracing::warn!(kind = %kind, name = %name, error = ?err, "Could not take back output record");
            }
            if let Some(file) = &output.cache_file
                && let Err(err) = self.ctx.cache.remove_file(kind.as_str(), file).await
            {
                tracing::warn!(kind = %kind, name = %name, error = ?err, "Could not remove partial output file");
            }
        }
        if !produced.outputs.is_empty() {
            tracing::info!(outputs = produced.outputs.len(), "Took back pipeline outputs");
        }
    }

    /// Cache `bytes` as `output` and register it as derived from `source`.
    async fn emit<K: Kind>(
        &self,
        registry: &ArtifactRegistry<K>,
        kind: ArtifactKind,
        source: &str,
        output: String,
        ext: &str,
        bytes: Vec<u8>,
        produced: &mut Produced,
    ) -> Result<Registered<K::Attributes>> {
        let prior = match registry.get(&output).await {
            Some(record) => {
                let record =
                    serde_json::to_value(&record).or_raise(|| ErrorKind::Pipeline(format!("saving `{output}`")))?;
                let edges = self.ctx.graph.get(&output).await.map(|d| d.depends_on).unwrap_or_default();
                Some((record, edges))
            },
            None => None,
        };
        let cached: HashSet<String> = self
            .ctx
            .cache
            .entries(Some(K::NAME))
            .await
            .into_iter()
            .filter(|e| e.name == output)
            .map(|e| e.file)
            .collect();
        let path = self
            .ctx
            .cache
            .insert_bytes(&output, K::NAME, ext, &bytes, vec![source.to_string()])
            .await
            .or_raise(|| ErrorKind::Pipeline(format!("caching `{output}`")))?;
        let cache_file = path
            .file_name()
            .map(|file| file.to_string_lossy().into_owned())
            .filter(|file| !cached.contains(file));
        produced.outputs.push(Output { kind, name: output.clone(), cache_file, prior });
        let options = RegisterOptions::named(&output).depends_on([source]);
        let registered = registry
            .register_untracked(&path, options)
            .await
            .or_raise(|| ErrorKind::Pipeline(format!("registering `{output}`")))?;
        produced.warnings.extend(registered.warnings.iter().cloned());
        tracing::debug!(output = %output, "Pipeline output registered");
        Ok(registered)
    }

    async fn execute(&self, job: &Job, token: &CancellationToken, produced: &mut Produced) -> Result<()> {
        let r = &*self.registries;
        match job {
            Job::OptimizeModel { name, target_vertex_count } => {
                let (record, bytes) = r.models.read_source(name).await?;
                let format = record.common.format.clone();
                let (out, target) = (format!("{name}_optimized"), *target_vertex_count);
                let bytes = {
                    let (format, out) = (format.clone(), out.clone());
                    blocking("optimize_model", move || {
                        let mut source = model::read(&bytes, &format)?;
                        source.mesh = QuadricSimplifier::default().simplify(&source.mesh, target);
                        model::write(&source, &format, &out)
                    })
                    .await?
                };
                checkpoint(token, job)?;
                self.emit(&r.models, ArtifactKind::Model, name, out, &format, bytes, produced).await?;
            },
            Job::GenerateLod { name, ratios } => {
                let ratios = match ratios.is_empty() {
                    true => self.config.lod_ratios.clone(),
                    false => ratios.clone(),
                };
                if let Some(ratio) = ratios.iter().find(|r| !(**r > 0.0 && **r <= 1.0)) {
                    exn::bail!(ErrorKind::Pipeline(format!("LOD ratio {ratio} is outside (0, 1]")));
                }
                let (record, bytes) = r.models.read_source(name).await?;
                let format = record.common.format.clone();
                let source = {
                    let format = format.clone();
                    Arc::new(blocking("generate_lod", move || model::read(&bytes, &format)).await?)
                };
                for (level, ratio) in ratios.into_iter().enumerate() {
                    checkpoint(token, job)?;
                    let out = format!("{name}_lod{level}");
                    let target = ((record.attributes.vertex_count as f64 * f64::from(ratio)).ceil() as usize).max(1);
                    let bytes = {
                        let (source, format, out) = (source.clone(), format.clone(), out.clone());
                        blocking("generate_lod", move || {
                            let lod = model::Model {
                                mesh: QuadricSimplifier::default().simplify(&source.mesh, target),
                                materials: source.materials.clone(),
                            };
                            model::write(&lod, &format, &out)
                        })
                        .await?
                    };
                    self.emit(&r.models, ArtifactKind::Model, name, out, &format, bytes, produced).await?;
                }
            },
            Job::GenerateMipmaps { name, level_count } => {
                let (record, bytes) = r.textures.read_source(name).await?;
                let format = record.common.format.clone();
                let levels = *level_count;
                let images = blocking("generate_mipmaps", move || {
                    let image = texture::read(&bytes)?;
                    Ok(texture::mipmaps(&image, levels))
                })
                .await?;
                if images.is_empty() {
                    produced.warnings.push(format!("`{name}` is too small for any mipmap level"));
                }
                for (index, image) in images.into_iter().enumerate() {
                    checkpoint(token, job)?;
                    let bytes = {
                        let format = format.clone();
                        blocking("generate_mipmaps", move || texture::encode(&image, &format)).await?
                    };
                    let out = format!("{name}_mip{}", index + 1);
                    self.emit(&r.textures, ArtifactKind::Texture, name, out, &format, bytes, produced).await?;
                }
                checkpoint(token, job)?;
                r.textures.update(name, |record| record.attributes.has_mipmaps = true).await?;
            },
            Job::CompressTexture { name, quality, target_format } => {
                let target = target_format.to_ascii_lowercase();
                if !texture::FORMATS.contains(&target.as_str()) {
                    exn::bail!(ErrorKind::Pipeline(format!("cannot compress to `{target}`")));
                }
                let (_, bytes) = r.textures.read_source(name).await?;
                let quality = *quality;
                let bytes = {
                    let target = target.clone();
                    blocking("compress_texture", move || texture::compress(&texture::read(&bytes)?, &target, quality))
                        .await?
                };
                checkpoint(token, job)?;
                let out = format!("{name}_compressed");
                self.emit(&r.textures, ArtifactKind::Texture, name, out.clone(), &target, bytes, produced).await?;
                let compression = format!("{target}:q{quality}");
                r.textures.update(&out, |record| record.attributes.compression = Some(compression)).await?;
            },
            Job::ResizeTexture { name, max_side, maintain_aspect } => {
                let (record, bytes) = r.textures.read_source(name).await?;
                let format = record.common.format.clone();
                let (max_side, keep) = (*max_side, *maintain_aspect);
                let bytes = {
                    let format = format.clone();
                    blocking("resize_texture", move || {
                        let resized = texture::resize(&texture::read(&bytes)?, max_side, keep)?;
                        texture::encode(&resized, &format)
                    })
                    .await?
                };
                checkpoint(token, job)?;
                let out = format!("{name}_{max_side}");
                self.emit(&r.textures, ArtifactKind::Texture, name, out, &format, bytes, produced).await?;
            },
            Job::NormalizeAudio { name } => {
                let (_, bytes) = r.audio.read_source(name).await?;
                let bytes = blocking("normalize_audio", move || {
                    let mut buffer = audio::read(&bytes)?;
                    audio::normalize(&mut buffer);
                    audio::write(&buffer)
                })
                .await?;
                checkpoint(token, job)?;
                let out = format!("{name}_normalized");
                self.emit(&r.audio, ArtifactKind::Audio, name, out, "wav", bytes, produced).await?;
            },
            Job::TrimSilence { name, top_db } => {
                let (_, bytes) = r.audio.read_source(name).await?;
                let top_db = *top_db;
                let bytes = blocking("trim_silence", move || {
                    let buffer = audio::read(&bytes)?;
                    audio::write(&audio::trim_silence(&buffer, top_db))
                })
                .await?;
                checkpoint(token, job)?;
                let out = format!("{name}_trimmed");
                self.emit(&r.audio, ArtifactKind::Audio, name, out, "wav", bytes, produced).await?;
            },
            Job::ResampleAnimation { name, target_fps } => {
                let (record, bytes) = r.animations.read_source(name).await?;
                let format = writable_animation_format(&record.common.format);
                let fps = *target_fps;
                let bytes = {
                    let (source_format, format) = (record.common.format.clone(), format.to_string());
                    blocking("resample_animation", move || {
                        animation::write(&animation::read(&bytes, &source_format)?.resample(fps)?, &format)
                    })
                    .await?
                };
                checkpoint(token, job)?;
                let out = format!("{name}_{fps}fps");
                self.emit(&r.animations, ArtifactKind::Animation, name, out, format, bytes, produced).await?;
            },
            Job::ExtractKeyframes { name, delta_threshold } => {
                let (record, bytes) = r.animations.read_source(name).await?;
                let format = writable_animation_format(&record.common.format);
                let threshold = *delta_threshold;
                let bytes = {
                    let (source_format, format) = (record.common.format.clone(), format.to_string());
                    blocking("extract_keyframes", move || {
                        let clip = animation::read(&bytes, &source_format)?.extract_keyframes(threshold)?;
                        animation::write(&clip, &format)
                    })
                    .await?
                };
                checkpoint(token, job)?;
                let out = format!("{name}_keyframes");
                self.emit(&r.animations, ArtifactKind::Animation, name, out, format, bytes, produced).await?;
            },
            Job::OptimizeShader { name } => {
                let (record, bytes) = r.shaders.read_source(name).await?;
                let stripped = shader::strip(&String::from_utf8_lossy(&bytes));
                let out = format!("{name}_stripped");
                let format = record.common.format.clone();
                self.emit(&r.shaders, ArtifactKind::Shader, name, out, &format, stripped.into_bytes(), produced)
                    .await?;
            },
            Job::ConvertFormat { kind, name, target_format } => {
                self.convert(*kind, name, &target_format.to_ascii_lowercase(), token, job, produced).await?;
            },
        }
        Ok(())
    }

    async fn convert(
        &self,
        kind: ArtifactKind,
        name: &str,
        target: &str,
        token: &CancellationToken,
        job: &Job,
        produced: &mut Produced,
    ) -> Result<()> {
        let r = &*self.registries;
        let out = format!("{name}_{target}");
        let target_owned = target.to_string();
        match kind {
            ArtifactKind::Model => {
                let (record, bytes) = r.models.read_source(name).await?;
                let (format, out_name) = (record.common.format.clone(), out.clone());
                let bytes = blocking("convert_format", move || {
                    model::write(&model::read(&bytes, &format)?, &target_owned, &out_name)
                })
                .await?;
                checkpoint(token, job)?;
                self.emit(&r.models, kind, name, out, target, bytes, produced).await?;
            },
            ArtifactKind::Texture => {
                let (_, bytes) = r.textures.read_source(name).await?;
                let bytes =
                    blocking("convert_format", move || texture::encode(&texture::read(&bytes)?, &target_owned)).await?;
                checkpoint(token, job)?;
                self.emit(&r.textures, kind, name, out, target, bytes, produced).await?;
            },
            ArtifactKind::Audio => {
                if !audio::FORMATS.contains(&target) {
                    exn::bail!(ErrorKind::Pipeline(format!("cannot convert audio to `{target}`")));
                }
                let (_, bytes) = r.audio.read_source(name).await?;
                let bytes = blocking("convert_format", move || audio::write(&audio::read(&bytes)?)).await?;
                checkpoint(token, job)?;
                self.emit(&r.audio, kind, name, out, target, bytes, produced).await?;
            },
            ArtifactKind::Animation => {
                let (record, bytes) = r.animations.read_source(name).await?;
                let format = record.common.format.clone();
                let bytes = blocking("convert_format", move || {
                    animation::write(&animation::read(&bytes, &format)?, &target_owned)
                })
                .await?;
                checkpoint(token, job)?;
                self.emit(&r.animations, kind, name, out, target, bytes, produced).await?;
            },
            other => exn::bail!(ErrorKind::Pipeline(format!("{other} artifacts can't be converted"))),
        }
        Ok(())
    }
}

/// glTF JSON can't carry the binary keyframe buffers this writer produces,
/// so `.gltf` sources come out as `.glb`.
fn writable_animation_format(format: &str) -> &'static str {
    match format {
        "json" => "json",
        "anim" => "anim",
        _ => "glb",
    }
}
