//! What sets one artifact kind apart from another: its name, the formats it
//! accepts, its decoder and the attributes its records carry.

use crate::error::{Error, ErrorKind};
use derive_more::Display;
use exn::OptionExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::str::FromStr;
use wold_codec::error::Result as CodecResult;
use wold_codec::{Decoded, animation, audio, document, model, shader, texture};
use wold_metadata::models::{
    AnimationAttributes, AudioAttributes, ConfigAttributes, EffectAttributes, EventAttributes, MaterialAttributes,
    ModelAttributes, PrefabAttributes, SceneAttributes, ShaderAttributes, StateAttributes, TextureAttributes,
};

/// One kind of artifact. Implemented by the marker types in this module and
/// used to parameterize [`ArtifactRegistry`](crate::ArtifactRegistry).
pub trait Kind: Send + Sync + 'static {
    type Attributes: Serialize + DeserializeOwned + Clone + Default + PartialEq + Debug + Send + Sync + 'static;

    /// Singular name, used for directories and as the record's `kind`.
    const NAME: &'static str;
    /// Lowercase extensions the decoder accepts.
    const FORMATS: &'static [&'static str];
    /// Artifacts of this kind are JSON documents the registry may rewrite.
    const AUTHORED: bool = false;

    fn decode(bytes: &[u8], format: &str, name: &str, size_bytes: u64) -> CodecResult<Decoded<Self::Attributes>>;

    /// Keep what the decoder can't see in the file from the previous record.
    /// Only called when the file's hash changed; an unchanged file keeps its
    /// record as it is.
    fn carry_over(_previous: &Self::Attributes, _next: &mut Self::Attributes) {}

    /// Kind-specific problems worth a validation warning.
    fn check(_bytes: &[u8], _attributes: &Self::Attributes) -> Vec<String> {
        Vec::new()
    }

    /// `(group, value)` pairs counted by the registry's statistics.
    fn groups(_attributes: &Self::Attributes) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// Every artifact kind as a value, for callers that pick one at runtime.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    #[display("model")]
    Model,
    #[display("texture")]
    Texture,
    #[display("audio")]
    Audio,
    #[display("animation")]
    Animation,
    #[display("material")]
    Material,
    #[display("shader")]
    Shader,
    #[display("scene")]
    Scene,
    #[display("prefab")]
    Prefab,
    #[display("effect")]
    Effect,
    #[display("config")]
    Config,
    #[display("state")]
    State,
    #[display("event")]
    Event,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 12] = [
        Self::Model,
        Self::Texture,
        Self::Audio,
        Self::Animation,
        Self::Material,
        Self::Shader,
        Self::Scene,
        Self::Prefab,
        Self::Effect,
        Self::Config,
        Self::State,
        Self::Event,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => Model::NAME,
            Self::Texture => Texture::NAME,
            Self::Audio => Audio::NAME,
            Self::Animation => Animation::NAME,
            Self::Material => Material::NAME,
            Self::Shader => Shader::NAME,
            Self::Scene => Scene::NAME,
            Self::Prefab => Prefab::NAME,
            Self::Effect => Effect::NAME,
            Self::Config => Config::NAME,
            Self::State => State::NAME,
            Self::Event => Event::NAME,
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = Error;

    /// Accepts the singular or the plural (`model`, `models`).
    fn from_str(s: &str) -> Result<Self, Error> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| lower == k.as_str() || lower == wold_storage::layout::plural(k.as_str()))
            .ok_or_raise(|| ErrorKind::NotFound(format!("artifact kind `{s}`")))
    }
}

pub struct Model;
impl Kind for Model {
    type Attributes = ModelAttributes;
    const NAME: &'static str = "model";
    const FORMATS: &'static [&'static str] = model::FORMATS;

    fn decode(bytes: &[u8], format: &str, name: &str, _size_bytes: u64) -> CodecResult<Decoded<ModelAttributes>> {
        model::decode(bytes, format, name)
    }

    fn check(_bytes: &[u8], attributes: &ModelAttributes) -> Vec<String> {
        let mut warnings = Vec::new();
        if attributes.vertex_count == 0 {
            warnings.push("model has no vertices".to_string());
        }
        if attributes.material_count == 0 {
            warnings.push("model has no materials".to_string());
        }
        warnings
    }

    fn groups(attributes: &ModelAttributes) -> Vec<(&'static str, String)> {
        let lod = attributes.lod_level.map_or_else(|| "none".to_string(), |l| l.to_string());
        vec![("lod_level", lod), ("has_animations", (attributes.animation_count > 0).to_string())]
    }
}

pub struct Texture;
impl Kind for Texture {
    type Attributes = TextureAttributes;
    const NAME: &'static str = "texture";
    const FORMATS: &'static [&'static str] = texture::FORMATS;

    fn decode(bytes: &[u8], format: &str, _name: &str, _size_bytes: u64) -> CodecResult<Decoded<TextureAttributes>> {
        texture::decode(bytes, format)
    }

    fn check(_bytes: &[u8], attributes: &TextureAttributes) -> Vec<String> {
        match attributes.is_power_of_two() {
            true => Vec::new(),
            false => vec![format!("{}x{} is not a power of two", attributes.width, attributes.height)],
        }
    }

    fn groups(attributes: &TextureAttributes) -> Vec<(&'static str, String)> {
        vec![
            ("color_space", attributes.color_space.clone()),
            ("power_of_two", attributes.is_power_of_two().to_string()),
        ]
    }
}

pub struct Audio;
impl Kind for Audio {
    type Attributes = AudioAttributes;
    const NAME: &'static str = "audio";
    const FORMATS: &'static [&'static str] = audio::FORMATS;

    fn decode(bytes: &[u8], format: &str, _name: &str, size_bytes: u64) -> CodecResult<Decoded<AudioAttributes>> {
        audio::decode(bytes, format, size_bytes)
    }

    fn check(_bytes: &[u8], attributes: &AudioAttributes) -> Vec<String> {
        match attributes.duration_s > 0.0 {
            true => Vec::new(),
            false => vec!["audio has no samples".to_string()],
        }
    }

    fn groups(attributes: &AudioAttributes) -> Vec<(&'static str, String)> {
        vec![
            ("sample_rate", attributes.sample_rate.to_string()),
            ("channel_count", attributes.channel_count.to_string()),
        ]
    }
}

pub struct Animation;
impl Kind for Animation {
    type Attributes = AnimationAttributes;
    const NAME: &'static str = "animation";
    const FORMATS: &'static [&'static str] = animation::FORMATS;

    fn decode(bytes: &[u8], format: &str, _name: &str, _size_bytes: u64) -> CodecResult<Decoded<AnimationAttributes>> {
        animation::decode(bytes, format)
    }

    fn check(_bytes: &[u8], attributes: &AnimationAttributes) -> Vec<String> {
        match attributes.duration_s > 0.0 {
            true => Vec::new(),
            false => vec!["animation has zero duration".to_string()],
        }
    }

    fn groups(attributes: &AnimationAttributes) -> Vec<(&'static str, String)> {
        vec![("channel_count", attributes.channel_count.to_string())]
    }
}

pub struct Shader;
impl Kind for Shader {
    type Attributes = ShaderAttributes;
    const NAME: &'static str = "shader";
    const FORMATS: &'static [&'static str] = shader::FORMATS;

    fn decode(bytes: &[u8], format: &str, _name: &str, _size_bytes: u64) -> CodecResult<Decoded<ShaderAttributes>> {
        shader::decode(bytes, format)
    }

    fn check(bytes: &[u8], attributes: &ShaderAttributes) -> Vec<String> {
        shader::check(&String::from_utf8_lossy(bytes), attributes)
    }

    fn groups(attributes: &ShaderAttributes) -> Vec<(&'static str, String)> {
        let shader_type = attributes.shader_type.map_or("unknown", |t| t.as_str()).to_string();
        let version = attributes.glsl_version.clone().unwrap_or_else(|| "none".to_string());
        vec![("shader_type", shader_type), ("glsl_version", version)]
    }
}

/// JSON-authored kinds share their decoder; only the attribute type and the
/// statistics groups differ.
macro_rules! authored_kind {
    ($marker:ident, $attributes:ty, $name:literal, |$a:ident| $groups:expr) => {
        pub struct $marker;
        impl Kind for $marker {
            type Attributes = $attributes;
            const NAME: &'static str = $name;
            const FORMATS: &'static [&'static str] = document::FORMATS;
            const AUTHORED: bool = true;

            fn decode(bytes: &[u8], _format: &str, _name: &str, _size_bytes: u64) -> CodecResult<Decoded<$attributes>> {
                document::decode::<$attributes>(bytes)
            }

            fn carry_over(previous: &$attributes, next: &mut $attributes) {
                carry(previous, next);
            }

            fn groups($a: &$attributes) -> Vec<(&'static str, String)> {
                $groups
            }
        }
    };
}

/// Per-attribute-type bookkeeping that lives outside the document.
trait Carry {
    fn carry(_previous: &Self, _next: &mut Self) {}
}

fn carry<A: Carry>(previous: &A, next: &mut A) {
    A::carry(previous, next)
}

impl Carry for MaterialAttributes {}
impl Carry for SceneAttributes {}
impl Carry for PrefabAttributes {}
impl Carry for EffectAttributes {}
impl Carry for ConfigAttributes {}
impl Carry for StateAttributes {}
impl Carry for EventAttributes {
    fn carry(previous: &Self, next: &mut Self) {
        next.trigger_count = previous.trigger_count;
        next.last_triggered_at = previous.last_triggered_at;
    }
}

authored_kind!(Material, MaterialAttributes, "material", |a| vec![
    ("material_type", a.material_type.clone()),
    ("is_pbr", a.is_pbr.to_string()),
]);
authored_kind!(Scene, SceneAttributes, "scene", |a| vec![("object_count", a.objects.len().to_string())]);
authored_kind!(Prefab, PrefabAttributes, "prefab", |_a| Vec::new());
authored_kind!(Effect, EffectAttributes, "effect", |a| vec![("is_looping", a.is_looping.to_string())]);
authored_kind!(Config, ConfigAttributes, "config", |a| vec![("type", a.config_type.clone())]);
authored_kind!(State, StateAttributes, "state", |a| vec![("type", a.state_type.clone())]);
authored_kind!(Event, EventAttributes, "event", |a| vec![
    ("type", a.event_type.clone()),
    ("is_async", a.is_async.to_string()),
    ("is_broadcast", a.is_broadcast.to_string()),
]);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("model", ArtifactKind::Model)]
    #[case("Textures", ArtifactKind::Texture)]
    #[case("audios", ArtifactKind::Audio)]
    #[case("event", ArtifactKind::Event)]
    fn test_kind_from_str(#[case] input: &str, #[case] expected: ArtifactKind) {
        assert_eq!(input.parse::<ArtifactKind>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_kind() {
        let err = "blueprint".parse::<ArtifactKind>().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_texture_flags_drop_with_new_pixels() {
        // Mipmaps and compression were made from the old pixels.
        let previous = TextureAttributes { has_mipmaps: true, compression: Some("jpg".into()), ..Default::default() };
        let mut changed = TextureAttributes::default();
        Texture::carry_over(&previous, &mut changed);
        assert!(!changed.has_mipmaps);
        assert_eq!(changed.compression, None);
    }

    #[test]
    fn test_event_trigger_bookkeeping_is_carried() {
        let previous = EventAttributes { trigger_count: 3, ..Default::default() };
        let mut next = EventAttributes { handlers: vec!["audit".into()], ..Default::default() };
        Event::carry_over(&previous, &mut next);
        assert_eq!(next.trigger_count, 3);
        assert_eq!(next.handlers, ["audit"]);
    }
}
