//! Kind-specific attributes, one struct per artifact kind.
//!
//! Every struct is `#[serde(default)]` so that a record missing a newer
//! attribute still loads (with the attribute at its zero value).

use crate::models::Bounds;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelAttributes {
    pub vertex_count: u64,
    pub face_count: u64,
    pub material_count: u64,
    pub animation_count: u64,
    /// Parsed from a `_lod<n>` file name suffix; `None` when there isn't one.
    pub lod_level: Option<u32>,
    pub bounds: Bounds,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureAttributes {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub has_alpha: bool,
    pub color_space: String,
    pub has_mipmaps: bool,
    /// Target format of the last compression pass, if any.
    pub compression: Option<String>,
}
impl TextureAttributes {
    /// Both sides are powers of two. `1` counts (2⁰).
    pub fn is_power_of_two(&self) -> bool {
        self.width.is_power_of_two() && self.height.is_power_of_two()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioAttributes {
    pub duration_s: f64,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub bit_depth: u16,
    pub bitrate_bps: u64,
    pub is_compressed: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationAttributes {
    pub duration_s: f64,
    pub frame_count: u64,
    pub fps: f64,
    pub channel_count: u64,
    pub is_looping: bool,
    pub has_weights: bool,
    pub has_morphs: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialAttributes {
    /// `"PBR"` or `"Standard"`.
    #[serde(rename = "type")]
    pub material_type: String,
    pub is_pbr: bool,
    pub is_transparent: bool,
    pub has_texture_map: bool,
    pub has_normal_map: bool,
    pub has_roughness_map: bool,
    pub has_metalness_map: bool,
    pub has_emission_map: bool,
    pub has_ao_map: bool,
    /// Names of textures the material samples.
    pub textures: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderType {
    Vertex,
    Fragment,
    Geometry,
    Compute,
    Tessellation,
}
impl ShaderType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "vert" | "vs" => Some(Self::Vertex),
            "frag" | "fs" => Some(Self::Fragment),
            "geom" | "gs" => Some(Self::Geometry),
            "comp" | "cs" => Some(Self::Compute),
            "tesc" | "tese" => Some(Self::Tessellation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Fragment => "fragment",
            Self::Geometry => "geometry",
            Self::Compute => "compute",
            Self::Tessellation => "tessellation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderAttributes {
    /// `None` when neither the extension nor the source says what stage it is.
    pub shader_type: Option<ShaderType>,
    /// From the `#version` line; `None` when the source has none.
    pub glsl_version: Option<String>,
    pub uniforms: Vec<String>,
    pub attributes: Vec<String>,
    pub varyings: Vec<String>,
    /// Source writes `gl_Position`.
    pub has_vertex_output: bool,
    /// Source writes `gl_FragColor`.
    pub has_fragment_output: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneAttributes {
    pub has_environment: bool,
    pub has_lighting: bool,
    pub has_physics: bool,
    pub has_audio: bool,
    pub has_scripts: bool,
    pub objects: Vec<String>,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefabAttributes {
    pub has_mesh: bool,
    pub has_materials: bool,
    pub has_animations: bool,
    pub has_physics: bool,
    pub has_scripts: bool,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectAttributes {
    pub duration_s: f64,
    pub is_looping: bool,
    pub has_particles: bool,
    pub has_lighting: bool,
    pub has_post_processing: bool,
    pub shaders: Vec<String>,
    pub textures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigAttributes {
    #[serde(rename = "type")]
    pub config_type: String,
    pub has_graphics: bool,
    pub has_audio: bool,
    pub has_input: bool,
    pub has_network: bool,
    pub has_physics: bool,
    pub has_ui: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateAttributes {
    #[serde(rename = "type")]
    pub state_type: String,
    pub is_persistent: bool,
    pub is_volatile: bool,
    pub is_shared: bool,
    pub dependencies: Vec<String>,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventAttributes {
    #[serde(rename = "type")]
    pub event_type: String,
    pub is_async: bool,
    pub is_broadcast: bool,
    /// Names of attached handlers, in registration order.
    pub handlers: Vec<String>,
    pub trigger_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_triggered_at: Option<OffsetDateTime>,
}

/// Loose resources served by the resource loader.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceAttributes {
    pub is_loaded: bool,
    pub is_cached: bool,
    pub is_shared: bool,
    pub dependencies: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1, true)]
    #[case(1024, 512, true)]
    #[case(1000, 512, false)]
    #[case(0, 0, false)]
    fn test_power_of_two(#[case] width: u32, #[case] height: u32, #[case] expected: bool) {
        let texture = TextureAttributes { width, height, ..Default::default() };
        assert_eq!(texture.is_power_of_two(), expected);
    }

    #[rstest]
    #[case("vert", Some(ShaderType::Vertex))]
    #[case("FRAG", Some(ShaderType::Fragment))]
    #[case("comp", Some(ShaderType::Compute))]
    #[case("glsl", None)]
    fn test_shader_type_from_extension(#[case] ext: &str, #[case] expected: Option<ShaderType>) {
        assert_eq!(ShaderType::from_extension(ext), expected);
    }

    #[test]
    fn test_event_without_trigger_time() {
        let event: EventAttributes = serde_json::from_str(r#"{"type":"ui","is_async":true}"#).unwrap();
        assert!(event.is_async);
        assert_eq!(event.last_triggered_at, None);
        assert_eq!(event.event_type, "ui");
    }
}
