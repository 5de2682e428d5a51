//! Keyframe animation clips.
//!
//! A [`Clip`] is a set of tracks, each animating one property of one target
//! with its own keyframe times. Clips are read from the first animation of a
//! glTF asset or from a JSON clip document:
//!
//! ```json
//! {
//!   "name": "wave",
//!   "is_looping": true,
//!   "tracks": [
//!     { "target": "arm", "path": "rotation", "times": [0.0, 0.5], "values": [[0, 0, 0, 1], [0, 0.7, 0, 0.7]] }
//!   ]
//! }
//! ```

use crate::Decoded;
use crate::error::{ErrorKind, Result};
use crate::gltf::{self, AnimationTrackData, Gltf};
use exn::{OptionExt, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use wold_metadata::models::AnimationAttributes;

pub const FORMATS: &[&str] = &["glb", "gltf", "json", "anim"];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Clip {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_looping: bool,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub target: String,
    /// `translation`, `rotation`, `scale` or `weights`.
    pub path: String,
    pub times: Vec<f32>,
    /// One value vector per keyframe.
    pub values: Vec<Vec<f32>>,
}

impl Track {
    fn validate(&self) -> Result<()> {
        if self.times.len() != self.values.len() {
            exn::bail!(ErrorKind::malformed(format!("clip track `{}`: times and values differ in length", self.target)));
        }
        if self.times.windows(2).any(|w| w[1] < w[0]) {
            exn::bail!(ErrorKind::malformed(format!("clip track `{}`: times go backwards", self.target)));
        }
        Ok(())
    }

    fn end(&self) -> f32 {
        self.times.last().copied().unwrap_or(0.0)
    }

    /// Linear interpolation between the keyframes around `t`, clamped to the
    /// first and last keyframe.
    fn sample(&self, t: f32) -> Vec<f32> {
        let next = self.times.partition_point(|&k| k <= t);
        match next {
            0 => self.values.first().cloned().unwrap_or_default(),
            n if n >= self.times.len() => self.values.last().cloned().unwrap_or_default(),
            n => {
                let (t0, t1) = (self.times[n - 1], self.times[n]);
                let f = if t1 > t0 { (t - t0) / (t1 - t0) } else { 0.0 };
                self.values[n - 1].iter().zip(&self.values[n]).map(|(a, b)| a + (b - a) * f).collect()
            },
        }
    }
}

impl Clip {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let clip: Clip = serde_json::from_slice(bytes).or_raise(|| ErrorKind::malformed("clip JSON"))?;
        clip.validate()?;
        Ok(clip)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).or_raise(|| ErrorKind::Encode("clip JSON"))
    }

    /// The first animation of a glTF asset. Targets are named after their
    /// node, or `node<i>` for unnamed nodes.
    pub fn from_gltf(gltf: &Gltf) -> Result<Self> {
        let animation = gltf.document.animations.first().ok_or_raise(|| ErrorKind::malformed("glTF: no animation"))?;
        let mut tracks = Vec::with_capacity(animation.channels.len());
        for channel in &animation.channels {
            let (times, flat) = gltf.read_channel(animation, channel)?;
            let width = match channel.target.path.as_str() {
                "translation" | "scale" => 3,
                "rotation" => 4,
                _ if times.is_empty() => 1,
                _ => (flat.len() / times.len()).max(1),
            };
            let target = channel
                .target
                .node
                .map(|n| {
                    gltf.document
                        .nodes
                        .get(n)
                        .and_then(|node| node.get("name"))
                        .and_then(Value::as_str)
                        .map_or_else(|| format!("node{n}"), str::to_string)
                })
                .unwrap_or_default();
            tracks.push(Track {
                target,
                path: channel.target.path.clone(),
                times,
                values: flat.chunks(width).map(<[f32]>::to_vec).collect(),
            });
        }
        let clip = Clip {
            name: animation.name.clone().unwrap_or_default(),
            is_looping: false,
            tracks,
        };
        clip.validate()?;
        Ok(clip)
    }

    /// A GLB holding one node per distinct target and this clip as its only
    /// animation.
    pub fn to_glb(&self) -> Result<Vec<u8>> {
        let mut document = gltf::asset_header();
        let mut nodes: BTreeMap<&str, usize> = BTreeMap::new();
        for track in &self.tracks {
            let next = nodes.len();
            nodes.entry(track.target.as_str()).or_insert(next);
        }
        let mut named: Vec<(&str, usize)> = nodes.iter().map(|(name, i)| (*name, *i)).collect();
        named.sort_by_key(|(_, i)| *i);
        document.insert("nodes".into(), named.iter().map(|(name, _)| json!({ "name": name })).collect());
        document.insert("scene".into(), 0.into());
        document.insert("scenes".into(), json!([{ "nodes": (0..named.len()).collect::<Vec<_>>() }]));

        let flattened: Vec<Vec<f32>> = self.tracks.iter().map(|t| t.values.iter().flatten().copied().collect()).collect();
        let data: Vec<AnimationTrackData<'_>> = self
            .tracks
            .iter()
            .zip(&flattened)
            .map(|(track, values)| AnimationTrackData {
                node: nodes[track.target.as_str()],
                path: &track.path,
                times: &track.times,
                values,
                element: match track.path.as_str() {
                    "translation" | "scale" => "VEC3",
                    "rotation" => "VEC4",
                    _ => "SCALAR",
                },
            })
            .collect();
        let mut bin = Vec::new();
        gltf::append_animation(&mut document, &mut bin, &self.name, &data);
        let json = serde_json::to_vec(&document).or_raise(|| ErrorKind::Encode("glTF JSON"))?;
        Ok(gltf::pack_glb(&json, &bin))
    }

    fn validate(&self) -> Result<()> {
        self.tracks.iter().try_for_each(Track::validate)
    }

    pub fn duration_s(&self) -> f64 {
        f64::from(self.tracks.iter().map(Track::end).fold(0.0f32, f32::max))
    }

    /// Frame count is the keyframe count of the first track.
    pub fn attributes(&self) -> AnimationAttributes {
        let duration_s = self.duration_s();
        let frame_count = self.tracks.first().map_or(0, |t| t.times.len() as u64);
        let has_weights = self.tracks.iter().any(|t| t.path == "weights");
        AnimationAttributes {
            duration_s,
            frame_count,
            fps: if duration_s > 0.0 { frame_count as f64 / duration_s } else { 0.0 },
            channel_count: self.tracks.len() as u64,
            is_looping: self.is_looping,
            has_weights,
            has_morphs: has_weights,
        }
    }

    /// Resample every track at a lower frame rate, proportionally reducing
    /// its keyframe count.
    ///
    /// # Errors
    /// [`InvalidArgument`](ErrorKind::InvalidArgument) for a zero-length clip,
    /// a non-positive target or a target above the current rate.
    pub fn resample(&self, target_fps: f64) -> Result<Self> {
        let current = self.attributes();
        if current.duration_s <= 0.0 {
            exn::bail!(ErrorKind::InvalidArgument("cannot resample a zero-length clip".into()));
        }
        if !(target_fps > 0.0) {
            exn::bail!(ErrorKind::InvalidArgument(format!("target fps must be positive, got {target_fps}")));
        }
        if target_fps > current.fps {
            exn::bail!(ErrorKind::InvalidArgument(format!(
                "target fps {target_fps} is above the clip's {:.3}",
                current.fps
            )));
        }
        let factor = target_fps / current.fps;
        let tracks = self
            .tracks
            .iter()
            .map(|track| {
                let count = ((track.times.len() as f64 * factor).round() as usize).max(1);
                let (start, end) = (track.times.first().copied().unwrap_or(0.0), track.end());
                let times: Vec<f32> = match count {
                    1 => vec![start],
                    n => (0..n).map(|i| start + (end - start) * i as f32 / (n - 1) as f32).collect(),
                };
                let values = times.iter().map(|&t| track.sample(t)).collect();
                Track { times, values, ..track.clone() }
            })
            .collect();
        Ok(Self { tracks, ..self.clone() })
    }

    /// Keep the first keyframe of every track, then only those that differ
    /// from the last kept one by more than `delta_threshold` in any component.
    pub fn extract_keyframes(&self, delta_threshold: f32) -> Result<Self> {
        if !(delta_threshold >= 0.0) {
            exn::bail!(ErrorKind::InvalidArgument(format!("threshold must not be negative, got {delta_threshold}")));
        }
        let tracks = self
            .tracks
            .iter()
            .map(|track| {
                let mut times = Vec::new();
                let mut values: Vec<Vec<f32>> = Vec::new();
                for (t, v) in track.times.iter().zip(&track.values) {
                    let keep = match values.last() {
                        None => true,
                        Some(last) => last.iter().zip(v).map(|(a, b)| (a - b).abs()).fold(0.0f32, f32::max) > delta_threshold,
                    };
                    if keep {
                        times.push(*t);
                        values.push(v.clone());
                    }
                }
                Track { times, values, ..track.clone() }
            })
            .collect();
        Ok(Self { tracks, ..self.clone() })
    }
}

pub fn decode(bytes: &[u8], format: &str) -> Result<Decoded<AnimationAttributes>> {
    let attributes = match format {
        "glb" | "gltf" => Gltf::parse(bytes)?.animation_attributes()?,
        "json" | "anim" => Clip::from_json(bytes)?.attributes(),
        other => exn::bail!(ErrorKind::Unsupported(format!("animation format `{other}`"))),
    };
    Ok(Decoded::new(attributes))
}

pub fn read(bytes: &[u8], format: &str) -> Result<Clip> {
    match format {
        "glb" | "gltf" => Clip::from_gltf(&Gltf::parse(bytes)?),
        "json" | "anim" => Clip::from_json(bytes),
        other => exn::bail!(ErrorKind::Unsupported(format!("animation format `{other}`"))),
    }
}

pub fn write(clip: &Clip, format: &str) -> Result<Vec<u8>> {
    match format {
        "glb" => clip.to_glb(),
        "json" | "anim" => clip.to_json(),
        other => exn::bail!(ErrorKind::Unsupported(format!("animation format `{other}`"))),
    }
}
