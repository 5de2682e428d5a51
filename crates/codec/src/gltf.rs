//! Minimal glTF 2.0 reader and writer.
//!
//! Only what the registry needs: accessor statistics for metadata, triangle
//! geometry for the simplifier, animation samplers for clips, and a writer
//! for a single indexed mesh. Both the JSON (`.gltf`) and binary (`.glb`)
//! containers are handled. Buffers are either the GLB binary chunk or
//! base64 `data:` URIs; external buffer files are not followed, so their
//! accessors can only be summarized from `min`/`max`.

use crate::error::{ErrorKind, Result};
use crate::mesh::Mesh;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use byteorder::{ByteOrder, LittleEndian};
use exn::{OptionExt, ResultExt};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use wold_metadata::Bounds;
use wold_metadata::models::{AnimationAttributes, ModelAttributes};

const GLB_MAGIC: u32 = 0x4654_6C67;
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;
const GLB_HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;

const COMPONENT_U8: u32 = 5121;
const COMPONENT_U16: u32 = 5123;
const COMPONENT_U32: u32 = 5125;
const COMPONENT_F32: u32 = 5126;
const MODE_TRIANGLES: u32 = 4;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Document {
    pub buffers: Vec<Buffer>,
    pub buffer_views: Vec<BufferView>,
    pub accessors: Vec<Accessor>,
    pub meshes: Vec<MeshDef>,
    pub materials: Vec<Value>,
    pub animations: Vec<AnimationDef>,
    pub nodes: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Buffer {
    pub byte_length: usize,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BufferView {
    pub buffer: usize,
    pub byte_offset: usize,
    pub byte_length: usize,
    pub byte_stride: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Accessor {
    pub buffer_view: Option<usize>,
    pub byte_offset: usize,
    pub component_type: u32,
    pub count: usize,
    #[serde(rename = "type")]
    pub element: String,
    pub min: Option<Vec<f64>>,
    pub max: Option<Vec<f64>>,
}
impl Accessor {
    fn components(&self) -> Option<usize> {
        Some(match self.element.as_str() {
            "SCALAR" => 1,
            "VEC2" => 2,
            "VEC3" => 3,
            "VEC4" | "MAT2" => 4,
            "MAT3" => 9,
            "MAT4" => 16,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeshDef {
    pub name: Option<String>,
    pub primitives: Vec<Primitive>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Primitive {
    pub attributes: BTreeMap<String, usize>,
    pub indices: Option<usize>,
    pub mode: Option<u32>,
    pub targets: Vec<Value>,
}
impl Primitive {
    fn is_triangles(&self) -> bool {
        self.mode.unwrap_or(MODE_TRIANGLES) == MODE_TRIANGLES
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnimationDef {
    pub name: Option<String>,
    pub channels: Vec<Channel>,
    pub samplers: Vec<Sampler>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub sampler: usize,
    pub target: ChannelTarget,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelTarget {
    pub node: Option<usize>,
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Sampler {
    pub input: usize,
    pub output: usize,
    pub interpolation: Option<String>,
}

/// A parsed glTF asset and whatever buffer bytes could be resolved.
#[derive(Debug, Clone)]
pub struct Gltf {
    pub document: Document,
    buffers: Vec<Option<Vec<u8>>>,
}

impl Gltf {
    /// Parse either container. GLB is recognized by its magic, anything else
    /// is treated as JSON.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (json, bin) = match bytes.get(..4) {
            Some(b"glTF") => split_glb(bytes)?,
            _ => (bytes, None),
        };
        let document: Document = serde_json::from_slice(json).or_raise(|| ErrorKind::malformed("glTF JSON"))?;
        let buffers = document
            .buffers
            .iter()
            .enumerate()
            .map(|(i, buffer)| match buffer.uri.as_deref() {
                None if i == 0 => bin.map(<[u8]>::to_vec),
                Some(uri) => decode_data_uri(uri),
                None => None,
            })
            .collect();
        Ok(Self { document, buffers })
    }

    /// Counts and bounds for the model record. Everything here comes from
    /// the JSON; buffer data is only read for bounds missing `min`/`max`.
    pub fn model_attributes(&self) -> ModelAttributes {
        let mut attrs = ModelAttributes {
            material_count: self.document.materials.len() as u64,
            animation_count: self.document.animations.len() as u64,
            ..Default::default()
        };
        let mut bounds: Option<Bounds> = None;
        for primitive in self.document.meshes.iter().flat_map(|m| &m.primitives) {
            let Some(position) = primitive.attributes.get("POSITION").and_then(|&i| self.document.accessors.get(i)) else {
                continue;
            };
            attrs.vertex_count += position.count as u64;
            if primitive.is_triangles() {
                let corners = match primitive.indices.and_then(|i| self.document.accessors.get(i)) {
                    Some(indices) => indices.count,
                    None => position.count,
                };
                attrs.face_count += (corners / 3) as u64;
            }
            let found = self.accessor_bounds(position);
            bounds = match (bounds, found) {
                (Some(a), Some(b)) => Some(a.union(&b)),
                (a, b) => a.or(b),
            };
        }
        attrs.bounds = bounds.unwrap_or_default();
        attrs
    }

    fn accessor_bounds(&self, accessor: &Accessor) -> Option<Bounds> {
        if let (Some(min), Some(max)) = (&accessor.min, &accessor.max)
            && min.len() >= 3
            && max.len() >= 3
        {
            return Some(Bounds {
                min: [min[0], min[1], min[2]],
                max: [max[0], max[1], max[2]],
            });
        }
        let points = self.read_vec3(accessor).ok()?;
        Bounds::enclosing(points.into_iter().map(|p| p.map(f64::from)))
    }

    /// Summary of the first animation.
    ///
    /// # Errors
    /// [`Malformed`](ErrorKind::Malformed) when the asset has no animation or
    /// a sampler points at an accessor that doesn't exist.
    pub fn animation_attributes(&self) -> Result<AnimationAttributes> {
        let animation = self.document.animations.first().ok_or_raise(|| ErrorKind::malformed("glTF: no animation"))?;
        let mut duration: f64 = 0.0;
        for channel in &animation.channels {
            let input = self.sampler_input(animation, channel.sampler)?;
            let end = match input.max.as_ref().and_then(|m| m.first()) {
                Some(max) => *max,
                None => self.read_floats(input)?.into_iter().fold(0.0f32, f32::max).into(),
            };
            duration = duration.max(end);
        }
        let frame_count = match animation.channels.first() {
            Some(first) => self.sampler_input(animation, first.sampler)?.count as u64,
            None => 0,
        };
        let has_weights = animation.channels.iter().any(|c| c.target.path == "weights");
        let has_targets = self.document.meshes.iter().flat_map(|m| &m.primitives).any(|p| !p.targets.is_empty());
        Ok(AnimationAttributes {
            duration_s: duration,
            frame_count,
            fps: if duration > 0.0 { frame_count as f64 / duration } else { 0.0 },
            channel_count: animation.channels.len() as u64,
            is_looping: false,
            has_weights,
            has_morphs: has_weights || has_targets,
        })
    }

    fn sampler_input(&self, animation: &AnimationDef, sampler: usize) -> Result<&Accessor> {
        animation
            .samplers
            .get(sampler)
            .and_then(|s| self.document.accessors.get(s.input))
            .ok_or_raise(|| ErrorKind::malformed("glTF: animation sampler input"))
    }

    /// All triangle primitives of all meshes merged into one mesh.
    pub fn read_mesh(&self) -> Result<Mesh> {
        let mut out = Mesh::default();
        for primitive in self.document.meshes.iter().flat_map(|m| &m.primitives).filter(|p| p.is_triangles()) {
            let Some(&position) = primitive.attributes.get("POSITION") else {
                continue;
            };
            let positions = self.read_vec3(self.accessor(position)?)?;
            let normals = match primitive.attributes.get("NORMAL") {
                Some(&i) => self.read_vec3(self.accessor(i)?)?,
                None => vec![],
            };
            let uvs = match primitive.attributes.get("TEXCOORD_0") {
                Some(&i) => self.read_floats(self.accessor(i)?)?.chunks_exact(2).map(|c| [c[0], c[1]]).collect(),
                None => vec![],
            };
            let indices = match primitive.indices {
                Some(i) => self.read_indices(self.accessor(i)?)?,
                None => (0..positions.len() as u32).collect(),
            };
            let part = Mesh { positions, normals, uvs, indices };
            part.validate()?;
            out.append(part);
        }
        Ok(out)
    }

    /// Keyframe times and flattened output values for one channel.
    pub(crate) fn read_channel(&self, animation: &AnimationDef, channel: &Channel) -> Result<(Vec<f32>, Vec<f32>)> {
        let sampler =
            animation.samplers.get(channel.sampler).ok_or_raise(|| ErrorKind::malformed("glTF: animation sampler"))?;
        let times = self.read_floats(self.accessor(sampler.input)?)?;
        let values = self.read_floats(self.accessor(sampler.output)?)?;
        Ok((times, values))
    }

    fn accessor(&self, index: usize) -> Result<&Accessor> {
        self.document.accessors.get(index).ok_or_raise(|| ErrorKind::malformed(format!("glTF: accessor {index}")))
    }

    /// Raw bytes for every element of an accessor, honouring the view stride.
    fn elements(&self, accessor: &Accessor, component_size: usize) -> Result<Vec<&[u8]>> {
        let components = accessor.components().ok_or_raise(|| ErrorKind::malformed("glTF: accessor type"))?;
        let element_size = components * component_size;
        let view_index = accessor.buffer_view.ok_or_raise(|| ErrorKind::malformed("glTF: sparse accessor"))?;
        let view = self
            .document
            .buffer_views
            .get(view_index)
            .ok_or_raise(|| ErrorKind::malformed(format!("glTF: buffer view {view_index}")))?;
        let buffer = self
            .buffers
            .get(view.buffer)
            .and_then(Option::as_deref)
            .ok_or_raise(|| ErrorKind::Unsupported("glTF external buffer".into()))?;
        let stride = view.byte_stride.unwrap_or(element_size);
        let start = view.byte_offset + accessor.byte_offset;
        let view_end = view.byte_offset + view.byte_length;
        (0..accessor.count)
            .map(|i| {
                let offset = start + i * stride;
                let end = offset + element_size;
                match end <= view_end {
                    true => buffer.get(offset..end).ok_or_raise(|| ErrorKind::malformed("glTF: accessor past buffer")),
                    false => exn::bail!(ErrorKind::malformed("glTF: accessor past buffer view")),
                }
            })
            .collect()
    }

    fn read_floats(&self, accessor: &Accessor) -> Result<Vec<f32>> {
        if accessor.component_type != COMPONENT_F32 {
            exn::bail!(ErrorKind::Unsupported(format!("glTF component type {}", accessor.component_type)));
        }
        Ok(self.elements(accessor, 4)?.into_iter().flat_map(|e| e.chunks_exact(4).map(LittleEndian::read_f32)).collect())
    }

    fn read_vec3(&self, accessor: &Accessor) -> Result<Vec<[f32; 3]>> {
        if accessor.element != "VEC3" {
            exn::bail!(ErrorKind::malformed("glTF: expected VEC3 accessor"));
        }
        Ok(self.read_floats(accessor)?.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
    }

    fn read_indices(&self, accessor: &Accessor) -> Result<Vec<u32>> {
        let (size, read): (usize, fn(&[u8]) -> u32) = match accessor.component_type {
            COMPONENT_U8 => (1, |b| u32::from(b[0])),
            COMPONENT_U16 => (2, |b| u32::from(LittleEndian::read_u16(b))),
            COMPONENT_U32 => (4, LittleEndian::read_u32),
            other => exn::bail!(ErrorKind::malformed(format!("glTF: index component type {other}"))),
        };
        Ok(self.elements(accessor, size)?.into_iter().map(read).collect())
    }
}

fn split_glb(bytes: &[u8]) -> Result<(&[u8], Option<&[u8]>)> {
    if bytes.len() < GLB_HEADER_LEN {
        exn::bail!(ErrorKind::malformed("GLB: truncated header"));
    }
    let version = LittleEndian::read_u32(&bytes[4..8]);
    if version != GLB_VERSION {
        exn::bail!(ErrorKind::Unsupported(format!("GLB version {version}")));
    }
    let declared = LittleEndian::read_u32(&bytes[8..12]) as usize;
    let body = bytes.get(..declared.min(bytes.len())).unwrap_or(bytes);

    let mut json = None;
    let mut bin = None;
    let mut offset = GLB_HEADER_LEN;
    while offset + CHUNK_HEADER_LEN <= body.len() {
        let length = LittleEndian::read_u32(&body[offset..offset + 4]) as usize;
        let kind = LittleEndian::read_u32(&body[offset + 4..offset + 8]);
        let data = body
            .get(offset + CHUNK_HEADER_LEN..offset + CHUNK_HEADER_LEN + length)
            .ok_or_raise(|| ErrorKind::malformed("GLB: chunk past end of file"))?;
        match kind {
            CHUNK_JSON if json.is_none() => json = Some(data),
            CHUNK_BIN if bin.is_none() => bin = Some(data),
            _ => {},
        }
        offset += CHUNK_HEADER_LEN + length;
    }
    let json = json.ok_or_raise(|| ErrorKind::malformed("GLB: missing JSON chunk"))?;
    Ok((json, bin))
}

fn decode_data_uri(uri: &str) -> Option<Vec<u8>> {
    let (_, payload) = uri.strip_prefix("data:")?.split_once(";base64,")?;
    BASE64.decode(payload).ok()
}

/// Wrap a JSON document and binary buffer in a GLB container. The JSON chunk
/// is padded with spaces and the binary chunk with zeros, as the format asks.
pub fn pack_glb(json: &[u8], bin: &[u8]) -> Vec<u8> {
    let json_len = json.len().next_multiple_of(4);
    let bin_len = bin.len().next_multiple_of(4);
    let mut total = GLB_HEADER_LEN + CHUNK_HEADER_LEN + json_len;
    if !bin.is_empty() {
        total += CHUNK_HEADER_LEN + bin_len;
    }
    let mut out = Vec::with_capacity(total);
    let mut word = [0u8; 4];
    for value in [GLB_MAGIC, GLB_VERSION, total as u32, json_len as u32, CHUNK_JSON] {
        LittleEndian::write_u32(&mut word, value);
        out.extend_from_slice(&word);
    }
    out.extend_from_slice(json);
    out.resize(GLB_HEADER_LEN + CHUNK_HEADER_LEN + json_len, b' ');
    if !bin.is_empty() {
        for value in [bin_len as u32, CHUNK_BIN] {
            LittleEndian::write_u32(&mut word, value);
            out.extend_from_slice(&word);
        }
        out.extend_from_slice(bin);
        out.resize(total, 0);
    }
    out
}

/// Serialize a single mesh as a glTF JSON document plus its binary buffer.
///
/// `materials` are copied verbatim; when there is at least one, the
/// primitive uses the first.
pub fn encode_mesh(mesh: &Mesh, materials: &[Value]) -> Result<(Map<String, Value>, Vec<u8>)> {
    mesh.validate()?;
    let mut bin = Vec::new();
    let mut views = Vec::new();
    let mut accessors = Vec::new();
    let mut attributes = Map::new();

    let mut push_floats = |bin: &mut Vec<u8>, data: &[f32], element: &str, count: usize, target: u32| -> usize {
        let offset = bin.len();
        let mut word = [0u8; 4];
        for value in data {
            LittleEndian::write_f32(&mut word, *value);
            bin.extend_from_slice(&word);
        }
        views.push(json!({"buffer": 0, "byteOffset": offset, "byteLength": bin.len() - offset, "target": target}));
        accessors.push(json!({"bufferView": views.len() - 1, "componentType": COMPONENT_F32, "count": count, "type": element}));
        accessors.len() - 1
    };

    let flat: Vec<f32> = mesh.positions.iter().flatten().copied().collect();
    let position = push_floats(&mut bin, &flat, "VEC3", mesh.vertex_count(), 34962);
    attributes.insert("POSITION".into(), position.into());
    if !mesh.normals.is_empty() {
        let flat: Vec<f32> = mesh.normals.iter().flatten().copied().collect();
        attributes.insert("NORMAL".into(), push_floats(&mut bin, &flat, "VEC3", mesh.vertex_count(), 34962).into());
    }
    if !mesh.uvs.is_empty() {
        let flat: Vec<f32> = mesh.uvs.iter().flatten().copied().collect();
        attributes.insert("TEXCOORD_0".into(), push_floats(&mut bin, &flat, "VEC2", mesh.vertex_count(), 34962).into());
    }

    if let Some(bounds) = mesh.bounds()
        && let Some(Value::Object(accessor)) = accessors.get_mut(position)
    {
        accessor.insert("min".into(), json!(bounds.min));
        accessor.insert("max".into(), json!(bounds.max));
    }

    let offset = bin.len();
    let mut word = [0u8; 4];
    for index in &mesh.indices {
        LittleEndian::write_u32(&mut word, *index);
        bin.extend_from_slice(&word);
    }
    views.push(json!({"buffer": 0, "byteOffset": offset, "byteLength": bin.len() - offset, "target": 34963}));
    accessors.push(json!({"bufferView": views.len() - 1, "componentType": COMPONENT_U32, "count": mesh.indices.len(), "type": "SCALAR"}));

    let mut primitive = Map::new();
    primitive.insert("attributes".into(), Value::Object(attributes));
    primitive.insert("indices".into(), (accessors.len() - 1).into());
    primitive.insert("mode".into(), MODE_TRIANGLES.into());
    if !materials.is_empty() {
        primitive.insert("material".into(), 0.into());
    }

    let mut document = asset_header();
    document.insert("scene".into(), 0.into());
    document.insert("scenes".into(), json!([{"nodes": [0]}]));
    document.insert("nodes".into(), json!([{"mesh": 0}]));
    document.insert("meshes".into(), json!([{"primitives": [primitive]}]));
    if !materials.is_empty() {
        document.insert("materials".into(), Value::Array(materials.to_vec()));
    }
    document.insert("buffers".into(), json!([{"byteLength": bin.len()}]));
    document.insert("bufferViews".into(), Value::Array(views));
    document.insert("accessors".into(), Value::Array(accessors));
    Ok((document, bin))
}

/// Binary container for a single mesh.
pub fn write_glb(mesh: &Mesh, materials: &[Value]) -> Result<Vec<u8>> {
    let (document, bin) = encode_mesh(mesh, materials)?;
    let json = serde_json::to_vec(&document).or_raise(|| ErrorKind::Encode("glTF JSON"))?;
    Ok(pack_glb(&json, &bin))
}

/// JSON container for a single mesh, the buffer embedded as a data URI.
pub fn write_gltf(mesh: &Mesh, materials: &[Value]) -> Result<Vec<u8>> {
    let (mut document, bin) = encode_mesh(mesh, materials)?;
    let uri = format!("data:application/octet-stream;base64,{}", BASE64.encode(&bin));
    document.insert("buffers".into(), json!([{"byteLength": bin.len(), "uri": uri}]));
    serde_json::to_vec_pretty(&document).or_raise(|| ErrorKind::Encode("glTF JSON"))
}

/// The `asset` block every document written here starts with.
pub(crate) fn asset_header() -> Map<String, Value> {
    let mut document = Map::new();
    document.insert(
        "asset".into(),
        json!({"version": "2.0", "generator": concat!("wold ", env!("CARGO_PKG_VERSION"))}),
    );
    document
}

/// One animation channel to be written by [`append_animation()`].
#[derive(Debug, Clone)]
pub(crate) struct AnimationTrackData<'a> {
    pub node: usize,
    pub path: &'a str,
    pub times: &'a [f32],
    pub values: &'a [f32],
    pub element: &'a str,
}

/// Append an animation to a document and its single binary buffer. Node
/// indices in `tracks` must already exist in the document.
pub(crate) fn append_animation(document: &mut Map<String, Value>, bin: &mut Vec<u8>, name: &str, tracks: &[AnimationTrackData<'_>]) {
    let mut channels = Vec::new();
    let mut samplers = Vec::new();
    for track in tracks {
        let mut sampler = Map::new();
        for (role, data, element) in [("input", track.times, "SCALAR"), ("output", track.values, track.element)] {
            let offset = bin.len();
            let mut word = [0u8; 4];
            for value in data {
                LittleEndian::write_f32(&mut word, *value);
                bin.extend_from_slice(&word);
            }
            let components = match element {
                "SCALAR" => 1,
                "VEC3" => 3,
                _ => 4,
            };
            let mut accessor = json!({
                "bufferView": push_json(document, "bufferViews", json!({"buffer": 0, "byteOffset": offset, "byteLength": bin.len() - offset})),
                "componentType": COMPONENT_F32,
                "count": data.len() / components,
                "type": element,
            });
            if role == "input"
                && let Value::Object(a) = &mut accessor
            {
                let max = data.iter().copied().fold(0.0f32, f32::max);
                let min = data.iter().copied().fold(f32::INFINITY, f32::min);
                a.insert("min".into(), json!([if min.is_finite() { min } else { 0.0 }]));
                a.insert("max".into(), json!([max]));
            }
            sampler.insert(role.into(), push_json(document, "accessors", accessor).into());
        }
        samplers.push(Value::Object(sampler));
        channels.push(json!({"sampler": samplers.len() - 1, "target": {"node": track.node, "path": track.path}}));
    }
    push_json(document, "animations", json!({"name": name, "channels": channels, "samplers": samplers}));
    document.insert("buffers".into(), json!([{"byteLength": bin.len()}]));
}

fn push_json(document: &mut Map<String, Value>, key: &str, value: Value) -> usize {
    let entry = document.entry(key).or_insert_with(|| Value::Array(vec![]));
    match entry {
        Value::Array(items) => {
            items.push(value);
            items.len() - 1
        },
        other => {
            *other = Value::Array(vec![value]);
            0
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::cube;

    fn cube_glb() -> Vec<u8> {
        write_glb(&cube(), &[json!({"name": "steel"})]).unwrap()
    }

    #[test]
    fn test_glb_header() {
        let glb = cube_glb();
        assert_eq!(&glb[..4], b"glTF");
        assert_eq!(LittleEndian::read_u32(&glb[8..12]) as usize, glb.len());
        assert_eq!(glb.len() % 4, 0);
    }

    #[test]
    fn test_cube_attributes() {
        let gltf = Gltf::parse(&cube_glb()).unwrap();
        let attrs = gltf.model_attributes();
        assert_eq!(attrs.vertex_count, 8);
        assert_eq!(attrs.face_count, 12);
        assert_eq!(attrs.material_count, 1);
        assert_eq!(attrs.animation_count, 0);
        assert_eq!(attrs.bounds.min, [-1.0, -1.0, -1.0]);
        assert_eq!(attrs.bounds.max, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_bounds_computed_when_min_max_absent() {
        let (mut document, bin) = encode_mesh(&cube(), &[]).unwrap();
        if let Some(Value::Array(accessors)) = document.get_mut("accessors")
            && let Some(Value::Object(position)) = accessors.first_mut()
        {
            position.remove("min");
            position.remove("max");
        }
        let glb = pack_glb(&serde_json::to_vec(&document).unwrap(), &bin);
        let attrs = Gltf::parse(&glb).unwrap().model_attributes();
        assert_eq!(attrs.bounds.max, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_mesh_survives_glb_and_gltf() {
        for bytes in [cube_glb(), write_gltf(&cube(), &[]).unwrap()] {
            let mesh = Gltf::parse(&bytes).unwrap().read_mesh().unwrap();
            assert_eq!(mesh, cube());
        }
    }

    #[test]
    fn test_non_indexed_primitive_counts_faces_from_vertices() {
        let document = json!({
            "accessors": [{"componentType": COMPONENT_F32, "count": 6, "type": "VEC3", "min": [0, 0, 0], "max": [1, 1, 0]}],
            "meshes": [{"primitives": [{"attributes": {"POSITION": 0}}]}],
        });
        let gltf = Gltf::parse(document.to_string().as_bytes()).unwrap();
        let attrs = gltf.model_attributes();
        assert_eq!(attrs.vertex_count, 6);
        assert_eq!(attrs.face_count, 2);
        assert_eq!(attrs.bounds.max, [1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_first_animation_summary() {
        let (mut document, mut bin) = encode_mesh(&cube(), &[]).unwrap();
        let times = [0.0, 0.5, 1.0, 1.5, 2.0];
        let translations = [0.0f32; 15];
        let weights = [0.0f32, 1.0, 0.0];
        append_animation(
            &mut document,
            &mut bin,
            "wave",
            &[
                AnimationTrackData { node: 0, path: "translation", times: &times, values: &translations, element: "VEC3" },
                AnimationTrackData { node: 0, path: "weights", times: &times[..3], values: &weights, element: "SCALAR" },
            ],
        );
        let glb = pack_glb(&serde_json::to_vec(&document).unwrap(), &bin);
        let attrs = Gltf::parse(&glb).unwrap().animation_attributes().unwrap();
        assert_eq!(attrs.duration_s, 2.0);
        assert_eq!(attrs.frame_count, 5);
        assert_eq!(attrs.fps, 2.5);
        assert_eq!(attrs.channel_count, 2);
        assert!(attrs.has_weights);
        assert!(attrs.has_morphs);
    }

    #[test]
    fn test_missing_animation_is_malformed() {
        let gltf = Gltf::parse(&cube_glb()).unwrap();
        let err = gltf.animation_attributes().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Malformed(_)));
    }

    #[test]
    fn test_truncated_glb_is_malformed() {
        let glb = cube_glb();
        let err = Gltf::parse(&glb[..20]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Malformed(_)));
    }
}
