use crate::Decoded;
use crate::error::{ErrorKind, Result};
use crate::gltf::{self, Gltf};
use crate::mesh::Mesh;
use crate::obj;
use serde_json::{Value, json};
use wold_metadata::models::ModelAttributes;

pub const FORMATS: &[&str] = &["glb", "gltf", "obj"];

/// Geometry plus the material definitions that travel with it through a
/// conversion or simplification.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub mesh: Mesh,
    pub materials: Vec<Value>,
}

/// Read counts, bounds and LOD level for the model record.
pub fn decode(bytes: &[u8], format: &str, name: &str) -> Result<Decoded<ModelAttributes>> {
    let mut attributes = match format {
        "glb" | "gltf" => Gltf::parse(bytes)?.model_attributes(),
        "obj" => {
            let parsed = obj::parse(bytes)?;
            ModelAttributes {
                vertex_count: parsed.mesh.vertex_count() as u64,
                face_count: parsed.mesh.face_count() as u64,
                material_count: parsed.materials.len() as u64,
                animation_count: 0,
                lod_level: None,
                bounds: parsed.mesh.bounds().unwrap_or_default(),
            }
        },
        other => exn::bail!(ErrorKind::Unsupported(format!("model format `{other}`"))),
    };
    attributes.lod_level = lod_level(name);
    Ok(Decoded::new(attributes))
}

pub fn read(bytes: &[u8], format: &str) -> Result<Model> {
    match format {
        "glb" | "gltf" => {
            let gltf = Gltf::parse(bytes)?;
            Ok(Model {
                mesh: gltf.read_mesh()?,
                materials: gltf.document.materials,
            })
        },
        "obj" => {
            let parsed = obj::parse(bytes)?;
            Ok(Model {
                mesh: parsed.mesh,
                materials: parsed.materials.into_iter().map(|name| json!({ "name": name })).collect(),
            })
        },
        other => exn::bail!(ErrorKind::Unsupported(format!("model format `{other}`"))),
    }
}

pub fn write(model: &Model, format: &str, name: &str) -> Result<Vec<u8>> {
    match format {
        "glb" => gltf::write_glb(&model.mesh, &model.materials),
        "gltf" => gltf::write_gltf(&model.mesh, &model.materials),
        "obj" => Ok(obj::write(&model.mesh, name)),
        other => exn::bail!(ErrorKind::Unsupported(format!("model format `{other}`"))),
    }
}

/// `Some(n)` for names ending in `_lod<n>`.
pub fn lod_level(name: &str) -> Option<u32> {
    let (_, digits) = name.rsplit_once("_lod")?;
    match !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        true => digits.parse().ok(),
        false => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::cube;
    use rstest::rstest;

    #[rstest]
    #[case("cube", None)]
    #[case("cube_lod0", Some(0))]
    #[case("tree_lod12", Some(12))]
    #[case("cube_lod", None)]
    #[case("cube_lodx", None)]
    #[case("my_lod2_final", None)]
    fn test_lod_level(#[case] name: &str, #[case] expected: Option<u32>) {
        assert_eq!(lod_level(name), expected);
    }

    #[rstest]
    #[case("glb")]
    #[case("gltf")]
    #[case("obj")]
    fn test_convert_preserves_counts(#[case] format: &str) {
        let model = Model { mesh: cube(), materials: vec![json!({"name": "steel"})] };
        let bytes = write(&model, format, "cube").unwrap();
        let decoded = decode(&bytes, format, "cube_lod1").unwrap();
        assert_eq!(decoded.attributes.vertex_count, 8);
        assert_eq!(decoded.attributes.face_count, 12);
        assert_eq!(decoded.attributes.lod_level, Some(1));
    }

    #[test]
    fn test_unknown_format() {
        let err = decode(b"", "fbx", "cube").unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unsupported(_)));
    }
}
