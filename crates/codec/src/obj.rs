//! Wavefront OBJ, the plain-text mesh format.
//!
//! Polygons are fan-triangulated. Every distinct `v/vt/vn` triple becomes
//! one vertex. Material libraries are not loaded, but each distinct
//! `usemtl` name counts as a material.

use crate::error::{ErrorKind, Result};
use crate::mesh::Mesh;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

/// A parsed OBJ file.
#[derive(Debug, Clone, Default)]
pub struct Obj {
    pub mesh: Mesh,
    pub materials: Vec<String>,
}

pub fn parse(bytes: &[u8]) -> Result<Obj> {
    let text = std::str::from_utf8(bytes).map_err(|_| ErrorKind::malformed("OBJ: not UTF-8"))?;
    let mut positions: Vec<[f32; 3]> = Vec::new();
    let mut texcoords: Vec<[f32; 2]> = Vec::new();
    let mut normals: Vec<[f32; 3]> = Vec::new();
    let mut materials: Vec<String> = Vec::new();
    let mut seen_materials = HashSet::new();
    let mut corners: Vec<(usize, Option<usize>, Option<usize>)> = Vec::new();
    let mut lookup = HashMap::new();
    let mut indices = Vec::new();

    for (number, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        let mut parts = line.split_whitespace();
        let Some(keyword) = parts.next() else {
            continue;
        };
        let at = |what: &str| ErrorKind::malformed(format!("OBJ line {}: {what}", number + 1));
        match keyword {
            "v" => positions.push(floats::<3>(parts).ok_or_else(|| at("vertex"))?),
            "vt" => {
                let mut uv = parts.map(str::parse::<f32>);
                let u = uv.next().and_then(|r| r.ok()).ok_or_else(|| at("texture coordinate"))?;
                let v = uv.next().and_then(|r| r.ok()).unwrap_or(0.0);
                texcoords.push([u, v]);
            },
            "vn" => normals.push(floats::<3>(parts).ok_or_else(|| at("normal"))?),
            "usemtl" => {
                if let Some(name) = parts.next()
                    && seen_materials.insert(name.to_string())
                {
                    materials.push(name.to_string());
                }
            },
            "f" => {
                let face: Vec<u32> = parts
                    .map(|corner| {
                        let key = corner_indices(corner, positions.len(), texcoords.len(), normals.len())
                            .ok_or_else(|| at("face corner"))?;
                        Ok(*lookup.entry(key).or_insert_with(|| {
                            corners.push(key);
                            (corners.len() - 1) as u32
                        }))
                    })
                    .collect::<std::result::Result<_, ErrorKind>>()?;
                if face.len() < 3 {
                    exn::bail!(at("face with fewer than three corners"));
                }
                for i in 1..face.len() - 1 {
                    indices.extend([face[0], face[i], face[i + 1]]);
                }
            },
            _ => {},
        }
    }

    let has_uvs = corners.iter().any(|c| c.1.is_some());
    let has_normals = corners.iter().any(|c| c.2.is_some());
    let mut mesh = Mesh {
        positions: corners.iter().map(|c| positions[c.0]).collect(),
        normals: match has_normals {
            true => corners.iter().map(|c| c.2.map(|n| normals[n]).unwrap_or_default()).collect(),
            false => vec![],
        },
        uvs: match has_uvs {
            true => corners.iter().map(|c| c.1.map(|t| texcoords[t]).unwrap_or_default()).collect(),
            false => vec![],
        },
        indices,
    };
    if !has_normals {
        mesh.recompute_normals();
    }
    mesh.validate()?;
    Ok(Obj { mesh, materials })
}

fn floats<const N: usize>(parts: std::str::SplitWhitespace<'_>) -> Option<[f32; N]> {
    let mut out = [0.0; N];
    let mut parts = parts.map(str::parse::<f32>);
    for slot in &mut out {
        *slot = parts.next()?.ok()?;
    }
    Some(out)
}

/// Resolve `v`, `v/vt`, `v//vn` or `v/vt/vn`, with 1-based or negative
/// (relative) indices, to 0-based indices.
fn corner_indices(corner: &str, v: usize, vt: usize, vn: usize) -> Option<(usize, Option<usize>, Option<usize>)> {
    let mut fields = corner.split('/');
    let position = resolve(fields.next()?, v)?;
    let texcoord = match fields.next() {
        Some("") | None => None,
        Some(t) => Some(resolve(t, vt)?),
    };
    let normal = match fields.next() {
        Some("") | None => None,
        Some(n) => Some(resolve(n, vn)?),
    };
    Some((position, texcoord, normal))
}

fn resolve(field: &str, len: usize) -> Option<usize> {
    let index: i64 = field.parse().ok()?;
    let resolved = match index {
        0 => return None,
        i if i > 0 => i - 1,
        i => len as i64 + i,
    };
    usize::try_from(resolved).ok().filter(|&r| r < len)
}

/// Write a mesh as OBJ text. UVs and normals are written when present.
pub fn write(mesh: &Mesh, name: &str) -> Vec<u8> {
    let mut out = String::new();
    let _ = writeln!(out, "# wold {}", env!("CARGO_PKG_VERSION"));
    let _ = writeln!(out, "o {name}");
    for p in &mesh.positions {
        let _ = writeln!(out, "v {} {} {}", p[0], p[1], p[2]);
    }
    for t in &mesh.uvs {
        let _ = writeln!(out, "vt {} {}", t[0], t[1]);
    }
    for n in &mesh.normals {
        let _ = writeln!(out, "vn {} {} {}", n[0], n[1], n[2]);
    }
    let corner = |i: u32| {
        let i = i + 1;
        match (mesh.uvs.is_empty(), mesh.normals.is_empty()) {
            (true, true) => format!("{i}"),
            (false, true) => format!("{i}/{i}"),
            (true, false) => format!("{i}//{i}"),
            (false, false) => format!("{i}/{i}/{i}"),
        }
    };
    for tri in mesh.indices.chunks_exact(3) {
        let _ = writeln!(out, "f {} {} {}", corner(tri[0]), corner(tri[1]), corner(tri[2]));
    }
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::cube;
    use rstest::rstest;

    const QUAD: &str = "\
# a unit quad
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 1
usemtl red
usemtl red
f 1/1 2/1 3/2 4/2
";

    #[test]
    fn test_quad_is_fan_triangulated() {
        let obj = parse(QUAD.as_bytes()).unwrap();
        assert_eq!(obj.mesh.face_count(), 2);
        assert_eq!(obj.mesh.vertex_count(), 4);
        assert_eq!(obj.mesh.indices, [0, 1, 2, 0, 2, 3]);
        assert_eq!(obj.materials, ["red"]);
        assert_eq!(obj.mesh.normals.len(), 4);
    }

    #[rstest]
    #[case("1", Some((0, None, None)))]
    #[case("2/1", Some((1, Some(0), None)))]
    #[case("3//2", Some((2, None, Some(1))))]
    #[case("-1/-1/-1", Some((2, Some(1), Some(1))))]
    #[case("0", None)]
    #[case("4", None)]
    fn test_corner_indices(#[case] corner: &str, #[case] expected: Option<(usize, Option<usize>, Option<usize>)>) {
        assert_eq!(corner_indices(corner, 3, 2, 2), expected);
    }

    #[test]
    fn test_write_then_parse_keeps_geometry() {
        let mesh = cube();
        let obj = parse(&write(&mesh, "cube")).unwrap();
        assert_eq!(obj.mesh.vertex_count(), 8);
        assert_eq!(obj.mesh.face_count(), 12);
        assert_eq!(obj.mesh.bounds(), mesh.bounds());
    }

    #[test]
    fn test_bad_face_reports_line() {
        let err = parse(b"v 0 0 0\nf 1 2 3\n").unwrap_err();
        assert!(matches!(&*err, ErrorKind::Malformed(m) if m.contains("line 2")));
    }
}
