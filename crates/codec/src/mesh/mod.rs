//! Indexed triangle meshes, the common currency of the model readers,
//! writers and the simplifier.

mod decimate;

pub use self::decimate::{MeshSimplifier, QuadricSimplifier};
use crate::error::{ErrorKind, Result};
use wold_metadata::Bounds;

/// Indexed triangle list.
///
/// `normals` and `uvs` are either empty or exactly as long as `positions`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mesh {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn face_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::enclosing(self.positions.iter().map(|p| p.map(f64::from)))
    }

    /// Check the structural invariants readers rely on.
    pub fn validate(&self) -> Result<()> {
        let count = self.positions.len();
        if self.indices.len() % 3 != 0 {
            exn::bail!(ErrorKind::malformed("mesh: index count is not a multiple of three"));
        }
        if let Some(bad) = self.indices.iter().find(|&&i| i as usize >= count) {
            exn::bail!(ErrorKind::malformed(format!("mesh: index {bad} out of range for {count} vertices")));
        }
        if !self.normals.is_empty() && self.normals.len() != count {
            exn::bail!(ErrorKind::malformed("mesh: normal count differs from vertex count"));
        }
        if !self.uvs.is_empty() && self.uvs.len() != count {
            exn::bail!(ErrorKind::malformed("mesh: uv count differs from vertex count"));
        }
        Ok(())
    }

    /// Area-weighted smooth normals. Vertices that belong to no triangle get
    /// an up vector.
    pub fn recompute_normals(&mut self) {
        let mut normals = vec![[0.0f32; 3]; self.positions.len()];
        for tri in self.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
            let face = cross(sub(self.positions[b], self.positions[a]), sub(self.positions[c], self.positions[a]));
            for v in [a, b, c] {
                for axis in 0..3 {
                    normals[v][axis] += face[axis];
                }
            }
        }
        for n in &mut normals {
            *n = normalize(*n).unwrap_or([0.0, 1.0, 0.0]);
        }
        self.normals = normals;
    }

    pub fn clamp_uvs(&mut self) {
        for uv in &mut self.uvs {
            uv[0] = uv[0].clamp(0.0, 1.0);
            uv[1] = uv[1].clamp(0.0, 1.0);
        }
    }

    /// Append another mesh, offsetting its indices. Attribute channels only
    /// one side has are padded with zeros.
    pub fn append(&mut self, other: Mesh) {
        let base = self.positions.len() as u32;
        let own = self.positions.len();
        let theirs = other.positions.len();
        if !other.normals.is_empty() || !self.normals.is_empty() {
            self.normals.resize(own, [0.0; 3]);
            let mut normals = other.normals;
            normals.resize(theirs, [0.0; 3]);
            self.normals.extend(normals);
        }
        if !other.uvs.is_empty() || !self.uvs.is_empty() {
            self.uvs.resize(own, [0.0; 2]);
            let mut uvs = other.uvs;
            uvs.resize(theirs, [0.0; 2]);
            self.uvs.extend(uvs);
        }
        self.positions.extend(other.positions);
        self.indices.extend(other.indices.into_iter().map(|i| i + base));
    }
}

pub(crate) fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub(crate) fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

fn normalize(v: [f32; 3]) -> Option<[f32; 3]> {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    (len > f32::EPSILON).then(|| [v[0] / len, v[1] / len, v[2] / len])
}

/// Unit cube with eight shared corners and twelve outward-facing triangles.
#[cfg(test)]
pub(crate) fn cube() -> Mesh {
    let positions = vec![
        [-1.0, -1.0, -1.0],
        [1.0, -1.0, -1.0],
        [1.0, 1.0, -1.0],
        [-1.0, 1.0, -1.0],
        [-1.0, -1.0, 1.0],
        [1.0, -1.0, 1.0],
        [1.0, 1.0, 1.0],
        [-1.0, 1.0, 1.0],
    ];
    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1, 0, 3, 2, // back
        4, 5, 6, 4, 6, 7, // front
        0, 1, 5, 0, 5, 4, // bottom
        3, 7, 6, 3, 6, 2, // top
        0, 4, 7, 0, 7, 3, // left
        1, 2, 6, 1, 6, 5, // right
    ];
    let uvs = positions.iter().map(|p: &[f32; 3]| [(p[0] + 1.0) / 2.0, (p[1] + 1.0) / 2.0]).collect();
    let mut mesh = Mesh { positions, normals: vec![], uvs, indices };
    mesh.recompute_normals();
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_shape() {
        let mesh = cube();
        mesh.validate().unwrap();
        assert_eq!(mesh.vertex_count(), 8);
        assert_eq!(mesh.face_count(), 12);
        let bounds = mesh.bounds().unwrap();
        assert_eq!(bounds.min, [-1.0, -1.0, -1.0]);
        assert_eq!(bounds.max, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_corner_normals_point_outwards() {
        let mesh = cube();
        let n = mesh.normals[6];
        assert!(n.iter().all(|c| *c > 0.0), "normal {n:?} should point towards +x+y+z");
    }

    #[test]
    fn test_validate_rejects_out_of_range_index() {
        let mesh = Mesh {
            positions: vec![[0.0; 3]; 3],
            indices: vec![0, 1, 3],
            ..Default::default()
        };
        let err = mesh.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Malformed(_)));
    }

    #[test]
    fn test_append_offsets_and_pads() {
        let mut a = Mesh {
            positions: vec![[0.0; 3]; 3],
            indices: vec![0, 1, 2],
            ..Default::default()
        };
        a.append(cube());
        assert_eq!(a.vertex_count(), 11);
        assert_eq!(a.face_count(), 13);
        assert_eq!(a.uvs.len(), 11);
        assert_eq!(a.normals.len(), 11);
        assert_eq!(a.indices[3..6], [3, 5, 4]);
        a.validate().unwrap();
    }

    #[test]
    fn test_clamp_uvs() {
        let mut mesh = Mesh { uvs: vec![[-0.5, 1.5], [0.25, 0.75]], ..Default::default() };
        mesh.clamp_uvs();
        assert_eq!(mesh.uvs, [[0.0, 1.0], [0.25, 0.75]]);
    }
}
