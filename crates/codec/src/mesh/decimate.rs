//! Quadric error metric edge collapse (Garland & Heckbert).

use super::{Mesh, cross, sub};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Something that can bring a mesh down to a vertex budget.
pub trait MeshSimplifier {
    /// Return a mesh with at most `target_vertices` vertices where the input
    /// allows it. Normals are recomputed and UVs clamped to `[0, 1]`.
    fn simplify(&self, mesh: &Mesh, target_vertices: usize) -> Mesh;
}

/// Greedy edge collapse ordered by quadric error.
///
/// Coincident vertices are welded first so that seams don't stop collapses.
/// The collapse never goes below [`min_vertices`](Self::min_vertices), so a
/// closed mesh keeps a volume.
#[derive(Debug, Clone, Copy)]
pub struct QuadricSimplifier {
    pub min_vertices: usize,
}
impl Default for QuadricSimplifier {
    fn default() -> Self {
        Self { min_vertices: 4 }
    }
}

/// Symmetric 4×4 matrix, upper triangle, row-major.
#[derive(Debug, Clone, Copy, Default)]
struct Quadric([f64; 10]);
impl Quadric {
    fn plane(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self([a * a, a * b, a * c, a * d, b * b, b * c, b * d, c * c, c * d, d * d])
    }

    fn add(&self, other: &Self) -> Self {
        let mut out = *self;
        for (o, v) in out.0.iter_mut().zip(other.0) {
            *o += v;
        }
        out
    }

    fn error(&self, p: [f64; 3]) -> f64 {
        let [a2, ab, ac, ad, b2, bc, bd, c2, cd, d2] = self.0;
        let [x, y, z] = p;
        a2 * x * x + b2 * y * y + c2 * z * z + d2 + 2.0 * (ab * x * y + ac * x * z + ad * x + bc * y * z + bd * y + cd * z)
    }
}

#[derive(Debug)]
struct Candidate {
    cost: f64,
    keep: usize,
    drop: usize,
    stamps: (u32, u32),
    position: [f64; 3],
}
impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    // Reversed, so the max-heap pops the cheapest collapse.
    fn cmp(&self, other: &Self) -> Ordering {
        other.cost.total_cmp(&self.cost).then_with(|| other.keep.cmp(&self.keep)).then_with(|| other.drop.cmp(&self.drop))
    }
}

struct Work {
    positions: Vec<[f64; 3]>,
    uvs: Vec<[f32; 2]>,
    has_uvs: bool,
    quadrics: Vec<Quadric>,
    stamps: Vec<u32>,
    alive: Vec<bool>,
    faces: Vec<[usize; 3]>,
    face_alive: Vec<bool>,
    vertex_faces: Vec<Vec<usize>>,
}

impl Work {
    fn candidate(&self, a: usize, b: usize) -> Candidate {
        let q = self.quadrics[a].add(&self.quadrics[b]);
        let (pa, pb) = (self.positions[a], self.positions[b]);
        let mid = [(pa[0] + pb[0]) / 2.0, (pa[1] + pb[1]) / 2.0, (pa[2] + pb[2]) / 2.0];
        let (cost, position) = [pa, mid, pb]
            .into_iter()
            .map(|p| (q.error(p), p))
            .min_by(|x, y| x.0.total_cmp(&y.0))
            .unwrap_or((0.0, mid));
        // Collapse towards whichever end the chosen position sits on, so the
        // surviving vertex keeps the matching UV.
        let (keep, drop) = if position == pb { (b, a) } else { (a, b) };
        Candidate {
            cost,
            keep,
            drop,
            stamps: (self.stamps[keep], self.stamps[drop]),
            position,
        }
    }

    fn is_current(&self, c: &Candidate) -> bool {
        self.alive[c.keep] && self.alive[c.drop] && self.stamps[c.keep] == c.stamps.0 && self.stamps[c.drop] == c.stamps.1
    }

    fn neighbours(&self, v: usize) -> HashSet<usize> {
        self.vertex_faces[v]
            .iter()
            .filter(|&&f| self.face_alive[f])
            .flat_map(|&f| self.faces[f])
            .filter(|&n| n != v)
            .collect()
    }

    fn live_faces(&self) -> usize {
        self.face_alive.iter().filter(|a| **a).count()
    }

    /// Merge `drop` into `keep`. Returns the number of faces that vanished.
    fn collapse(&mut self, c: &Candidate) -> usize {
        let (keep, drop) = (c.keep, c.drop);
        self.positions[keep] = c.position;
        self.quadrics[keep] = self.quadrics[keep].add(&self.quadrics[drop]);
        self.alive[drop] = false;
        self.stamps[keep] += 1;
        self.stamps[drop] += 1;

        let mut removed = 0;
        for f in std::mem::take(&mut self.vertex_faces[drop]) {
            if !self.face_alive[f] {
                continue;
            }
            let face = &mut self.faces[f];
            for v in face.iter_mut() {
                if *v == drop {
                    *v = keep;
                }
            }
            if face[0] == face[1] || face[1] == face[2] || face[0] == face[2] {
                self.face_alive[f] = false;
                removed += 1;
            } else {
                self.vertex_faces[keep].push(f);
            }
        }
        removed
    }

    fn collapse_would_empty(&self, c: &Candidate) -> bool {
        let shared = self.vertex_faces[c.drop]
            .iter()
            .filter(|&&f| self.face_alive[f] && self.faces[f].contains(&c.keep))
            .count();
        shared >= self.live_faces()
    }
}

impl MeshSimplifier for QuadricSimplifier {
    fn simplify(&self, mesh: &Mesh, target_vertices: usize) -> Mesh {
        let mut work = weld(mesh);
        let mut live = work.alive.iter().filter(|a| **a).count();
        let target = target_vertices.max(self.min_vertices);

        let mut heap = BinaryHeap::new();
        let mut edges = HashSet::new();
        for face in &work.faces {
            for (a, b) in [(face[0], face[1]), (face[1], face[2]), (face[2], face[0])] {
                if edges.insert((a.min(b), a.max(b))) {
                    heap.push(work.candidate(a.min(b), a.max(b)));
                }
            }
        }

        while live > target {
            let Some(candidate) = heap.pop() else {
                break;
            };
            if !work.is_current(&candidate) || work.collapse_would_empty(&candidate) {
                continue;
            }
            work.collapse(&candidate);
            live -= 1;
            for n in work.neighbours(candidate.keep) {
                heap.push(work.candidate(candidate.keep, n));
            }
        }

        let before = mesh.face_count();
        let out = compact(&work);
        tracing::debug!(vertices = out.vertex_count(), faces = out.face_count(), before, "Simplified mesh");
        out
    }
}

/// Merge vertices sharing an exact position and drop degenerate triangles.
fn weld(mesh: &Mesh) -> Work {
    let mut lookup: HashMap<[u32; 3], usize> = HashMap::new();
    let mut remap = Vec::with_capacity(mesh.positions.len());
    let mut positions = Vec::new();
    let mut uvs = Vec::new();
    for (i, p) in mesh.positions.iter().enumerate() {
        let key = p.map(f32::to_bits);
        let index = *lookup.entry(key).or_insert_with(|| {
            positions.push(p.map(f64::from));
            uvs.push(mesh.uvs.get(i).copied().unwrap_or_default());
            positions.len() - 1
        });
        remap.push(index);
    }

    let faces: Vec<[usize; 3]> = mesh
        .indices
        .chunks_exact(3)
        .map(|t| [remap[t[0] as usize], remap[t[1] as usize], remap[t[2] as usize]])
        .filter(|f| f[0] != f[1] && f[1] != f[2] && f[0] != f[2])
        .collect();

    let mut quadrics = vec![Quadric::default(); positions.len()];
    let mut vertex_faces = vec![Vec::new(); positions.len()];
    let mut used = vec![false; positions.len()];
    for (fi, f) in faces.iter().enumerate() {
        let [a, b, c] = f.map(|v| positions[v].map(|x| x as f32));
        let n = cross(sub(b, a), sub(c, a));
        let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
        if len > f32::EPSILON {
            let (na, nb, nc) = (f64::from(n[0] / len), f64::from(n[1] / len), f64::from(n[2] / len));
            let p0 = positions[f[0]];
            let d = -(na * p0[0] + nb * p0[1] + nc * p0[2]);
            let plane = Quadric::plane(na, nb, nc, d);
            for &v in f {
                quadrics[v] = quadrics[v].add(&plane);
            }
        }
        for &v in f {
            vertex_faces[v].push(fi);
            used[v] = true;
        }
    }

    let count = positions.len();
    Work {
        positions,
        uvs,
        has_uvs: !mesh.uvs.is_empty(),
        quadrics,
        stamps: vec![0; count],
        alive: used,
        face_alive: vec![true; faces.len()],
        faces,
        vertex_faces,
    }
}

fn compact(work: &Work) -> Mesh {
    let mut remap: HashMap<usize, u32> = HashMap::new();
    let mut out = Mesh::default();
    for (face, _) in work.faces.iter().zip(&work.face_alive).filter(|(_, alive)| **alive) {
        for &v in face {
            let index = *remap.entry(v).or_insert_with(|| {
                out.positions.push(work.positions[v].map(|x| x as f32));
                out.uvs.push(work.uvs[v]);
                (out.positions.len() - 1) as u32
            });
            out.indices.push(index);
        }
    }
    if !work.has_uvs {
        out.uvs.clear();
    }
    out.recompute_normals();
    out.clamp_uvs();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::cube;
    use rstest::rstest;

    #[rstest]
    #[case(4)]
    #[case(6)]
    fn test_cube_is_reduced(#[case] target: usize) {
        let out = QuadricSimplifier::default().simplify(&cube(), target);
        out.validate().unwrap();
        assert!(out.vertex_count() <= target, "{} vertices left", out.vertex_count());
        assert!(out.face_count() < 12);
        assert!(out.face_count() > 0);
    }

    #[test]
    fn test_floor_is_respected() {
        let out = QuadricSimplifier::default().simplify(&cube(), 1);
        assert_eq!(out.vertex_count(), 4);
        assert!(out.face_count() > 0);
    }

    #[test]
    fn test_target_above_count_keeps_shape() {
        let out = QuadricSimplifier::default().simplify(&cube(), 100);
        assert_eq!(out.vertex_count(), 8);
        assert_eq!(out.face_count(), 12);
    }

    #[test]
    fn test_split_seams_are_welded() {
        // Two triangles that share an edge but not vertex indices.
        let mesh = Mesh {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2, 3, 4, 5],
            ..Default::default()
        };
        let out = QuadricSimplifier { min_vertices: 1 }.simplify(&mesh, 100);
        assert_eq!(out.vertex_count(), 4);
        assert_eq!(out.face_count(), 2);
    }

    #[test]
    fn test_uvs_are_clamped_and_normals_present() {
        let mut mesh = cube();
        mesh.uvs[0] = [-3.0, 7.0];
        let out = QuadricSimplifier::default().simplify(&mesh, 6);
        assert_eq!(out.normals.len(), out.vertex_count());
        assert!(out.uvs.iter().flatten().all(|c| (0.0..=1.0).contains(c)));
    }
}
