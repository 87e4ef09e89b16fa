//! Vertex welding.

use super::{clean_face, remap_faces};
use crate::types::{GeometryRecord, Vertex};
use std::collections::HashMap;
use tracing::warn;

/// Which attributes must agree for two vertices to weld, and how closely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeldOptions {
    /// Distance tolerance for positions and the matched attributes.
    pub epsilon: f64,
    pub match_normal: bool,
    pub match_color: bool,
    pub match_uv: bool,
}

impl Default for WeldOptions {
    fn default() -> Self {
        Self {
            epsilon: 1e-3,
            match_normal: false,
            match_color: true,
            match_uv: true,
        }
    }
}

impl WeldOptions {
    pub fn exact() -> Self {
        Self {
            epsilon: 0.0,
            ..Self::default()
        }
    }

    fn compatible(&self, a: &Vertex, b: &Vertex) -> bool {
        let eps = self.epsilon;
        if a.feature != b.feature || dist2(&a.position, &b.position) > eps * eps {
            return false;
        }
        if self.match_normal && !close(a.normal.as_ref(), b.normal.as_ref(), eps) {
            return false;
        }
        if self.match_uv && !close(a.uv.as_ref(), b.uv.as_ref(), eps) {
            return false;
        }
        if self.match_color {
            let (ca, cb) = (a.color.map(unit_color), b.color.map(unit_color));
            if !close(ca.as_ref(), cb.as_ref(), eps) {
                return false;
            }
        }
        true
    }
}

fn unit_color(c: [u8; 4]) -> [f64; 4] {
    c.map(|v| v as f64 / 255.0)
}

fn dist2(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// `None` only matches `None`.
fn close<const N: usize>(a: Option<&[f64; N]>, b: Option<&[f64; N]>, eps: f64) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => dist2(a, b) <= eps * eps,
        _ => false,
    }
}

/// Uniform hash grid over vertex positions. With a zero tolerance the key is
/// the exact bit pattern.
enum WeldGrid {
    Exact(HashMap<[u64; 3], Vec<u32>>),
    Cells {
        size: f64,
        cells: HashMap<[i64; 3], Vec<u32>>,
    },
}

impl WeldGrid {
    fn new(epsilon: f64) -> Self {
        if epsilon > 0.0 {
            Self::Cells {
                size: epsilon,
                cells: HashMap::new(),
            }
        } else {
            Self::Exact(HashMap::new())
        }
    }

    /// Bit pattern key with `-0.0` folded onto `0.0`.
    fn exact_key(p: &[f64; 3]) -> [u64; 3] {
        p.map(|c| (c + 0.0).to_bits())
    }

    fn cell(size: f64, p: &[f64; 3]) -> [i64; 3] {
        p.map(|c| (c / size).floor() as i64)
    }

    /// Candidate survivors that may lie within tolerance of `p`.
    fn candidates(&self, p: &[f64; 3], out: &mut Vec<u32>) {
        out.clear();
        match self {
            Self::Exact(map) => {
                if let Some(ids) = map.get(&Self::exact_key(p)) {
                    out.extend_from_slice(ids);
                }
            }
            Self::Cells { size, cells } => {
                let [x, y, z] = Self::cell(*size, p);
                for dx in -1..=1 {
                    for dy in -1..=1 {
                        for dz in -1..=1 {
                            if let Some(ids) = cells.get(&[x + dx, y + dy, z + dz]) {
                                out.extend_from_slice(ids);
                            }
                        }
                    }
                }
                // Survivors are numbered in insertion order; first come wins.
                out.sort_unstable();
            }
        }
    }

    fn insert(&mut self, p: &[f64; 3], id: u32) {
        match self {
            Self::Exact(map) => map.entry(Self::exact_key(p)).or_default().push(id),
            Self::Cells { size, cells } => cells.entry(Self::cell(*size, p)).or_default().push(id),
        }
    }
}

/// Merge vertices within `epsilon` of an earlier survivor.
///
/// Survivors keep their own attributes, so the result never holds two
/// compatible vertices within tolerance of each other and welding it again
/// changes nothing. Faces are remapped and those left with fewer than three
/// distinct corners are dropped.
pub fn weld(record: &GeometryRecord, options: &WeldOptions) -> GeometryRecord {
    let mut grid = WeldGrid::new(options.epsilon);
    let mut survivors: Vec<Vertex> = Vec::with_capacity(record.vertex_count());
    let mut remap: Vec<Option<u32>> = Vec::with_capacity(record.vertex_count());
    let mut candidates = Vec::new();
    let mut invalid = 0usize;

    for v in record.vertices() {
        if !v.has_position() {
            invalid += 1;
            remap.push(None);
            continue;
        }
        grid.candidates(&v.position, &mut candidates);
        let hit = candidates
            .iter()
            .copied()
            .find(|&s| options.compatible(&survivors[s as usize], v));
        let index = match hit {
            Some(s) => s,
            None => {
                let s = survivors.len() as u32;
                grid.insert(&v.position, s);
                survivors.push(*v);
                s
            }
        };
        remap.push(Some(index));
    }

    if invalid > 0 {
        warn!(vertices = invalid, "skipping vertices without a valid position");
    }

    let surfaces = remap_faces(record, |face| clean_face(face.iter().map(|&i| remap.get(i as usize).copied().flatten())));
    GeometryRecord::from_parts(survivors, surfaces, record.materials.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Material;

    fn strip() -> GeometryRecord {
        // Two quads sharing an edge, stored with duplicated edge vertices.
        let mut rec = GeometryRecord::new();
        for p in [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0005, 0.0, 0.0],
            [2.0, 0.0, 0.0],
            [2.0, 1.0, 0.0],
            [1.0, 1.0004, 0.0],
        ] {
            rec.add_vertex(Vertex::new(p));
        }
        let m = rec.add_material(Material::new("asphalt"));
        rec.add_face(Some(m), vec![0, 1, 2, 3]);
        rec.add_face(Some(m), vec![4, 5, 6, 7]);
        rec
    }

    #[test]
    fn test_weld_merges_shared_edge() {
        let welded = weld(&strip(), &WeldOptions::default());
        assert_eq!(welded.vertex_count(), 6);
        assert_eq!(welded.surfaces[0].faces[1], vec![1, 4, 5, 2]);
        // Survivor keeps its own position.
        assert_eq!(welded.vertices()[1].position, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_weld_is_idempotent() {
        let mut rec = strip();
        rec.add_vertex(Vertex::new([0.0, 0.0, 0.0009]).with_color([255, 0, 0, 255]));
        rec.add_vertex(Vertex::new([5.0, 5.0, 5.0]));
        rec.add_face(None, vec![0, 8, 9]);
        for eps in [0.0, 1e-3, 0.01, 1.5] {
            let options = WeldOptions {
                epsilon: eps,
                ..WeldOptions::default()
            };
            let once = weld(&rec, &options);
            let twice = weld(&once, &options);
            assert_eq!(once, twice, "epsilon {eps}");
        }
    }

    #[test]
    fn test_exact_weld_folds_signed_zero() {
        let mut rec = GeometryRecord::new();
        for p in [[0.0, 0.0, 0.0], [-0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]] {
            rec.add_vertex(Vertex::new(p));
        }
        rec.add_face(None, vec![0, 2, 3]);
        rec.add_face(None, vec![0, 1, 2]);

        let welded = weld(&rec, &WeldOptions::exact());
        assert_eq!(welded.vertex_count(), 3);
        // The second triangle collapses onto an edge.
        assert_eq!(welded.face_count(), 1);
    }

    #[test]
    fn test_survivors_are_farther_than_epsilon() {
        let mut rec = GeometryRecord::new();
        for i in 0..200 {
            let t = i as f64 * 0.37;
            rec.add_vertex(Vertex::new([t.sin() * 0.5, (t * 1.3).cos() * 0.5, (i % 7) as f64 * 0.01]));
        }
        let eps = 0.05;
        let welded = weld(&rec, &WeldOptions { epsilon: eps, ..WeldOptions::default() });
        let v = welded.vertices();
        assert!(v.len() < 200);
        for i in 0..v.len() {
            for j in i + 1..v.len() {
                assert!(dist2(&v[i].position, &v[j].position) > eps * eps);
            }
        }
    }

    #[test]
    fn test_degenerate_triangle_dropped() {
        let mut rec = GeometryRecord::new();
        rec.add_vertex(Vertex::new([0.0, 0.0, 0.0]));
        rec.add_vertex(Vertex::new([0.0, 0.0, 0.0001]));
        rec.add_vertex(Vertex::new([1.0, 0.0, 0.0]));
        rec.add_face(None, vec![0, 1, 2]);

        let welded = weld(&rec, &WeldOptions::default());
        assert_eq!(welded.vertex_count(), 2);
        assert_eq!(welded.face_count(), 0);
    }

    #[test]
    fn test_attributes_and_features_block_welding() {
        let mut rec = GeometryRecord::new();
        rec.add_vertex(Vertex::new([0.0, 0.0, 0.0]).with_uv([0.0, 0.0]));
        rec.add_vertex(Vertex::new([0.0, 0.0, 0.0]).with_uv([0.5, 0.0]));
        rec.add_vertex(Vertex::new([0.0, 0.0, 0.0]));
        let mut other = Vertex::new([0.0, 0.0, 0.0]);
        other.feature = 1;
        rec.add_vertex(other);

        assert_eq!(weld(&rec, &WeldOptions::default()).vertex_count(), 4);
        let loose = WeldOptions {
            match_uv: false,
            ..WeldOptions::default()
        };
        assert_eq!(weld(&rec, &loose).vertex_count(), 2);
    }

    #[test]
    fn test_invalid_vertices_and_faces_skipped() {
        let mut rec = strip();
        rec.add_vertex(Vertex::new([f64::NAN, 0.0, 0.0]));
        rec.add_face(None, vec![0, 1, 8]);
        rec.add_face(None, vec![0, 1, 42]);
        let welded = weld(&rec, &WeldOptions::default());
        assert_eq!(welded.vertex_count(), 6);
        assert_eq!(welded.face_count(), 2);
    }
}
