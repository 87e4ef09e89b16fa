//! Grid cluster decimation.

use super::{clean_face, remap_faces};
use crate::types::{GeometryRecord, Vertex};
use std::collections::HashMap;

/// Snap every vertex to the centroid of its grid cell.
///
/// Cells are laid out from the record's bounds minimum. Every occupied cell
/// ends up with a single position; vertices of different features in one
/// cell stay separate vertices at that shared position so batch ids survive.
/// Faces that collapse are removed along with vertices no face references.
/// A non-positive cell size returns the record unchanged.
pub fn cluster_decimate(record: &GeometryRecord, cell_size: f64) -> GeometryRecord {
    if cell_size <= 0.0 || !cell_size.is_finite() {
        return record.clone();
    }
    let Some(bounds) = record.bounds() else {
        return record.clone();
    };
    let origin = bounds.min;
    let key = |p: &[f64; 3]| -> [i64; 3] {
        [0, 1, 2].map(|k| ((p[k] - origin[k]) / cell_size + 1e-6).floor() as i64)
    };

    // Cells in first-seen order so output is deterministic.
    let mut cell_index: HashMap<[i64; 3], usize> = HashMap::new();
    let mut cells: Vec<Vec<u32>> = Vec::new();
    for (i, v) in record.vertices().iter().enumerate() {
        if !v.has_position() {
            continue;
        }
        let slot = *cell_index.entry(key(&v.position)).or_insert_with(|| {
            cells.push(Vec::new());
            cells.len() - 1
        });
        cells[slot].push(i as u32);
    }

    let source = record.vertices();
    let mut vertices: Vec<Vertex> = Vec::with_capacity(cells.len());
    let mut remap: Vec<Option<u32>> = vec![None; source.len()];
    for members in &cells {
        let position = if members.len() == 1 {
            source[members[0] as usize].position
        } else {
            let mut sum = [0.0f64; 3];
            for &m in members {
                let p = source[m as usize].position;
                for k in 0..3 {
                    sum[k] += p[k];
                }
            }
            sum.map(|s| s / members.len() as f64)
        };

        let mut by_feature: Vec<(u32, u32)> = Vec::new();
        for &m in members {
            let v = &source[m as usize];
            let index = match by_feature.iter().find(|(f, _)| *f == v.feature) {
                Some(&(_, index)) => index,
                None => {
                    let index = vertices.len() as u32;
                    vertices.push(Vertex { position, ..*v });
                    by_feature.push((v.feature, index));
                    index
                }
            };
            remap[m as usize] = Some(index);
        }
    }

    let surfaces = remap_faces(record, |face| {
        clean_face(face.iter().map(|&i| remap.get(i as usize).copied().flatten()))
    });

    // Compact away vertices no surviving face uses.
    let mut used = vec![false; vertices.len()];
    for face in surfaces.iter().flat_map(|s| s.faces.iter()) {
        for &i in face {
            used[i as usize] = true;
        }
    }
    let mut compact: Vec<u32> = vec![u32::MAX; vertices.len()];
    let mut kept = Vec::with_capacity(vertices.len());
    for (i, v) in vertices.into_iter().enumerate() {
        if used[i] {
            compact[i] = kept.len() as u32;
            kept.push(v);
        }
    }
    let surfaces = surfaces
        .into_iter()
        .map(|mut s| {
            for face in &mut s.faces {
                for i in face.iter_mut() {
                    *i = compact[*i as usize];
                }
            }
            s
        })
        .collect();

    GeometryRecord::from_parts(kept, surfaces, record.materials.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// A flat grid of `n × n` quads with one-metre spacing.
    fn plane(n: u32) -> GeometryRecord {
        let mut rec = GeometryRecord::new();
        for j in 0..=n {
            for i in 0..=n {
                rec.add_vertex(Vertex::new([i as f64, j as f64, ((i * j) % 3) as f64 * 0.1]));
            }
        }
        let row = n + 1;
        for j in 0..n {
            for i in 0..n {
                let a = j * row + i;
                rec.add_face(None, vec![a, a + 1, a + row + 1, a + row]);
            }
        }
        rec
    }

    fn distinct_positions(rec: &GeometryRecord) -> usize {
        rec.vertices()
            .iter()
            .map(|v| v.position.map(f64::to_bits))
            .collect::<HashSet<_>>()
            .len()
    }

    #[test]
    fn test_vertex_bound() {
        let rec = plane(20);
        for cell in [0.5, 2.0, 3.3, 7.0] {
            let out = cluster_decimate(&rec, cell);
            let occupied: HashSet<[i64; 3]> = rec
                .vertices()
                .iter()
                .map(|v| v.position.map(|c| (c / cell + 1e-6).floor() as i64))
                .collect();
            assert!(distinct_positions(&out) <= occupied.len(), "cell {cell}");
            assert!(out.face_count() <= rec.face_count());
        }
    }

    #[test]
    fn test_small_cell_keeps_record() {
        let rec = plane(4);
        let out = cluster_decimate(&rec, 0.25);
        assert_eq!(out.vertex_count(), rec.vertex_count());
        assert_eq!(out.face_count(), rec.face_count());
        assert_eq!(cluster_decimate(&rec, 0.0), rec);
        assert_eq!(cluster_decimate(&rec, -1.0), rec);
    }

    #[test]
    fn test_collapse_to_nothing() {
        let rec = plane(3);
        let out = cluster_decimate(&rec, 100.0);
        assert_eq!(out.face_count(), 0);
        assert_eq!(out.vertex_count(), 0);
    }

    #[test]
    fn test_features_kept_apart() {
        let mut rec = GeometryRecord::new();
        for (p, feature) in [
            ([0.0, 0.0, 0.0], 0),
            ([5.0, 0.0, 0.0], 0),
            ([0.0, 5.0, 0.0], 0),
            ([0.1, 0.1, 0.0], 1),
            ([5.1, 0.0, 0.0], 1),
            ([0.0, 5.1, 0.0], 1),
        ] {
            let mut v = Vertex::new(p);
            v.feature = feature;
            rec.add_vertex(v);
        }
        rec.add_face(None, vec![0, 1, 2]);
        rec.add_face(None, vec![3, 4, 5]);

        let out = cluster_decimate(&rec, 1.0);
        assert_eq!(out.face_count(), 2);
        assert_eq!(out.vertex_count(), 6);
        assert_eq!(distinct_positions(&out), 3);
        let features: HashSet<u32> = out.vertices().iter().map(|v| v.feature).collect();
        assert_eq!(features.len(), 2);
    }
}
