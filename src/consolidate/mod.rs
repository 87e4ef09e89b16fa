//! Mesh consolidation: welding, surface joining, and cluster decimation.
//!
//! Content nodes merge many records into one payload; these passes keep the
//! merged mesh small enough for its byte budget.

pub mod cluster;
pub mod join;
pub mod weld;

pub use cluster::cluster_decimate;
pub use join::join_surfaces;
pub use weld::{weld, WeldOptions};

use crate::config::ConsolidateConfig;
use crate::types::{GeometryRecord, Surface};
use tracing::{debug, warn};

/// Runs weld, join, and cluster in the order content writing needs.
#[derive(Debug, Clone)]
pub struct Consolidator {
    weld: WeldOptions,
    join: bool,
}

impl Consolidator {
    pub fn new(config: &ConsolidateConfig) -> Self {
        Self {
            weld: WeldOptions {
                epsilon: config.weld_epsilon.max(0.0),
                match_normal: config.match_normal,
                match_color: config.match_color,
                match_uv: config.match_uv,
            },
            join: config.join_surfaces,
        }
    }

    pub fn weld_options(&self) -> &WeldOptions {
        &self.weld
    }

    /// Weld, join, then cluster with `cell_size` (skipped when not positive).
    pub fn consolidate(&self, record: &GeometryRecord, cell_size: f64) -> GeometryRecord {
        let before = record.vertex_count();
        let mut out = weld(record, &self.weld);
        if self.join {
            out = join_surfaces(&out);
        }
        out = cluster_decimate(&out, cell_size);
        debug!(
            vertices_in = before,
            vertices_out = out.vertex_count(),
            faces = out.face_count(),
            cell_size,
            "consolidated record"
        );
        out
    }
}

impl Default for Consolidator {
    fn default() -> Self {
        Self::new(&ConsolidateConfig::default())
    }
}

/// Rewrite every face through `map`, dropping rejected faces and surfaces
/// left without faces. Faces with out-of-range indices are skipped.
pub(crate) fn remap_faces(
    record: &GeometryRecord,
    mut map: impl FnMut(&[u32]) -> Option<Vec<u32>>,
) -> Vec<Surface> {
    let n = record.vertex_count() as u32;
    let mut out_of_range = 0usize;
    let mut surfaces = Vec::with_capacity(record.surfaces.len());
    for surface in &record.surfaces {
        let mut rewritten = Surface::new(surface.material);
        for face in &surface.faces {
            if face.iter().any(|&i| i >= n) {
                out_of_range += 1;
                continue;
            }
            if let Some(face) = map(face) {
                rewritten.faces.push(face);
            }
        }
        if !rewritten.faces.is_empty() {
            surfaces.push(rewritten);
        }
    }
    if out_of_range > 0 {
        warn!(faces = out_of_range, "skipping faces with out-of-range vertex indices");
    }
    surfaces
}

/// Collapse consecutive repeats (cyclically). `None` if any corner is
/// missing or fewer than three distinct corners remain.
pub(crate) fn clean_face(corners: impl Iterator<Item = Option<u32>>) -> Option<Vec<u32>> {
    let mut face: Vec<u32> = corners.collect::<Option<Vec<_>>>()?;
    face.dedup();
    while face.len() > 1 && face.first() == face.last() {
        face.pop();
    }
    let mut distinct = face.clone();
    distinct.sort_unstable();
    distinct.dedup();
    (distinct.len() >= 3).then_some(face)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vertex;

    #[test]
    fn test_clean_face() {
        assert_eq!(clean_face([Some(1), Some(1), Some(2), Some(3), Some(1)].into_iter()), Some(vec![1, 2, 3]));
        assert_eq!(clean_face([Some(1), Some(2), Some(1)].into_iter()), None);
        assert_eq!(clean_face([Some(1), None, Some(2), Some(3)].into_iter()), None);
    }

    #[test]
    fn test_consolidate_pipeline() {
        // Two coplanar unit-spaced triangle fans split across duplicate vertices.
        let mut rec = GeometryRecord::new();
        for i in 0..10 {
            let x = i as f64;
            rec.add_vertex(Vertex::new([x, 0.0, 0.0]));
            rec.add_vertex(Vertex::new([x, 1.0, 0.0]));
            rec.add_vertex(Vertex::new([x, 0.0, 0.0]));
        }
        for i in 0..9u32 {
            let a = i * 3;
            rec.add_face(None, vec![a, a + 3, a + 1]);
            rec.add_face(None, vec![a + 5, a + 4, a + 2]);
        }

        let consolidator = Consolidator::default();
        let fine = consolidator.consolidate(&rec, 0.0);
        assert_eq!(fine.vertex_count(), 20);
        assert_eq!(fine.face_count(), 18);

        let coarse = consolidator.consolidate(&rec, 4.0);
        assert!(coarse.vertex_count() < fine.vertex_count());
        assert!(coarse.face_count() < fine.face_count());
    }
}
