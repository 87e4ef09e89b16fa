//! Per-node content serialization.

use super::{batch_table, batched, points};
use crate::config::TilerConfig;
use crate::consolidate::Consolidator;
use crate::crs::CrsService;
use crate::error::{IoContext, Result, TilerError};
use crate::hierarchy::{ContentRef, Node};
use crate::types::{GeometryRecord, TileUnit, UnitId, UnitKind};
use glam::DVec3;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Largest number of cell-size doublings tried to fit the byte budget.
const MAX_BUDGET_RETRIES: usize = 8;

/// Directory under the output root that holds content files.
pub const TILES_DIR: &str = "tiles";

/// Encodes and writes the content of single nodes.
pub struct ContentWriter<'a> {
    config: &'a TilerConfig,
    crs: &'a dyn CrsService,
    consolidator: Consolidator,
    out_dir: PathBuf,
}

impl<'a> ContentWriter<'a> {
    pub fn new(config: &'a TilerConfig, crs: &'a dyn CrsService, out_dir: &Path) -> Self {
        Self {
            config,
            crs,
            consolidator: Consolidator::new(&config.consolidate),
            out_dir: out_dir.to_path_buf(),
        }
    }

    /// Encode and write a node's content. Returns the URI relative to the
    /// output directory.
    pub fn write(&self, node: &Node, units: &HashMap<UnitId, &TileUnit>) -> Result<String> {
        let content = node
            .content
            .as_ref()
            .ok_or_else(|| TilerError::Export(format!("node {} has no content", node.code)))?;
        let members = resolve(content, units)?;
        let (bytes, extension) = self.encode(node, content, &members)?;

        let uri = format!("{TILES_DIR}/{}.{extension}", content.code);
        let path = self.out_dir.join(&uri);
        std::fs::write(&path, &bytes).with_path(&path)?;
        debug!(code = %content.code, bytes = bytes.len(), units = members.len(), "wrote content");
        Ok(uri)
    }

    /// Encoded bytes and file extension for a node's content.
    pub fn encode(&self, node: &Node, content: &ContentRef, members: &[&TileUnit]) -> Result<(Vec<u8>, &'static str)> {
        let rtc = node.bounding_volume.center_ecef(self.crs);
        let table = batch_table(&members.iter().map(|u| &u.properties).collect::<Vec<_>>());

        match members.first().map(|u| u.kind) {
            Some(UnitKind::PointCloud) => {
                let counts: Vec<u64> = members.iter().map(|u| u.point_count()).collect();
                let limits = points::sample_limits(&counts, content.lod, self.config.max_points_per_tile);
                let mut merged = GeometryRecord::new();
                for (batch, (unit, limit)) in members.iter().zip(limits).enumerate() {
                    let record = unit.load_sampled(Some(limit))?;
                    merged.merge(&self.to_rtc(unit, record, rtc, batch as u32));
                }
                let payload = points::points_payload(&merged, rtc.to_array(), table, members.len());
                let bytes = payload.encode()?;
                if bytes.len() > self.config.max_content_bytes {
                    warn!(code = %content.code, bytes = bytes.len(), "point content exceeds byte budget");
                }
                Ok((bytes, payload.extension()))
            }
            Some(UnitKind::Mesh) => {
                let mut merged = GeometryRecord::new();
                for (batch, unit) in members.iter().enumerate() {
                    let record = unit.load_geometry()?;
                    merged.merge(&self.to_rtc(unit, record, rtc, batch as u32));
                }
                let bytes = self.encode_mesh(node, content, &merged, rtc, &table, members.len())?;
                Ok((bytes, "b3dm"))
            }
            None => Err(TilerError::Export(format!("content {} has no units", content.code))),
        }
    }

    /// Consolidate and encode, doubling the cluster cell until the payload
    /// fits the byte budget.
    fn encode_mesh(
        &self,
        node: &Node,
        content: &ContentRef,
        merged: &GeometryRecord,
        rtc: DVec3,
        table: &serde_json::Value,
        batch_length: usize,
    ) -> Result<Vec<u8>> {
        let consolidate = &self.config.consolidate;
        let mut cell = node.geometric_error * consolidate.cluster_ratio;
        if cell < consolidate.min_cluster_cell {
            cell = 0.0;
        }

        let mut best: Option<Vec<u8>> = None;
        for attempt in 0..=MAX_BUDGET_RETRIES {
            let record = self.consolidator.consolidate(merged, cell);
            if record.triangle_count() == 0 {
                if best.is_some() {
                    warn!(code = %content.code, cell, "clustering collapsed the mesh, keeping previous level");
                    break;
                }
                return Err(TilerError::Export(format!("content {} has no triangles", content.code)));
            }

            let payload = batched::batched_payload(&record, rtc.to_array(), table.clone(), batch_length)?;
            let bytes = payload.encode()?;
            let fits = bytes.len() <= self.config.max_content_bytes;
            best = Some(bytes);
            if fits {
                break;
            }
            debug!(code = %content.code, attempt, cell, "content over byte budget, coarsening");
            cell = if cell > 0.0 {
                cell * 2.0
            } else {
                consolidate.min_cluster_cell.max(0.01)
            };
        }

        let bytes = best.ok_or_else(|| TilerError::Export(format!("content {} produced no payload", content.code)))?;
        if bytes.len() > self.config.max_content_bytes {
            warn!(code = %content.code, bytes = bytes.len(), "content exceeds byte budget after coarsening");
        }
        Ok(bytes)
    }

    /// Move a unit record into ECEF relative to `rtc` and tag its batch id.
    fn to_rtc(&self, unit: &TileUnit, mut record: GeometryRecord, rtc: DVec3, batch: u32) -> GeometryRecord {
        let m = unit.anchor.local_to_ecef(self.crs);
        record.transform(
            |p| (m.transform_point3(DVec3::from_array(p)) - rtc).to_array(),
            |n| m.transform_vector3(DVec3::from_array(n)).normalize_or_zero().to_array(),
        );
        record.set_feature(batch);
        record
    }
}

fn resolve<'u>(content: &ContentRef, units: &HashMap<UnitId, &'u TileUnit>) -> Result<Vec<&'u TileUnit>> {
    content
        .units
        .iter()
        .map(|id| {
            units
                .get(id)
                .copied()
                .ok_or_else(|| TilerError::Export(format!("content {} references unknown unit {id}", content.code)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentHeader;
    use crate::crs::Wgs84;
    use crate::hierarchy::{HierarchyBuilder, Lod};
    use crate::types::{AnchorInfo, Material, Properties, Vertex};
    use serde_json::{json, Value};

    /// Flat-ish `size` metre roof split into `n × n` quads.
    fn grid_roof(n: u32, size: f64) -> GeometryRecord {
        let mut rec = GeometryRecord::new();
        let m = rec.add_material(Material::new("roof").with_color([180, 60, 40, 255]));
        let step = size / n as f64;
        for j in 0..=n {
            for i in 0..=n {
                rec.add_vertex(Vertex::new([i as f64 * step, j as f64 * step, 10.0 + ((i + j) % 2) as f64 * 0.1]));
            }
        }
        let row = n + 1;
        for j in 0..n {
            for i in 0..n {
                let a = j * row + i;
                rec.add_face(Some(m), vec![a, a + 1, a + row + 1, a + row]);
            }
        }
        rec
    }

    fn units() -> Vec<TileUnit> {
        (0..3)
            .map(|i| {
                let mut props = Properties::new();
                props.insert("name".to_string(), json!(format!("block {i}")));
                let anchor = AnchorInfo::new(6.0 + i as f64 * 0.002, 46.0, 400.0);
                TileUnit::new(UnitId(i), grid_roof(40, 40.0), anchor, props).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_write_mesh_content() {
        let units = units();
        let config = TilerConfig::default();
        let tileset = HierarchyBuilder::new(&config.hierarchy, &Wgs84).build(&units);
        let index: HashMap<UnitId, &TileUnit> = units.iter().map(|u| (u.id, u)).collect();

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(TILES_DIR)).unwrap();
        let writer = ContentWriter::new(&config, &Wgs84, dir.path());

        let root = tileset.root();
        assert_eq!(root.content.as_ref().unwrap().lod, Lod::LOD3);
        let uri = writer.write(root, &index).unwrap();
        assert_eq!(uri, "tiles/RC.b3dm");

        let bytes = std::fs::read(dir.path().join(&uri)).unwrap();
        let header = ContentHeader::parse(&bytes).unwrap();
        assert_eq!(&header.magic, b"b3dm");
        let ft_end = 28 + header.feature_json as usize;
        let ft: Value = serde_json::from_slice(&bytes[28..ft_end]).unwrap();
        assert_eq!(ft["BATCH_LENGTH"], 3);
        let bt_start = ft_end + header.feature_binary as usize;
        let bt: Value = serde_json::from_slice(&bytes[bt_start..bt_start + header.batch_json as usize]).unwrap();
        assert_eq!(bt["name"], json!(["block 0", "block 1", "block 2"]));
    }

    #[test]
    fn test_byte_budget_coarsens() {
        let units = units();
        let config = TilerConfig::default();
        let tileset = HierarchyBuilder::new(&config.hierarchy, &Wgs84).build(&units);
        let root = tileset.root();
        let content = root.content.as_ref().unwrap();
        let members: Vec<&TileUnit> = units.iter().collect();

        let roomy = ContentWriter::new(&config, &Wgs84, Path::new("."));
        let (full, _) = roomy.encode(root, content, &members).unwrap();

        let tight_config = TilerConfig::default().with_max_content_bytes(full.len() / 4);
        let tight = ContentWriter::new(&tight_config, &Wgs84, Path::new("."));
        let (small, ext) = tight.encode(root, content, &members).unwrap();
        assert_eq!(ext, "b3dm");
        assert!(small.len() < full.len());
    }

    #[test]
    fn test_unknown_unit_is_an_error() {
        let units = units();
        let config = TilerConfig::default();
        let tileset = HierarchyBuilder::new(&config.hierarchy, &Wgs84).build(&units);
        let writer = ContentWriter::new(&config, &Wgs84, Path::new("."));
        assert!(writer.write(tileset.root(), &HashMap::new()).is_err());
    }
}
