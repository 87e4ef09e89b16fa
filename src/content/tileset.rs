//! Tileset manifest.

use crate::config::VolumeKind;
use crate::crs::CrsService;
use crate::error::{Result, TilerError};
use crate::hierarchy::{NodeId, Tileset};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tracing::info;

/// Build `tileset.json` for a tree whose written content has its `uri` set.
pub fn tileset_json(tileset: &Tileset, volume: VolumeKind, crs: &dyn CrsService) -> Value {
    json!({
        "asset": {
            "version": "1.0",
            "generator": concat!("geotiler ", env!("CARGO_PKG_VERSION")),
        },
        "geometricError": tileset.root().geometric_error,
        "root": node_to_json(tileset, tileset.root, volume, crs),
    })
}

fn node_to_json(tileset: &Tileset, id: NodeId, volume: VolumeKind, crs: &dyn CrsService) -> Value {
    let node = tileset.arena.get(id);
    let bounding_volume = match volume {
        VolumeKind::Region => node.bounding_volume,
        VolumeKind::Box => node.bounding_volume.as_box(crs),
    };

    let mut tile = json!({
        "boundingVolume": bounding_volume.to_json(),
        "geometricError": node.geometric_error,
        "refine": node.refine.as_str(),
    });

    if let Some(uri) = node.content.as_ref().and_then(|c| c.uri.as_ref()) {
        tile["content"] = json!({ "uri": uri });
    }

    if !node.children.is_empty() {
        let children: Vec<Value> = node
            .children
            .iter()
            .map(|&c| node_to_json(tileset, c, volume, crs))
            .collect();
        tile["children"] = json!(children);
    }

    tile
}

/// Write `tileset.json` into `out_dir`. Any failure here is fatal for a run.
pub fn write_tileset(tileset: &Tileset, volume: VolumeKind, crs: &dyn CrsService, out_dir: &Path) -> Result<()> {
    let manifest = tileset_json(tileset, volume, crs);
    let path = out_dir.join("tileset.json");
    let json_string = serde_json::to_string_pretty(&manifest)
        .map_err(|e| TilerError::Manifest(format!("Failed to serialize tileset.json: {e}")))?;
    fs::write(&path, json_string)
        .map_err(|e| TilerError::Manifest(format!("Failed to write {}: {e}", path.display())))?;

    info!(
        nodes = tileset.arena.len(),
        path = %path.display(),
        "Wrote tileset.json"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HierarchyConfig;
    use crate::crs::Wgs84;
    use crate::hierarchy::HierarchyBuilder;
    use crate::types::{AnchorInfo, GeometryRecord, Properties, TileUnit, UnitId, Vertex};

    fn small_tileset() -> Tileset {
        let units: Vec<TileUnit> = (0..4)
            .map(|i| {
                let mut rec = GeometryRecord::new();
                for p in [[0.0, 0.0, 0.0], [20.0, 0.0, 0.0], [0.0, 20.0, 10.0]] {
                    rec.add_vertex(Vertex::new(p));
                }
                rec.add_face(None, vec![0, 1, 2]);
                let anchor = AnchorInfo::new(4.0 + (i % 2) as f64 * 0.01, 52.0 + (i / 2) as f64 * 0.01, 0.0);
                TileUnit::new(UnitId(i), rec, anchor, Properties::new()).unwrap()
            })
            .collect();
        let config = HierarchyConfig::default();
        HierarchyBuilder::new(&config, &Wgs84).build(&units)
    }

    #[test]
    fn test_manifest_mirrors_tree() {
        let mut tileset = small_tileset();
        let root = tileset.root;
        tileset.arena.get_mut(root).content.as_mut().unwrap().uri = Some("tiles/RC.b3dm".to_string());

        let manifest = tileset_json(&tileset, VolumeKind::Region, &Wgs84);
        assert_eq!(manifest["asset"]["version"], "1.0");
        assert_eq!(manifest["root"]["refine"], "REPLACE");
        assert_eq!(manifest["root"]["content"]["uri"], "tiles/RC.b3dm");
        assert_eq!(manifest["root"]["boundingVolume"]["region"].as_array().unwrap().len(), 6);

        let children = manifest["root"]["children"].as_array().unwrap();
        assert_eq!(children.len(), 4);
        // Children were never written, so they carry no content.
        assert!(children.iter().all(|c| c.get("content").is_none()));
    }

    #[test]
    fn test_box_volumes_and_file() {
        let tileset = small_tileset();
        let dir = tempfile::tempdir().unwrap();
        write_tileset(&tileset, VolumeKind::Box, &Wgs84, dir.path()).unwrap();

        let text = std::fs::read_to_string(dir.path().join("tileset.json")).unwrap();
        let manifest: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(manifest["root"]["boundingVolume"]["box"].as_array().unwrap().len(), 12);
    }

    #[test]
    fn test_unwritable_manifest_is_fatal() {
        let tileset = small_tileset();
        let err = write_tileset(&tileset, VolumeKind::Region, &Wgs84, Path::new("/nonexistent/out")).unwrap_err();
        assert!(matches!(err, TilerError::Manifest(_)));
    }
}
