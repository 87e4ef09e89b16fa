//! Tile hierarchy construction.
//!
//! Units are partitioned top down. A node holding more than `max_count`
//! units is structural and is quartered by geographic quadrant. Otherwise
//! it becomes a content node (code marked with `C`) that keeps refining into
//! quadrants, one LOD lower per level, until the units no longer separate or
//! the lowest LOD is reached.

pub mod node;

pub use node::{ContentRef, Lod, Node, NodeArena, NodeId, Tileset};

use crate::config::{HierarchyConfig, Refine};
use crate::crs::CrsService;
use crate::types::TileUnit;
use crate::volume::BoundingVolume;
use tracing::{debug, info};

/// Per-unit values the partitioner needs, computed once.
struct UnitInfo {
    region: BoundingVolume,
    /// Anchor longitude and latitude, radians.
    lon: f64,
    lat: f64,
    diagonal: f64,
}

pub struct HierarchyBuilder<'a> {
    config: &'a HierarchyConfig,
    crs: &'a dyn CrsService,
}

impl<'a> HierarchyBuilder<'a> {
    pub fn new(config: &'a HierarchyConfig, crs: &'a dyn CrsService) -> Self {
        Self { config, crs }
    }

    /// Build the tile tree over `units`. Leaves partition the input exactly.
    pub fn build(&self, units: &[TileUnit]) -> Tileset {
        let mut arena = NodeArena::new();

        if units.is_empty() {
            let root = arena.push(Node {
                code: "R".to_string(),
                parent: None,
                bounding_volume: BoundingVolume::point(0.0, 0.0, 0.0),
                geometric_error: 0.0,
                refine: Refine::Replace,
                children: Vec::new(),
                content: None,
            });
            info!("no units to tile");
            return Tileset { arena, root };
        }

        let info: Vec<UnitInfo> = units
            .iter()
            .map(|unit| {
                let to_ecef = unit.anchor.local_to_ecef(self.crs);
                UnitInfo {
                    region: BoundingVolume::from_local_box(&unit.bounds(), &to_ecef, self.crs),
                    lon: unit.anchor.longitude.to_radians(),
                    lat: unit.anchor.latitude.to_radians(),
                    diagonal: unit.diagonal(),
                }
            })
            .collect();

        let members: Vec<usize> = (0..units.len()).collect();
        let mut state = BuildState {
            builder: self,
            units,
            info: &info,
            arena,
        };
        let root = state.node("R".to_string(), members, None);
        let tileset = Tileset {
            arena: state.arena,
            root,
        };

        info!(
            units = units.len(),
            nodes = tileset.arena.len(),
            content = tileset.content_nodes().len(),
            depth = tileset.depth(),
            "built tile hierarchy"
        );
        tileset
    }

    fn max_count(&self) -> usize {
        self.config.max_count.max(1)
    }

    fn lod_range(&self) -> (Lod, Lod) {
        let max = Lod::new(self.config.max_lod);
        (Lod::new(self.config.min_lod).min(max), max)
    }
}

struct BuildState<'b, 'a> {
    builder: &'b HierarchyBuilder<'a>,
    units: &'b [TileUnit],
    info: &'b [UnitInfo],
    arena: NodeArena,
}

impl BuildState<'_, '_> {
    fn node(&mut self, code: String, members: Vec<usize>, parent: Option<NodeId>) -> NodeId {
        let volume = members
            .iter()
            .map(|&m| self.info[m].region)
            .reduce(|a, b| a.union(&b))
            .unwrap_or(BoundingVolume::point(0.0, 0.0, 0.0));
        let max_diagonal = members.iter().map(|&m| self.info[m].diagonal).fold(0.0, f64::max);

        if members.len() > self.builder.max_count() {
            self.structural(code, members, parent, volume, max_diagonal)
        } else {
            self.content(code, members, parent, volume, max_diagonal)
        }
    }

    fn structural(
        &mut self,
        code: String,
        members: Vec<usize>,
        parent: Option<NodeId>,
        volume: BoundingVolume,
        max_diagonal: f64,
    ) -> NodeId {
        let groups = match self.quadrant_split(&members, &volume) {
            Some(groups) => groups,
            None => self.rank_split(members),
        };
        debug!(code = %code, "structural node");

        let id = self.arena.push(Node {
            code: code.clone(),
            parent,
            bounding_volume: volume,
            geometric_error: max_diagonal,
            refine: Refine::Replace,
            children: Vec::new(),
            content: None,
        });
        for (digit, group) in groups.into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            let child = self.node(format!("{code}{digit}"), group, Some(id));
            self.arena.get_mut(id).children.push(child);
        }
        id
    }

    fn content(
        &mut self,
        mut code: String,
        members: Vec<usize>,
        parent: Option<NodeId>,
        volume: BoundingVolume,
        max_diagonal: f64,
    ) -> NodeId {
        if !code.contains('C') {
            code.push('C');
        }
        let (min, max) = self.builder.lod_range();
        let lod = Lod::from_code(&code, min, max);
        let geometric_error = max_diagonal.max(lod.error_floor());
        debug!(code = %code, lod = %lod, units = members.len(), geometric_error, "content node");

        let content = ContentRef {
            code: code.clone(),
            lod,
            units: members.iter().map(|&m| self.units[m].id).collect(),
            uri: None,
        };
        let refine = match parent.map(|p| self.arena.get(p).content.is_some()) {
            Some(true) => self.builder.config.refine,
            _ => Refine::Replace,
        };
        let id = self.arena.push(Node {
            code: code.clone(),
            parent,
            bounding_volume: volume,
            geometric_error,
            refine,
            children: Vec::new(),
            content: Some(content),
        });

        if lod > min && members.len() > 1 {
            if let Some(groups) = self.quadrant_split(&members, &volume) {
                for (digit, group) in groups.into_iter().enumerate() {
                    if group.is_empty() {
                        continue;
                    }
                    let child = self.node(format!("{code}{digit}"), group, Some(id));
                    self.arena.get_mut(id).children.push(child);
                }
            }
        }
        id
    }

    /// Group members by the quadrant holding their anchor. `None` when every
    /// member lands in the same quadrant.
    fn quadrant_split(&self, members: &[usize], volume: &BoundingVolume) -> Option<[Vec<usize>; 4]> {
        let volume = if self.builder.config.square_regions {
            volume.to_square()
        } else {
            *volume
        };
        let mut groups: [Vec<usize>; 4] = Default::default();
        for &m in members {
            let info = &self.info[m];
            groups[volume.quadrant_of(info.lon, info.lat)].push(m);
        }
        let occupied = groups.iter().filter(|g| !g.is_empty()).count();
        (occupied > 1).then_some(groups)
    }

    /// Four rank slices ordered by longitude, latitude, then id.
    fn rank_split(&self, mut members: Vec<usize>) -> [Vec<usize>; 4] {
        members.sort_by(|&a, &b| {
            let (ia, ib) = (&self.info[a], &self.info[b]);
            ia.lon
                .total_cmp(&ib.lon)
                .then(ia.lat.total_cmp(&ib.lat))
                .then(self.units[a].id.cmp(&self.units[b].id))
        });
        let slice = members.len().div_ceil(4);
        let mut groups: [Vec<usize>; 4] = Default::default();
        for (i, chunk) in members.chunks(slice.max(1)).enumerate().take(4) {
            groups[i] = chunk.to_vec();
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::Wgs84;
    use crate::types::{AnchorInfo, GeometryRecord, Properties, UnitId, Vertex};
    use std::collections::HashMap;

    /// A flat box unit with the given footprint, anchored at lon/lat.
    fn unit(id: u32, lon: f64, lat: f64, size: f64) -> TileUnit {
        let mut rec = GeometryRecord::new();
        rec.add_vertex(Vertex::new([0.0, 0.0, 0.0]));
        rec.add_vertex(Vertex::new([size, 0.0, 0.0]));
        rec.add_vertex(Vertex::new([0.0, size, 0.0]));
        rec.add_face(None, vec![0, 1, 2]);
        TileUnit::new(UnitId(id), rec, AnchorInfo::new(lon, lat, 0.0), Properties::new()).unwrap()
    }

    fn grid_units(nx: u32, ny: u32) -> Vec<TileUnit> {
        let mut units = Vec::new();
        for j in 0..ny {
            for i in 0..nx {
                units.push(unit(j * nx + i, 9.0 + i as f64 * 0.001, 48.0 + j as f64 * 0.001, 8.0));
            }
        }
        units
    }

    fn leaf_units(tileset: &Tileset) -> Vec<UnitId> {
        let mut all: Vec<UnitId> = tileset
            .leaves()
            .into_iter()
            .filter_map(|id| tileset.arena.get(id).content.as_ref())
            .flat_map(|c| c.units.iter().copied())
            .collect();
        all.sort();
        all
    }

    #[test]
    fn test_partition_completeness() {
        let units = grid_units(40, 25);
        let config = HierarchyConfig::default();
        let tileset = HierarchyBuilder::new(&config, &Wgs84).build(&units);

        let ids = leaf_units(&tileset);
        assert_eq!(ids.len(), 1000);
        let expected: Vec<UnitId> = (0..1000).map(UnitId).collect();
        assert_eq!(ids, expected);

        for id in tileset.content_nodes() {
            assert!(tileset.arena.get(id).content.as_ref().unwrap().units.len() <= 256);
        }
    }

    #[test]
    fn test_single_small_input() {
        // 6 × 8 × 0 box: diagonal 10 m.
        let mut rec = GeometryRecord::new();
        rec.add_vertex(Vertex::new([0.0, 0.0, 0.0]));
        rec.add_vertex(Vertex::new([6.0, 8.0, 0.0]));
        rec.add_vertex(Vertex::new([6.0, 0.0, 0.0]));
        rec.add_face(None, vec![0, 1, 2]);
        let units = vec![TileUnit::new(UnitId(0), rec, AnchorInfo::new(2.0, 45.0, 0.0), Properties::new()).unwrap()];

        let config = HierarchyConfig::default();
        let tileset = HierarchyBuilder::new(&config, &Wgs84).build(&units);

        assert_eq!(tileset.arena.len(), 1);
        let root = tileset.root();
        assert!(root.is_leaf());
        let content = root.content.as_ref().unwrap();
        assert_eq!(content.lod, Lod::LOD3);
        assert_eq!(content.code, "RC");
        assert_eq!(root.geometric_error, 10.0);
    }

    #[test]
    fn test_oversized_input_set() {
        let units = grid_units(25, 20);
        let config = HierarchyConfig::default();
        let tileset = HierarchyBuilder::new(&config, &Wgs84).build(&units);

        let root = tileset.root();
        assert!(root.content.is_none());
        assert_eq!(root.refine, Refine::Replace);
        assert_eq!(root.children.len(), 4);
        let codes: Vec<&str> = root.children.iter().map(|&c| tileset.arena.get(c).code.as_str()).collect();
        assert_eq!(codes, vec!["R0C", "R1C", "R2C", "R3C"]);
        for &child in &root.children {
            let content = tileset.arena.get(child).content.as_ref().unwrap();
            assert!(content.units.len() <= 256);
            assert_eq!(content.lod, Lod::LOD3);
        }
        assert_eq!(leaf_units(&tileset).len(), 500);
    }

    #[test]
    fn test_content_refines_with_lower_lod() {
        let units = grid_units(4, 4);
        let config = HierarchyConfig::default();
        let tileset = HierarchyBuilder::new(&config, &Wgs84).build(&units);

        let root = tileset.root();
        assert_eq!(root.content.as_ref().unwrap().lod, Lod::LOD3);
        assert_eq!(root.children.len(), 4);
        for &c in &root.children {
            let child = tileset.arena.get(c);
            let content = child.content.as_ref().unwrap();
            assert_eq!(content.lod, Lod::LOD2);
            assert!(content.code.starts_with("RC"));
            assert_eq!(child.geometric_error, 128f64.sqrt());
        }
        assert_eq!(leaf_units(&tileset).len(), 16);
    }

    #[test]
    fn test_volume_containment() {
        let units = grid_units(30, 30);
        let config = HierarchyConfig {
            max_count: 50,
            ..HierarchyConfig::default()
        };
        let tileset = HierarchyBuilder::new(&config, &Wgs84).build(&units);
        let by_id: HashMap<UnitId, &TileUnit> = units.iter().map(|u| (u.id, u)).collect();

        for (_, node) in tileset.arena.iter() {
            for &c in &node.children {
                assert!(node.bounding_volume.contains(&tileset.arena.get(c).bounding_volume));
            }
            if let Some(content) = &node.content {
                for id in &content.units {
                    let u = by_id[id];
                    let region = BoundingVolume::from_local_box(&u.bounds(), &u.anchor.local_to_ecef(&Wgs84), &Wgs84);
                    assert!(node.bounding_volume.contains(&region));
                }
            }
        }
    }

    #[test]
    fn test_coincident_anchors_fall_back_to_rank_split() {
        let units: Vec<TileUnit> = (0..20).map(|i| unit(i, 5.0, 5.0, 1.0)).collect();
        let config = HierarchyConfig {
            max_count: 4,
            ..HierarchyConfig::default()
        };
        let tileset = HierarchyBuilder::new(&config, &Wgs84).build(&units);
        assert_eq!(tileset.root().children.len(), 4);
        assert_eq!(leaf_units(&tileset).len(), 20);
    }

    #[test]
    fn test_empty_input() {
        let config = HierarchyConfig::default();
        let tileset = HierarchyBuilder::new(&config, &Wgs84).build(&[]);
        assert_eq!(tileset.arena.len(), 1);
        assert!(tileset.root().content.is_none());
        assert!(tileset.root().children.is_empty());
    }
}
