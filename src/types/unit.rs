//! Tile units: the atomic objects distributed over the tile tree.

use super::{BoundingBox, GeometryRecord, Vertex};
use crate::crs::CrsService;
use crate::error::{Result, TilerError};
use crate::spool::{grid, record};
use glam::{DMat4, DVec3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Named per-feature metadata carried from the source into the batch table.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// Where a geometry record sits in the world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorInfo {
    /// Longitude in degrees.
    pub longitude: f64,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Ellipsoidal height in metres.
    pub height: f64,
    /// Clockwise rotation from north in degrees.
    #[serde(default)]
    pub heading: f64,
    /// Uniform scale from record units to metres.
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl AnchorInfo {
    pub fn new(longitude: f64, latitude: f64, height: f64) -> Self {
        Self {
            longitude,
            latitude,
            height,
            heading: 0.0,
            scale: 1.0,
        }
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = heading;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Anchor position in ECEF.
    pub fn origin(&self, crs: &dyn CrsService) -> DVec3 {
        crs.geographic_to_cartesian(self.longitude, self.latitude, self.height)
    }

    /// Matrix taking record-local coordinates to ECEF.
    pub fn local_to_ecef(&self, crs: &dyn CrsService) -> DMat4 {
        crs.local_tangent_frame(self.origin(crs))
            * DMat4::from_rotation_z(-self.heading.to_radians())
            * DMat4::from_scale(DVec3::splat(self.scale))
    }
}

/// Stable identifier of a tile unit within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u32);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of source a unit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Mesh,
    PointCloud,
}

/// Where a unit's geometry currently lives.
#[derive(Debug, Clone)]
pub enum UnitGeometry {
    /// Held in memory.
    InMemory(GeometryRecord),
    /// Written to a geometry spool file.
    Spooled(PathBuf),
    /// A shuffled point-grid cell file. `to_local` maps the grid frame to the
    /// unit's anchor frame.
    PointCell {
        path: PathBuf,
        to_local: DMat4,
        points: u64,
    },
}

/// One input fragment plus its anchor.
#[derive(Debug, Clone)]
pub struct TileUnit {
    pub id: UnitId,
    pub anchor: AnchorInfo,
    pub kind: UnitKind,
    pub properties: Properties,
    bounds: BoundingBox,
    geometry: UnitGeometry,
}

impl TileUnit {
    /// Wrap an in-memory mesh record. Fails if no vertex has a valid position.
    pub fn new(
        id: UnitId,
        record: GeometryRecord,
        anchor: AnchorInfo,
        properties: Properties,
    ) -> Result<Self> {
        let bounds = record.bounds().ok_or_else(|| {
            TilerError::InvalidInput(format!("unit {id} has no valid vertex positions"))
        })?;
        Ok(Self {
            id,
            anchor,
            kind: UnitKind::Mesh,
            properties,
            bounds,
            geometry: UnitGeometry::InMemory(record),
        })
    }

    /// A point-cloud unit backed by a spooled grid cell.
    pub fn point_cell(
        id: UnitId,
        path: PathBuf,
        to_local: DMat4,
        points: u64,
        bounds: BoundingBox,
        anchor: AnchorInfo,
    ) -> Self {
        Self {
            id,
            anchor,
            kind: UnitKind::PointCloud,
            properties: Properties::new(),
            bounds,
            geometry: UnitGeometry::PointCell {
                path,
                to_local,
                points,
            },
        }
    }

    /// Local bounding box (record units).
    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    /// Bounding diagonal in metres.
    pub fn diagonal(&self) -> f64 {
        self.bounds.diagonal() * self.anchor.scale
    }

    pub fn geometry(&self) -> &UnitGeometry {
        &self.geometry
    }

    /// True once the geometry no longer lives in memory.
    pub fn is_spooled(&self) -> bool {
        !matches!(self.geometry, UnitGeometry::InMemory(_))
    }

    /// Number of points for point-cloud units.
    pub fn point_count(&self) -> u64 {
        match &self.geometry {
            UnitGeometry::PointCell { points, .. } => *points,
            _ => 0,
        }
    }

    /// Write the in-memory record to `dir` and release it.
    pub fn spool(&mut self, dir: &Path) -> Result<()> {
        if let UnitGeometry::InMemory(rec) = &self.geometry {
            let path = dir.join(format!("unit_{}.grec", self.id));
            record::write_record_file(&path, rec)?;
            self.geometry = UnitGeometry::Spooled(path);
        }
        Ok(())
    }

    /// Materialize the full geometry.
    pub fn load_geometry(&self) -> Result<GeometryRecord> {
        self.load_sampled(None)
    }

    /// Materialize geometry, keeping at most `limit` points for point cells.
    /// Mesh units ignore the limit.
    pub fn load_sampled(&self, limit: Option<usize>) -> Result<GeometryRecord> {
        match &self.geometry {
            UnitGeometry::InMemory(rec) => Ok(rec.clone()),
            UnitGeometry::Spooled(path) => record::read_record_file(path),
            UnitGeometry::PointCell { path, to_local, .. } => {
                let cell = grid::read_cell(path, limit)?;
                let mut rec = GeometryRecord::new();
                for (p, rgb) in cell {
                    let local = to_local.transform_point3(DVec3::from_array(p));
                    rec.add_vertex(
                        Vertex::new(local.to_array()).with_color([rgb[0], rgb[1], rgb[2], 255]),
                    );
                }
                Ok(rec)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::Wgs84;

    fn square() -> GeometryRecord {
        let mut rec = GeometryRecord::new();
        for p in [[0.0, 0.0, 0.0], [4.0, 0.0, 0.0], [4.0, 3.0, 0.0], [0.0, 3.0, 0.0]] {
            rec.add_vertex(Vertex::new(p));
        }
        rec.add_face(None, vec![0, 1, 2, 3]);
        rec
    }

    #[test]
    fn test_unit_bounds_and_diagonal() {
        let unit = TileUnit::new(
            UnitId(7),
            square(),
            AnchorInfo::new(10.0, 50.0, 0.0).with_scale(2.0),
            Properties::new(),
        )
        .unwrap();
        assert_eq!(unit.bounds().max, [4.0, 3.0, 0.0]);
        assert_eq!(unit.diagonal(), 10.0);
        assert!(!unit.is_spooled());
    }

    #[test]
    fn test_empty_record_rejected() {
        let res = TileUnit::new(UnitId(0), GeometryRecord::new(), AnchorInfo::new(0.0, 0.0, 0.0), Properties::new());
        assert!(res.is_err());
    }

    #[test]
    fn test_spool_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = TileUnit::new(UnitId(3), square(), AnchorInfo::new(0.0, 0.0, 0.0), Properties::new()).unwrap();
        unit.spool(dir.path()).unwrap();
        assert!(unit.is_spooled());
        let rec = unit.load_geometry().unwrap();
        assert_eq!(rec, square());
    }

    #[test]
    fn test_local_to_ecef_heading() {
        let crs = Wgs84;
        let anchor = AnchorInfo::new(0.0, 0.0, 0.0).with_heading(90.0);
        let m = anchor.local_to_ecef(&crs);
        // Local +y (north) turns to east under a 90° clockwise heading.
        let p = m.transform_point3(DVec3::new(0.0, 10.0, 0.0));
        let east = crs.local_tangent_frame(anchor.origin(&crs)).x_axis.truncate();
        let d = p - anchor.origin(&crs);
        assert!((d.dot(east) - 10.0).abs() < 1e-6);
    }
}
