//! Importer interfaces and two small reference importers.
//!
//! Real format readers (CAD, CityGML, shapefiles, LAS/LAZ) live outside this
//! crate and plug in through [`GeometryImporter`] and [`PointCloudImporter`].
//! [`JsonMeshImporter`] and [`XyzPointImporter`] cover simple interchange
//! files and back the CLI.

use crate::error::{IoContext, Result, TilerError};
use crate::types::{AnchorInfo, BoundingBox, GeometryRecord, Material, Properties, Surface, Vertex};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::warn;

/// One geometry produced by an importer.
#[derive(Debug, Clone)]
pub struct ImportedGeometry {
    pub record: GeometryRecord,
    pub anchor: AnchorInfo,
    pub properties: Properties,
}

/// Loads mesh or vector sources.
pub trait GeometryImporter: Send + Sync {
    fn load_geometry(&self, path: &Path) -> Result<Vec<ImportedGeometry>>;
}

/// Declared size of a point-cloud input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointCloudHeader {
    pub point_count: u64,
    /// Bounds in the source CRS.
    pub bounds: BoundingBox,
}

/// A point in the source CRS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub position: [f64; 3],
    pub color: [u8; 3],
}

pub type PointStream = Box<dyn Iterator<Item = Result<Point>> + Send>;

/// Streams point-cloud sources without materializing them.
pub trait PointCloudImporter: Send + Sync {
    fn read_header(&self, path: &Path) -> Result<PointCloudHeader>;
    fn stream_points(&self, path: &Path) -> Result<PointStream>;
}

// JSON feature document
#[derive(Deserialize)]
struct FeatureDocument {
    features: Vec<FeatureEntry>,
}

#[derive(Deserialize)]
struct FeatureEntry {
    anchor: AnchorInfo,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    materials: Vec<MaterialEntry>,
    #[serde(default)]
    vertices: Vec<[f64; 3]>,
    #[serde(default)]
    normals: Option<Vec<[f64; 3]>>,
    #[serde(default)]
    colors: Option<Vec<[u8; 4]>>,
    #[serde(default)]
    uvs: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    surfaces: Vec<SurfaceEntry>,
    /// Vector footprint (local metres) extruded into a prism.
    #[serde(default)]
    footprint: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    extrude: Option<f64>,
}

#[derive(Deserialize)]
struct MaterialEntry {
    name: String,
    #[serde(default = "default_color")]
    color: [u8; 4],
    #[serde(default)]
    texture: Option<PathBuf>,
}

fn default_color() -> [u8; 4] {
    [255, 255, 255, 255]
}

#[derive(Deserialize)]
struct SurfaceEntry {
    #[serde(default)]
    material: Option<usize>,
    faces: Vec<Vec<u32>>,
}

/// Reads a JSON document of features, each either an explicit mesh or an
/// extruded footprint.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMeshImporter;

impl GeometryImporter for JsonMeshImporter {
    fn load_geometry(&self, path: &Path) -> Result<Vec<ImportedGeometry>> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let doc: FeatureDocument = serde_json::from_str(&content)?;
        let base = path.parent().unwrap_or(Path::new("."));

        Ok(doc
            .features
            .into_iter()
            .enumerate()
            .filter_map(|(i, entry)| match feature_to_record(entry, base) {
                Ok(imported) => Some(imported),
                Err(e) => {
                    warn!(path = %path.display(), feature = i, error = %e, "skipping feature");
                    None
                }
            })
            .collect())
    }
}

fn feature_to_record(entry: FeatureEntry, base: &Path) -> Result<ImportedGeometry> {
    let mut record = GeometryRecord::new();
    for m in entry.materials {
        let mut material = Material::new(m.name).with_color(m.color);
        material.texture = m.texture.map(|t| if t.is_relative() { base.join(t) } else { t });
        record.add_material(material);
    }

    if let (Some(footprint), Some(height)) = (&entry.footprint, entry.extrude) {
        extrude_footprint(&mut record, footprint, height)?;
    } else {
        for (i, p) in entry.vertices.iter().enumerate() {
            let mut v = Vertex::new(*p);
            v.normal = entry.normals.as_ref().and_then(|n| n.get(i).copied());
            v.color = entry.colors.as_ref().and_then(|c| c.get(i).copied());
            v.uv = entry.uvs.as_ref().and_then(|u| u.get(i).copied());
            record.add_vertex(v);
        }
        for s in entry.surfaces {
            record.surfaces.push(Surface {
                material: s.material,
                faces: s.faces,
            });
        }
    }

    if record.is_empty() {
        return Err(TilerError::InvalidInput("feature has no geometry".to_string()));
    }

    Ok(ImportedGeometry {
        record,
        anchor: entry.anchor,
        properties: entry.properties,
    })
}

/// Walls plus roof and floor for a footprint ring.
fn extrude_footprint(record: &mut GeometryRecord, ring: &[[f64; 2]], height: f64) -> Result<()> {
    let mut ring = ring.to_vec();
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    if ring.len() < 3 {
        return Err(TilerError::InvalidInput(format!(
            "footprint has {} points, need at least 3",
            ring.len()
        )));
    }

    // Counter-clockwise rings keep wall normals pointing outwards.
    let area: f64 = (0..ring.len())
        .map(|i| {
            let (a, b) = (ring[i], ring[(i + 1) % ring.len()]);
            a[0] * b[1] - b[0] * a[1]
        })
        .sum();
    if area < 0.0 {
        ring.reverse();
    }

    let material = (!record.materials.is_empty()).then_some(0);
    let n = ring.len() as u32;
    for p in &ring {
        record.add_vertex(Vertex::new([p[0], p[1], 0.0]));
    }
    for p in &ring {
        record.add_vertex(Vertex::new([p[0], p[1], height]));
    }
    for i in 0..n {
        let j = (i + 1) % n;
        record.add_face(material, vec![i, j, n + j, n + i]);
    }
    record.add_face(material, (n..2 * n).collect());
    record.add_face(material, (0..n).rev().collect());
    Ok(())
}

/// Whitespace separated `x y z [r g b]` text, one point per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct XyzPointImporter;

fn parse_xyz_line(line: &str) -> Option<Result<Point>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
        return None;
    }
    let fields: Vec<&str> = line.split(|c: char| c.is_whitespace() || c == ',').filter(|f| !f.is_empty()).collect();
    let parsed = (|| {
        if fields.len() < 3 {
            return Err(TilerError::InvalidInput(format!("point line has {} fields", fields.len())));
        }
        let num = |s: &str| {
            s.parse::<f64>()
                .map_err(|_| TilerError::InvalidInput(format!("bad coordinate '{s}'")))
        };
        let position = [num(fields[0])?, num(fields[1])?, num(fields[2])?];
        let mut color = [255u8; 3];
        if fields.len() >= 6 {
            for (k, c) in color.iter_mut().enumerate() {
                *c = fields[3 + k].parse::<f64>().map(|v| v.clamp(0.0, 255.0) as u8).unwrap_or(255);
            }
        }
        Ok(Point { position, color })
    })();
    Some(parsed)
}

impl PointCloudImporter for XyzPointImporter {
    fn read_header(&self, path: &Path) -> Result<PointCloudHeader> {
        let file = File::open(path).with_path(path)?;
        let mut count = 0u64;
        let mut bounds: Option<BoundingBox> = None;
        for line in BufReader::new(file).lines() {
            let line = line.with_path(path)?;
            if let Some(Ok(p)) = parse_xyz_line(&line) {
                count += 1;
                let b = BoundingBox::new(p.position, p.position);
                bounds = Some(bounds.map_or(b, |acc| acc.union(&b)));
            }
        }
        let bounds = bounds.ok_or_else(|| {
            TilerError::InvalidInput(format!("{} contains no points", path.display()))
        })?;
        Ok(PointCloudHeader {
            point_count: count,
            bounds,
        })
    }

    fn stream_points(&self, path: &Path) -> Result<PointStream> {
        let file = File::open(path).with_path(path)?;
        let path = path.to_path_buf();
        Ok(Box::new(BufReader::new(file).lines().filter_map(move |line| match line {
            Ok(line) => parse_xyz_line(&line),
            Err(e) => Some(Err(TilerError::file(path.clone(), e))),
        })))
    }
}
