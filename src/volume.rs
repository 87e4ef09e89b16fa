//! Tile bounding volumes.
//!
//! The hierarchy works in geographic [`BoundingVolume::Region`]s: they union
//! cheaply and split into quadrants at the lon/lat midpoint. Oriented boxes
//! are derived from regions when the manifest asks for them.

use crate::crs::CrsService;
use crate::types::BoundingBox;
use glam::{DMat4, DVec3};
use serde_json::{json, Value};

/// WGS84 semi-major axis, used for metric region extents.
const EQUATORIAL_RADIUS: f64 = 6_378_137.0;

/// Spatial extent of a tile or unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundingVolume {
    /// Longitude/latitude in radians, heights in metres.
    Region {
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        min_height: f64,
        max_height: f64,
    },
    /// ECEF centre plus three half-axis vectors.
    Box {
        center: [f64; 3],
        half_axes: [[f64; 3]; 3],
    },
}

impl BoundingVolume {
    /// Region covering a local box placed in the world by `to_ecef`.
    ///
    /// A 3×3×3 lattice over the box is projected so curvature between the
    /// corners is accounted for.
    pub fn from_local_box(bounds: &BoundingBox, to_ecef: &DMat4, crs: &dyn CrsService) -> Self {
        let mut region: Option<BoundingVolume> = None;
        for i in 0..27 {
            let t = [(i % 3) as f64 * 0.5, ((i / 3) % 3) as f64 * 0.5, (i / 9) as f64 * 0.5];
            let p = DVec3::new(
                bounds.min[0] + (bounds.max[0] - bounds.min[0]) * t[0],
                bounds.min[1] + (bounds.max[1] - bounds.min[1]) * t[1],
                bounds.min[2] + (bounds.max[2] - bounds.min[2]) * t[2],
            );
            let [lon, lat, h] = crs.cartesian_to_geographic(to_ecef.transform_point3(p));
            let point = Self::point(lon.to_radians(), lat.to_radians(), h);
            region = Some(match region {
                Some(r) => r.union(&point),
                None => point,
            });
        }
        region.unwrap_or(Self::point(0.0, 0.0, 0.0))
    }

    /// Degenerate region at one position (radians, metres).
    pub fn point(lon: f64, lat: f64, height: f64) -> Self {
        Self::Region {
            west: lon,
            south: lat,
            east: lon,
            north: lat,
            min_height: height,
            max_height: height,
        }
    }

    /// Smallest region holding both. Boxes are merged by their own extents.
    pub fn union(&self, other: &Self) -> Self {
        match (self, other) {
            (
                Self::Region {
                    west: w1,
                    south: s1,
                    east: e1,
                    north: n1,
                    min_height: lo1,
                    max_height: hi1,
                },
                Self::Region {
                    west: w2,
                    south: s2,
                    east: e2,
                    north: n2,
                    min_height: lo2,
                    max_height: hi2,
                },
            ) => Self::Region {
                west: w1.min(*w2),
                south: s1.min(*s2),
                east: e1.max(*e2),
                north: n1.max(*n2),
                min_height: lo1.min(*lo2),
                max_height: hi1.max(*hi2),
            },
            _ => {
                let points: Vec<DVec3> = self.box_corners().into_iter().chain(other.box_corners()).collect();
                let center = points.iter().copied().sum::<DVec3>() / points.len() as f64;
                // Axis-aligned in ECEF.
                Self::fit_box(center, &points, DMat4::IDENTITY)
            }
        }
    }

    /// True if `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Region {
                    west,
                    south,
                    east,
                    north,
                    min_height,
                    max_height,
                },
                Self::Region {
                    west: w,
                    south: s,
                    east: e,
                    north: n,
                    min_height: lo,
                    max_height: hi,
                },
            ) => w >= west && e <= east && s >= south && n <= north && lo >= min_height && hi <= max_height,
            _ => other.box_corners().iter().all(|p| self.contains_ecef(*p, 1e-6)),
        }
    }

    /// Point test for boxes, within `tolerance` metres.
    pub fn contains_ecef(&self, p: DVec3, tolerance: f64) -> bool {
        match self {
            Self::Box { center, half_axes } => {
                let d = p - DVec3::from_array(*center);
                half_axes.iter().all(|axis| {
                    let a = DVec3::from_array(*axis);
                    let len2 = a.length_squared();
                    if len2 == 0.0 {
                        return d.dot(a).abs() <= tolerance;
                    }
                    (d.dot(a) / len2.sqrt()).abs() <= len2.sqrt() + tolerance
                })
            }
            // Regions are compared geographically by `contains`.
            Self::Region { .. } => false,
        }
    }

    /// Quadrant (0 = SW, 1 = SE, 2 = NW, 3 = NE) of a lon/lat position in
    /// radians. Positions on a midpoint go east or north.
    pub fn quadrant_of(&self, lon: f64, lat: f64) -> usize {
        let (mid_lon, mid_lat) = self.midpoint();
        (lon >= mid_lon) as usize + 2 * (lat >= mid_lat) as usize
    }

    fn midpoint(&self) -> (f64, f64) {
        match self {
            Self::Region {
                west,
                south,
                east,
                north,
                ..
            } => ((west + east) * 0.5, (south + north) * 0.5),
            Self::Box { center, .. } => (center[0], center[1]),
        }
    }

    /// Grow the shorter horizontal side, in metres, to match the longer one.
    pub fn to_square(&self) -> Self {
        match *self {
            Self::Region {
                west,
                south,
                east,
                north,
                min_height,
                max_height,
            } => {
                let (mid_lon, mid_lat) = self.midpoint();
                let cos_lat = mid_lat.cos().abs().max(1e-9);
                let width = (east - west) * EQUATORIAL_RADIUS * cos_lat;
                let height = (north - south) * EQUATORIAL_RADIUS;
                let side = width.max(height);
                let half_lon = side / (EQUATORIAL_RADIUS * cos_lat) * 0.5;
                let half_lat = side / EQUATORIAL_RADIUS * 0.5;
                Self::Region {
                    west: west.min(mid_lon - half_lon),
                    south: south.min(mid_lat - half_lat),
                    east: east.max(mid_lon + half_lon),
                    north: north.max(mid_lat + half_lat),
                    min_height,
                    max_height,
                }
            }
            b @ Self::Box { .. } => b,
        }
    }

    /// Centre in ECEF.
    pub fn center_ecef(&self, crs: &dyn CrsService) -> DVec3 {
        match self {
            Self::Region {
                min_height,
                max_height,
                ..
            } => {
                let (lon, lat) = self.midpoint();
                crs.geographic_to_cartesian(lon.to_degrees(), lat.to_degrees(), (min_height + max_height) * 0.5)
            }
            Self::Box { center, .. } => DVec3::from_array(*center),
        }
    }

    /// Oriented box aligned with east-north-up at the region centre.
    pub fn as_box(&self, crs: &dyn CrsService) -> Self {
        match *self {
            Self::Region {
                west,
                south,
                east,
                north,
                min_height,
                max_height,
            } => {
                let mut samples = Vec::with_capacity(50);
                for i in 0..5 {
                    for j in 0..5 {
                        let lon = west + (east - west) * i as f64 / 4.0;
                        let lat = south + (north - south) * j as f64 / 4.0;
                        for h in [min_height, max_height] {
                            samples.push(crs.geographic_to_cartesian(lon.to_degrees(), lat.to_degrees(), h));
                        }
                    }
                }
                let center = self.center_ecef(crs);
                Self::fit_box(center, &samples, crs.local_tangent_frame(center))
            }
            b @ Self::Box { .. } => b,
        }
    }

    /// Box in `frame` orientation around `points`. Padded slightly so edge
    /// curvature between samples stays inside.
    fn fit_box(center: DVec3, points: &[DVec3], frame: DMat4) -> Self {
        let frame = DMat4::from_cols(frame.x_axis, frame.y_axis, frame.z_axis, center.extend(1.0));
        let to_local = frame.inverse();
        let local = BoundingBox::from_points(points.iter().map(|p| to_local.transform_point3(*p).to_array()))
            .unwrap_or(BoundingBox::new([0.0; 3], [0.0; 3]));
        let mid = frame.transform_point3(DVec3::from_array(local.center()));
        let half = local.half_extents().map(|h| h * 1.001 + 0.5);
        let axes = [frame.x_axis.truncate(), frame.y_axis.truncate(), frame.z_axis.truncate()];
        Self::Box {
            center: mid.to_array(),
            half_axes: [
                (axes[0] * half[0]).to_array(),
                (axes[1] * half[1]).to_array(),
                (axes[2] * half[2]).to_array(),
            ],
        }
    }

    fn box_corners(&self) -> Vec<DVec3> {
        match self {
            Self::Box { center, half_axes } => {
                let c = DVec3::from_array(*center);
                let [a, b, h] = half_axes.map(DVec3::from_array);
                (0..8)
                    .map(|i| {
                        let s = |bit: usize| if i & bit != 0 { 1.0 } else { -1.0 };
                        c + a * s(1) + b * s(2) + h * s(4)
                    })
                    .collect()
            }
            Self::Region { .. } => Vec::new(),
        }
    }

    /// Manifest JSON: `{"region": [...]}` or `{"box": [...]}`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Region {
                west,
                south,
                east,
                north,
                min_height,
                max_height,
            } => json!({ "region": [west, south, east, north, min_height, max_height] }),
            Self::Box { center, half_axes } => {
                let mut values = center.to_vec();
                for axis in half_axes {
                    values.extend_from_slice(axis);
                }
                json!({ "box": values })
            }
        }
    }
}
