//! Coordinate reference system service.
//!
//! The tiler never does projection math itself; it asks a [`CrsService`] for
//! geographic/cartesian conversions and local tangent frames. [`Wgs84`] is a
//! small reference implementation covering geographic and geocentric WGS84,
//! enough for tests and the bundled CLI. Anything richer (projected systems,
//! datum shifts) is plugged in by implementing the trait.

use crate::error::{Result, TilerError};
use glam::{DMat4, DVec3, DVec4};

/// Coordinate transforms used by the tiler.
///
/// Geographic positions are `(longitude°, latitude°, height m)`; cartesian
/// positions are earth-centred earth-fixed metres.
pub trait CrsService: Send + Sync {
    /// Geographic position to ECEF.
    fn geographic_to_cartesian(&self, lon: f64, lat: f64, height: f64) -> DVec3;

    /// ECEF to geographic position.
    fn cartesian_to_geographic(&self, p: DVec3) -> [f64; 3];

    /// East-north-up frame at an ECEF point, mapping local metres to ECEF.
    fn local_tangent_frame(&self, p: DVec3) -> DMat4;

    /// Transform a point expressed in `source_crs` to ECEF.
    fn transform(&self, source_crs: &str, p: DVec3) -> Result<DVec3>;
}

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// WGS84 ellipsoid service for `EPSG:4326`/`EPSG:4979` (lon, lat, height) and
/// `EPSG:4978` (geocentric).
#[derive(Debug, Clone, Copy, Default)]
pub struct Wgs84;

impl Wgs84 {
    fn e2() -> f64 {
        WGS84_F * (2.0 - WGS84_F)
    }
}

impl CrsService for Wgs84 {
    fn geographic_to_cartesian(&self, lon: f64, lat: f64, height: f64) -> DVec3 {
        let (lon, lat) = (lon.to_radians(), lat.to_radians());
        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_lon, cos_lon) = lon.sin_cos();
        let n = WGS84_A / (1.0 - Self::e2() * sin_lat * sin_lat).sqrt();
        DVec3::new(
            (n + height) * cos_lat * cos_lon,
            (n + height) * cos_lat * sin_lon,
            (n * (1.0 - Self::e2()) + height) * sin_lat,
        )
    }

    fn cartesian_to_geographic(&self, p: DVec3) -> [f64; 3] {
        let e2 = Self::e2();
        let lon = p.y.atan2(p.x);
        let r = (p.x * p.x + p.y * p.y).sqrt();

        if r < 1e-9 {
            let b = WGS84_A * (1.0 - WGS84_F);
            let lat = if p.z >= 0.0 { 90.0 } else { -90.0 };
            return [lon.to_degrees(), lat, p.z.abs() - b];
        }

        let mut lat = (p.z / (r * (1.0 - e2))).atan();
        let mut height = 0.0;
        for _ in 0..8 {
            let sin_lat = lat.sin();
            let n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();
            height = r / lat.cos() - n;
            lat = (p.z / (r * (1.0 - e2 * n / (n + height)))).atan();
        }

        [lon.to_degrees(), lat.to_degrees(), height]
    }

    fn local_tangent_frame(&self, p: DVec3) -> DMat4 {
        let [lon, lat, _] = self.cartesian_to_geographic(p);
        let (sin_lat, cos_lat) = lat.to_radians().sin_cos();
        let (sin_lon, cos_lon) = lon.to_radians().sin_cos();

        let east = DVec3::new(-sin_lon, cos_lon, 0.0);
        let north = DVec3::new(-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat);
        let up = DVec3::new(cos_lat * cos_lon, cos_lat * sin_lon, sin_lat);

        DMat4::from_cols(
            east.extend(0.0),
            north.extend(0.0),
            up.extend(0.0),
            DVec4::new(p.x, p.y, p.z, 1.0),
        )
    }

    fn transform(&self, source_crs: &str, p: DVec3) -> Result<DVec3> {
        match source_crs.to_ascii_uppercase().as_str() {
            "EPSG:4326" | "EPSG:4979" | "WGS84" => Ok(self.geographic_to_cartesian(p.x, p.y, p.z)),
            "EPSG:4978" | "ECEF" => Ok(p),
            other => Err(TilerError::UnsupportedCrs(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geographic_round_trip() {
        let crs = Wgs84;
        for (lon, lat, h) in [(0.0, 0.0, 0.0), (13.4, 52.5, 35.0), (-122.4, 37.8, 120.0), (151.2, -33.9, 5.0)] {
            let p = crs.geographic_to_cartesian(lon, lat, h);
            let [lon2, lat2, h2] = crs.cartesian_to_geographic(p);
            assert!((lon - lon2).abs() < 1e-9, "lon {lon} vs {lon2}");
            assert!((lat - lat2).abs() < 1e-9, "lat {lat} vs {lat2}");
            assert!((h - h2).abs() < 1e-4, "height {h} vs {h2}");
        }
    }

    #[test]
    fn test_equator_radius() {
        let p = Wgs84.geographic_to_cartesian(0.0, 0.0, 0.0);
        assert!((p.x - WGS84_A).abs() < 1e-6);
        assert!(p.y.abs() < 1e-6 && p.z.abs() < 1e-6);
    }

    #[test]
    fn test_tangent_frame_orthonormal() {
        let crs = Wgs84;
        let origin = crs.geographic_to_cartesian(8.5, 47.3, 400.0);
        let m = crs.local_tangent_frame(origin);
        let (e, n, u) = (m.x_axis.truncate(), m.y_axis.truncate(), m.z_axis.truncate());
        assert!((e.length() - 1.0).abs() < 1e-12);
        assert!(e.dot(n).abs() < 1e-12 && e.dot(u).abs() < 1e-12 && n.dot(u).abs() < 1e-12);

        // 100 m up in the local frame raises the height by 100 m
        let lifted = m.transform_point3(DVec3::new(0.0, 0.0, 100.0));
        let [_, _, h] = crs.cartesian_to_geographic(lifted);
        assert!((h - 500.0).abs() < 1e-3);
    }

    #[test]
    fn test_unknown_crs_rejected() {
        let err = Wgs84.transform("EPSG:32633", DVec3::ZERO).unwrap_err();
        assert!(matches!(err, TilerError::UnsupportedCrs(_)));
    }
}
