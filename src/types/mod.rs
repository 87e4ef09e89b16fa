//! Shared types used throughout the library.

mod geometry;
mod unit;

pub use geometry::{Face, GeometryRecord, Material, Surface, Vertex};
pub use unit::{AnchorInfo, Properties, TileUnit, UnitGeometry, UnitId, UnitKind};

/// An axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: impl Iterator<Item = [f64; 3]>) -> Option<Self> {
        let mut min = [f64::MAX; 3];
        let mut max = [f64::MIN; 3];
        let mut has_points = false;

        for p in points {
            has_points = true;
            for i in 0..3 {
                min[i] = min[i].min(p[i]);
                max[i] = max[i].max(p[i]);
            }
        }

        if has_points {
            Some(Self { min, max })
        } else {
            None
        }
    }

    pub fn dimensions(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    pub fn center(&self) -> [f64; 3] {
        [
            (self.min[0] + self.max[0]) * 0.5,
            (self.min[1] + self.max[1]) * 0.5,
            (self.min[2] + self.max[2]) * 0.5,
        ]
    }

    pub fn half_extents(&self) -> [f64; 3] {
        let d = self.dimensions();
        [d[0] * 0.5, d[1] * 0.5, d[2] * 0.5]
    }

    /// Length of the space diagonal.
    pub fn diagonal(&self) -> f64 {
        let d = self.dimensions();
        (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt()
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let mut out = *self;
        for i in 0..3 {
            out.min[i] = out.min[i].min(other.min[i]);
            out.max[i] = out.max[i].max(other.max[i]);
        }
        out
    }

    /// Inclusive point containment.
    pub fn contains(&self, p: [f64; 3]) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    /// The eight corners, min corner first.
    pub fn corners(&self) -> [[f64; 3]; 8] {
        let (a, b) = (self.min, self.max);
        [
            [a[0], a[1], a[2]],
            [b[0], a[1], a[2]],
            [a[0], b[1], a[2]],
            [b[0], b[1], a[2]],
            [a[0], a[1], b[2]],
            [b[0], a[1], b[2]],
            [a[0], b[1], b[2]],
            [b[0], b[1], b[2]],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_points_empty() {
        assert!(BoundingBox::from_points(std::iter::empty()).is_none());
    }

    #[test]
    fn test_diagonal_and_center() {
        let bb = BoundingBox::from_points(
            [[0.0, 0.0, 0.0], [6.0, 8.0, 0.0], [3.0, 1.0, 0.0]].into_iter(),
        )
        .unwrap();
        assert_eq!(bb.diagonal(), 10.0);
        assert_eq!(bb.center(), [3.0, 4.0, 0.0]);
    }

    #[test]
    fn test_union_contains_both() {
        let a = BoundingBox::new([0.0; 3], [1.0; 3]);
        let b = BoundingBox::new([-1.0, 0.5, 0.5], [0.5, 2.0, 0.5]);
        let u = a.union(&b);
        for c in a.corners().iter().chain(b.corners().iter()) {
            assert!(u.contains(*c));
        }
        assert_eq!(u.min, [-1.0, 0.0, 0.0]);
        assert_eq!(u.max, [1.0, 2.0, 1.0]);
    }
}
