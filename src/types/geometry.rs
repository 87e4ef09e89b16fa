//! Geometry buffer types.

use super::BoundingBox;
use std::path::PathBuf;

/// A polygonal face: indices into the owning record's vertex list.
pub type Face = Vec<u32>;

/// A vertex of a geometry record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    /// Position in the record's local frame (metres).
    pub position: [f64; 3],
    /// Normal vector.
    pub normal: Option<[f64; 3]>,
    /// Vertex color (RGBA).
    pub color: Option<[u8; 4]>,
    /// Texture coordinates.
    pub uv: Option<[f64; 2]>,
    /// Batch id of the feature this vertex belongs to.
    pub feature: u32,
}

impl Vertex {
    pub fn new(position: [f64; 3]) -> Self {
        Self {
            position,
            normal: None,
            color: None,
            uv: None,
            feature: 0,
        }
    }

    pub fn with_normal(mut self, normal: [f64; 3]) -> Self {
        self.normal = Some(normal);
        self
    }

    pub fn with_color(mut self, color: [u8; 4]) -> Self {
        self.color = Some(color);
        self
    }

    pub fn with_uv(mut self, uv: [f64; 2]) -> Self {
        self.uv = Some(uv);
        self
    }

    /// A vertex with a NaN or infinite coordinate is treated as absent.
    pub fn has_position(&self) -> bool {
        self.position.iter().all(|c| c.is_finite())
    }
}

/// A named material. Records without any material render with a default one.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    /// Base color (RGBA).
    pub color: [u8; 4],
    /// Optional texture image on disk.
    pub texture: Option<PathBuf>,
}

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: [255, 255, 255, 255],
            texture: None,
        }
    }

    pub fn with_color(mut self, color: [u8; 4]) -> Self {
        self.color = color;
        self
    }

    pub fn with_texture(mut self, texture: impl Into<PathBuf>) -> Self {
        self.texture = Some(texture.into());
        self
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Faces sharing one material.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Surface {
    /// Index into [`GeometryRecord::materials`].
    pub material: Option<usize>,
    pub faces: Vec<Face>,
}

impl Surface {
    pub fn new(material: Option<usize>) -> Self {
        Self {
            material,
            faces: Vec::new(),
        }
    }
}

/// One input's consolidated geometry.
///
/// The bounding box is cached; [`vertices_mut`](Self::vertices_mut) drops the
/// cache and [`update_bounds`](Self::update_bounds) rebuilds it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeometryRecord {
    vertices: Vec<Vertex>,
    pub surfaces: Vec<Surface>,
    pub materials: Vec<Material>,
    bounds: Option<BoundingBox>,
}

impl GeometryRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from parts and cache its bounds.
    pub fn from_parts(vertices: Vec<Vertex>, surfaces: Vec<Surface>, materials: Vec<Material>) -> Self {
        let mut record = Self {
            vertices,
            surfaces,
            materials,
            bounds: None,
        };
        record.update_bounds();
        record
    }

    /// Add a vertex and return its index.
    pub fn add_vertex(&mut self, vertex: Vertex) -> u32 {
        let index = self.vertices.len() as u32;
        if vertex.has_position() {
            if let Some(b) = &mut self.bounds {
                *b = b.union(&BoundingBox::new(vertex.position, vertex.position));
            } else if self.vertices.iter().all(|v| !v.has_position()) {
                self.bounds = Some(BoundingBox::new(vertex.position, vertex.position));
            }
        }
        self.vertices.push(vertex);
        index
    }

    /// Add a material and return its index.
    pub fn add_material(&mut self, material: Material) -> usize {
        self.materials.push(material);
        self.materials.len() - 1
    }

    /// Add a face to the surface using `material`, creating the surface on first use.
    pub fn add_face(&mut self, material: Option<usize>, face: Face) {
        match self.surfaces.iter_mut().find(|s| s.material == material) {
            Some(surface) => surface.faces.push(face),
            None => self.surfaces.push(Surface {
                material,
                faces: vec![face],
            }),
        }
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    /// Mutable vertex access. Invalidates the cached bounds.
    pub fn vertices_mut(&mut self) -> &mut Vec<Vertex> {
        self.bounds = None;
        &mut self.vertices
    }

    /// Bounding box over all valid vertex positions.
    pub fn bounds(&self) -> Option<BoundingBox> {
        self.bounds.or_else(|| self.compute_bounds())
    }

    /// Recompute and cache the bounding box.
    pub fn update_bounds(&mut self) {
        self.bounds = self.compute_bounds();
    }

    fn compute_bounds(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(
            self.vertices
                .iter()
                .filter(|v| v.has_position())
                .map(|v| v.position),
        )
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.surfaces.iter().map(|s| s.faces.len()).sum()
    }

    /// Number of triangles after fan triangulation of every face.
    pub fn triangle_count(&self) -> usize {
        self.surfaces
            .iter()
            .flat_map(|s| s.faces.iter())
            .map(|f| f.len().saturating_sub(2))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Tag every vertex with a feature (batch) id.
    pub fn set_feature(&mut self, feature: u32) {
        for v in &mut self.vertices {
            v.feature = feature;
        }
    }

    /// Apply a position transform. Normals are passed through `rotate`.
    pub fn transform(
        &mut self,
        position: impl Fn([f64; 3]) -> [f64; 3],
        rotate: impl Fn([f64; 3]) -> [f64; 3],
    ) {
        for v in &mut self.vertices {
            v.position = position(v.position);
            v.normal = v.normal.map(&rotate);
        }
        self.update_bounds();
    }

    /// Translate all vertices by an offset.
    pub fn translate(&mut self, offset: [f64; 3]) {
        self.transform(
            |p| [p[0] + offset[0], p[1] + offset[1], p[2] + offset[2]],
            |n| n,
        );
    }

    /// Merge another record into this one, offsetting indices and materials.
    pub fn merge(&mut self, other: &GeometryRecord) {
        let vertex_offset = self.vertices.len() as u32;
        let material_offset = self.materials.len();

        self.vertices.extend_from_slice(&other.vertices);
        self.materials.extend(other.materials.iter().cloned());

        for surface in &other.surfaces {
            let material = surface.material.map(|m| m + material_offset);
            for face in &surface.faces {
                self.add_face(material, face.iter().map(|i| i + vertex_offset).collect());
            }
        }

        self.bounds = match (self.bounds, other.bounds()) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (None, b) if vertex_offset == 0 => b,
            _ => self.compute_bounds(),
        };
    }

    /// Fan-triangulated index list for one surface, skipping faces with
    /// indices outside the vertex list.
    pub fn triangulate(&self, surface: &Surface) -> Vec<u32> {
        let n = self.vertices.len() as u32;
        let mut out = Vec::new();
        for face in &surface.faces {
            if face.len() < 3 || face.iter().any(|&i| i >= n) {
                continue;
            }
            for k in 1..face.len() - 1 {
                out.extend_from_slice(&[face[0], face[k], face[k + 1]]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> GeometryRecord {
        let mut record = GeometryRecord::new();
        let v0 = record.add_vertex(Vertex::new([0.0, 0.0, 0.0]));
        let v1 = record.add_vertex(Vertex::new([1.0, 0.0, 0.0]));
        let v2 = record.add_vertex(Vertex::new([0.0, 0.0, 1.0]));
        record.add_face(None, vec![v0, v1, v2]);
        record
    }

    #[test]
    fn test_record_creation() {
        let record = triangle();
        assert_eq!(record.vertex_count(), 3);
        assert_eq!(record.face_count(), 1);
        assert_eq!(record.triangle_count(), 1);
        let b = record.bounds().unwrap();
        assert_eq!(b.min, [0.0, 0.0, 0.0]);
        assert_eq!(b.max, [1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_bounds_follow_mutation() {
        let mut record = triangle();
        record.vertices_mut()[0].position = [-5.0, 0.0, 0.0];
        assert_eq!(record.bounds().unwrap().min[0], -5.0);
        record.update_bounds();
        assert_eq!(record.bounds().unwrap().min[0], -5.0);
    }

    #[test]
    fn test_invalid_position_ignored_by_bounds() {
        let mut record = triangle();
        record.add_vertex(Vertex::new([f64::NAN, 100.0, 0.0]));
        assert_eq!(record.bounds().unwrap().max, [1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_record_merge() {
        let mut a = triangle();
        let mut b = triangle();
        let mat = b.add_material(Material::new("brick"));
        b.surfaces[0].material = Some(mat);
        b.translate([2.0, 0.0, 0.0]);

        a.merge(&b);

        assert_eq!(a.vertex_count(), 6);
        assert_eq!(a.surfaces.len(), 2);
        assert_eq!(a.surfaces[1].material, Some(0));
        // Second face indices should be offset by 3
        assert_eq!(a.surfaces[1].faces[0], vec![3, 4, 5]);
        assert_eq!(a.bounds().unwrap().max[0], 3.0);
    }

    #[test]
    fn test_triangulate_quad() {
        let mut record = GeometryRecord::new();
        for p in [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]] {
            record.add_vertex(Vertex::new(p));
        }
        record.add_face(None, vec![0, 1, 2, 3]);
        record.add_face(None, vec![0, 1, 9]);
        let tris = record.triangulate(&record.surfaces[0]);
        assert_eq!(tris, vec![0, 1, 2, 0, 2, 3]);
    }
}
