//! Surface joining by connectivity.

use crate::types::{GeometryRecord, Surface};
use std::collections::VecDeque;

/// Merge surfaces that share a material and are connected through faces.
///
/// Materials are compared by value, so the duplicate materials left behind by
/// [`GeometryRecord::merge`] join as well. Connectivity is a flood fill over
/// faces sharing a vertex index.
pub fn join_surfaces(record: &GeometryRecord) -> GeometryRecord {
    if record.surfaces.len() < 2 {
        return record.clone();
    }

    // Canonical material index per material.
    let canonical: Vec<usize> = record
        .materials
        .iter()
        .enumerate()
        .map(|(i, m)| record.materials[..i].iter().position(|o| o == m).unwrap_or(i))
        .collect();
    let material_of = |s: &Surface| s.material.map(|m| canonical.get(m).copied().unwrap_or(m));

    // Flat face list with its owning surface.
    let faces: Vec<(usize, &Vec<u32>)> = record
        .surfaces
        .iter()
        .enumerate()
        .flat_map(|(si, s)| s.faces.iter().map(move |f| (si, f)))
        .collect();

    let n = record.vertex_count();
    let mut vertex_faces: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (fi, (_, face)) in faces.iter().enumerate() {
        for &v in face.iter() {
            if (v as usize) < n {
                vertex_faces[v as usize].push(fi);
            }
        }
    }

    let mut parent: Vec<usize> = (0..record.surfaces.len()).collect();
    let mut visited = vec![false; faces.len()];
    let mut queue = VecDeque::new();
    for start in 0..faces.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        queue.push_back(start);
        let mut component: Vec<usize> = Vec::new();
        while let Some(fi) = queue.pop_front() {
            let (si, face) = faces[fi];
            if !component.contains(&si) {
                component.push(si);
            }
            for &v in face.iter() {
                for &next in vertex_faces.get(v as usize).map(Vec::as_slice).unwrap_or(&[]) {
                    if !visited[next] {
                        visited[next] = true;
                        queue.push_back(next);
                    }
                }
            }
        }
        for (k, &a) in component.iter().enumerate() {
            for &b in &component[k + 1..] {
                if material_of(&record.surfaces[a]) == material_of(&record.surfaces[b]) {
                    union(&mut parent, a, b);
                }
            }
        }
    }

    let mut joined: Vec<Surface> = Vec::new();
    let mut slot: Vec<Option<usize>> = vec![None; record.surfaces.len()];
    for (si, surface) in record.surfaces.iter().enumerate() {
        let root = find(&mut parent, si);
        let target = match slot[root] {
            Some(t) => t,
            None => {
                joined.push(Surface::new(material_of(surface)));
                slot[root] = Some(joined.len() - 1);
                joined.len() - 1
            }
        };
        joined[target].faces.extend(surface.faces.iter().cloned());
    }

    GeometryRecord::from_parts(record.vertices().to_vec(), joined, record.materials.clone())
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let (ra, rb) = (find(parent, a), find(parent, b));
    if ra != rb {
        // Keep the earliest surface as the root.
        parent[ra.max(rb)] = ra.min(rb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Material, Vertex};

    fn two_tiles(offset: f64) -> GeometryRecord {
        let mut a = GeometryRecord::new();
        for p in [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]] {
            a.add_vertex(Vertex::new(p));
        }
        let m = a.add_material(Material::new("tile"));
        a.add_face(Some(m), vec![0, 1, 2, 3]);
        let mut b = a.clone();
        b.translate([offset, 0.0, 0.0]);
        a.merge(&b);
        a
    }

    #[test]
    fn test_connected_same_material_joins() {
        let mut rec = two_tiles(1.0);
        // Share the edge by index.
        rec.surfaces[1].faces[0] = vec![1, 5, 6, 2];
        assert_eq!(rec.surfaces.len(), 2);

        let joined = join_surfaces(&rec);
        assert_eq!(joined.surfaces.len(), 1);
        assert_eq!(joined.surfaces[0].material, Some(0));
        assert_eq!(joined.face_count(), 2);
    }

    #[test]
    fn test_disconnected_surfaces_stay_apart() {
        let rec = two_tiles(3.0);
        let joined = join_surfaces(&rec);
        assert_eq!(joined.surfaces.len(), 2);
        assert_eq!(joined.surfaces[1].material, Some(0));
    }

    #[test]
    fn test_different_materials_stay_apart() {
        let mut rec = two_tiles(1.0);
        rec.materials[1].color = [0, 0, 255, 255];
        rec.surfaces[1].faces[0] = vec![1, 5, 6, 2];
        let joined = join_surfaces(&rec);
        assert_eq!(joined.surfaces.len(), 2);
    }
}
