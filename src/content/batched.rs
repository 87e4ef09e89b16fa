//! Batched model content: a binary glTF body tagged with per-vertex batch ids.

use super::{rtc_center, ContentPayload};
use crate::error::{Result, TilerError};
use crate::types::{GeometryRecord, Material};
use gltf_json as json;
use json::validation::Checked::Valid;
use json::validation::USize64;
use serde_json::{json as value, Value};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use tracing::warn;

/// Build a batched payload from a merged record whose positions are ECEF
/// offsets from `rtc`.
pub fn batched_payload(
    record: &GeometryRecord,
    rtc: [f64; 3],
    batch_table: Value,
    batch_length: usize,
) -> Result<ContentPayload> {
    let glb = export_glb(record)?;
    Ok(ContentPayload::Batched {
        feature_table: value!({
            "BATCH_LENGTH": batch_length,
            "RTC_CENTER": rtc_center(rtc),
        }),
        batch_table,
        glb,
    })
}

/// Byte ranges of one primitive's index data.
struct PrimitiveData {
    material: usize,
    idx_offset: usize,
    idx_bytes: usize,
    index_count: usize,
}

/// Export a record to GLB, one primitive per material.
///
/// Positions are converted from z-up to glTF's y-up. Normals are written
/// only if every vertex has one; colors and texture coordinates when any
/// vertex carries them.
pub fn export_glb(record: &GeometryRecord) -> Result<Vec<u8>> {
    let vertices = record.vertices();
    if vertices.is_empty() || record.triangle_count() == 0 {
        return Err(TilerError::Export("Cannot export empty mesh".to_string()));
    }

    let y_up = |p: [f64; 3]| [p[0] as f32, p[2] as f32, -p[1] as f32];
    let positions: Vec<[f32; 3]> = vertices.iter().map(|v| y_up(v.position)).collect();
    let normals: Option<Vec<[f32; 3]>> = vertices.iter().map(|v| v.normal.map(y_up)).collect();
    let colors: Option<Vec<[f32; 4]>> = vertices.iter().any(|v| v.color.is_some()).then(|| {
        vertices
            .iter()
            .map(|v| v.color.unwrap_or([255; 4]).map(|c| c as f32 / 255.0))
            .collect()
    });
    let uvs: Option<Vec<[f32; 2]>> = vertices.iter().any(|v| v.uv.is_some()).then(|| {
        vertices
            .iter()
            .map(|v| v.uv.unwrap_or([0.0; 2]).map(|c| c as f32))
            .collect()
    });
    let batch_ids: Vec<f32> = vertices.iter().map(|v| v.feature as f32).collect();

    // Build the binary buffer incrementally
    let mut buffer_data: Vec<u8> = Vec::new();

    let mut attribute_views: Vec<(json::mesh::Semantic, (usize, usize), json::accessor::Type)> = Vec::new();
    attribute_views.push((
        json::mesh::Semantic::Positions,
        append(&mut buffer_data, bytemuck::cast_slice(&positions)),
        json::accessor::Type::Vec3,
    ));
    if let Some(normals) = &normals {
        attribute_views.push((
            json::mesh::Semantic::Normals,
            append(&mut buffer_data, bytemuck::cast_slice(normals)),
            json::accessor::Type::Vec3,
        ));
    }
    if let Some(uvs) = &uvs {
        attribute_views.push((
            json::mesh::Semantic::TexCoords(0),
            append(&mut buffer_data, bytemuck::cast_slice(uvs)),
            json::accessor::Type::Vec2,
        ));
    }
    if let Some(colors) = &colors {
        attribute_views.push((
            json::mesh::Semantic::Colors(0),
            append(&mut buffer_data, bytemuck::cast_slice(colors)),
            json::accessor::Type::Vec4,
        ));
    }
    attribute_views.push((
        json::mesh::Semantic::Extras("BATCHID".to_string()),
        append(&mut buffer_data, bytemuck::cast_slice(&batch_ids)),
        json::accessor::Type::Scalar,
    ));

    // Group triangles by material; surfaces without one use the default.
    let mut used_materials: Vec<Material> = Vec::new();
    let mut by_material: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
    for surface in &record.surfaces {
        let material = surface
            .material
            .and_then(|m| record.materials.get(m))
            .cloned()
            .unwrap_or_default();
        let slot = match used_materials.iter().position(|m| *m == material) {
            Some(slot) => slot,
            None => {
                used_materials.push(material);
                used_materials.len() - 1
            }
        };
        by_material.entry(slot).or_default().extend(record.triangulate(surface));
    }

    let mut primitive_data = Vec::new();
    for (material, indices) in &by_material {
        if indices.is_empty() {
            continue;
        }
        let (idx_offset, idx_bytes) = append(&mut buffer_data, bytemuck::cast_slice(indices));
        primitive_data.push(PrimitiveData {
            material: *material,
            idx_offset,
            idx_bytes,
            index_count: indices.len(),
        });
    }

    // Embedded textures
    let mut textures = Vec::new();
    let mut texture_of: Vec<Option<u32>> = vec![None; used_materials.len()];
    let mut image_views = Vec::new();
    for (i, material) in used_materials.iter().enumerate() {
        let Some(path) = &material.texture else { continue };
        match load_texture_png(path) {
            Ok(png) => {
                texture_of[i] = Some(textures.len() as u32);
                textures.push(json::Texture {
                    sampler: Some(json::Index::new(0)),
                    source: json::Index::new(image_views.len() as u32),
                    extensions: Default::default(),
                    extras: Default::default(),
                });
                image_views.push(append(&mut buffer_data, &png));
            }
            Err(e) => warn!(texture = %path.display(), error = %e, "skipping unreadable texture"),
        }
    }

    let (min, max) = bounds_f32(&positions);
    let mut buffer_views = Vec::new();
    let mut accessors = Vec::new();
    let mut attributes = BTreeMap::new();
    for (semantic, (offset, bytes), type_) in attribute_views {
        let view = buffer_views.len() as u32;
        buffer_views.push(create_buffer_view(offset, bytes, Some(json::buffer::Target::ArrayBuffer)));
        let is_position = semantic == json::mesh::Semantic::Positions;
        attributes.insert(Valid(semantic), json::Index::new(accessors.len() as u32));
        accessors.push(create_accessor(
            view,
            vertices.len(),
            type_,
            json::accessor::ComponentType::F32,
            is_position.then_some(min),
            is_position.then_some(max),
        ));
    }

    let mut primitives = Vec::new();
    for data in &primitive_data {
        let view = buffer_views.len() as u32;
        buffer_views.push(create_buffer_view(
            data.idx_offset,
            data.idx_bytes,
            Some(json::buffer::Target::ElementArrayBuffer),
        ));
        let accessor = accessors.len() as u32;
        accessors.push(create_accessor(
            view,
            data.index_count,
            json::accessor::Type::Scalar,
            json::accessor::ComponentType::U32,
            None,
            None,
        ));
        primitives.push(create_primitive(attributes.clone(), accessor, data.material as u32));
    }

    let images = image_views
        .into_iter()
        .map(|(offset, bytes)| {
            let view = buffer_views.len() as u32;
            buffer_views.push(create_buffer_view(offset, bytes, None));
            json::Image {
                buffer_view: Some(json::Index::new(view)),
                mime_type: Some(json::image::MimeType("image/png".to_string())),
                uri: None,
                extensions: Default::default(),
                extras: Default::default(),
            }
        })
        .collect::<Vec<_>>();

    let materials = used_materials
        .iter()
        .zip(&texture_of)
        .map(|(m, texture)| create_material(m, *texture))
        .collect();

    let total_buffer_size = buffer_data.len();
    let root = json::Root {
        accessors,
        buffers: vec![json::Buffer {
            byte_length: USize64(total_buffer_size as u64),
            extensions: Default::default(),
            extras: Default::default(),
            uri: None,
        }],
        buffer_views,
        samplers: if textures.is_empty() {
            Vec::new()
        } else {
            vec![json::texture::Sampler {
                mag_filter: Some(Valid(json::texture::MagFilter::Linear)),
                min_filter: Some(Valid(json::texture::MinFilter::LinearMipmapLinear)),
                wrap_s: Valid(json::texture::WrappingMode::Repeat),
                wrap_t: Valid(json::texture::WrappingMode::Repeat),
                extensions: Default::default(),
                extras: Default::default(),
            }]
        },
        images,
        textures,
        materials,
        meshes: vec![json::Mesh {
            extensions: Default::default(),
            extras: Default::default(),
            primitives,
            weights: None,
        }],
        nodes: vec![json::Node {
            camera: None,
            children: None,
            extensions: Default::default(),
            extras: Default::default(),
            matrix: None,
            mesh: Some(json::Index::new(0)),
            rotation: None,
            scale: None,
            translation: None,
            skin: None,
            weights: None,
        }],
        scenes: vec![json::Scene {
            extensions: Default::default(),
            extras: Default::default(),
            nodes: vec![json::Index::new(0)],
        }],
        scene: Some(json::Index::new(0)),
        ..Default::default()
    };

    let json_string = json::serialize::to_string(&root)
        .map_err(|e| TilerError::Export(format!("Failed to serialize glTF JSON: {}", e)))?;
    Ok(assemble_glb(json_string.as_bytes(), &buffer_data))
}

/// Append `bytes` padded to 4 bytes; returns offset and unpadded length.
fn append(buffer: &mut Vec<u8>, bytes: &[u8]) -> (usize, usize) {
    let offset = buffer.len();
    buffer.extend_from_slice(bytes);
    let padding = (4 - (buffer.len() % 4)) % 4;
    buffer.extend(std::iter::repeat(0u8).take(padding));
    (offset, bytes.len())
}

/// GLB container: 12-byte header, JSON chunk, BIN chunk.
fn assemble_glb(json_bytes: &[u8], buffer_data: &[u8]) -> Vec<u8> {
    let json_padding = (4 - (json_bytes.len() % 4)) % 4;
    let padded_json_len = json_bytes.len() + json_padding;
    // Pad to 8 so the body ends aligned inside the tile content.
    let buffer_padding = (8 - ((12 + 8 + padded_json_len + 8 + buffer_data.len()) % 8)) % 8;
    let padded_buffer_len = buffer_data.len() + buffer_padding;

    let total_size = 12 + 8 + padded_json_len + 8 + padded_buffer_len;
    let mut glb = Vec::with_capacity(total_size);

    glb.extend_from_slice(b"glTF");
    glb.extend_from_slice(&2u32.to_le_bytes());
    glb.extend_from_slice(&(total_size as u32).to_le_bytes());

    glb.extend_from_slice(&(padded_json_len as u32).to_le_bytes());
    glb.extend_from_slice(&0x4E4F534Au32.to_le_bytes()); // JSON
    glb.extend_from_slice(json_bytes);
    glb.extend(std::iter::repeat(0x20u8).take(json_padding));

    glb.extend_from_slice(&(padded_buffer_len as u32).to_le_bytes());
    glb.extend_from_slice(&0x004E4942u32.to_le_bytes()); // BIN
    glb.extend_from_slice(buffer_data);
    glb.extend(std::iter::repeat(0u8).take(buffer_padding));

    glb
}

/// Re-encode a texture file as PNG.
fn load_texture_png(path: &Path) -> Result<Vec<u8>> {
    let image = image::open(path)?;
    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
    Ok(png)
}

fn bounds_f32(positions: &[[f32; 3]]) -> ([f32; 3], [f32; 3]) {
    let mut min = [f32::MAX; 3];
    let mut max = [f32::MIN; 3];
    for p in positions {
        for i in 0..3 {
            min[i] = min[i].min(p[i]);
            max[i] = max[i].max(p[i]);
        }
    }
    if min[0] == f32::MAX {
        return ([0.0; 3], [0.0; 3]);
    }
    (min, max)
}

fn create_buffer_view(offset: usize, size: usize, target: Option<json::buffer::Target>) -> json::buffer::View {
    json::buffer::View {
        buffer: json::Index::new(0),
        byte_length: USize64(size as u64),
        byte_offset: Some(USize64(offset as u64)),
        byte_stride: None,
        extensions: Default::default(),
        extras: Default::default(),
        target: target.map(Valid),
    }
}

fn create_accessor(
    buffer_view: u32,
    count: usize,
    type_: json::accessor::Type,
    component_type: json::accessor::ComponentType,
    min: Option<[f32; 3]>,
    max: Option<[f32; 3]>,
) -> json::Accessor {
    json::Accessor {
        buffer_view: Some(json::Index::new(buffer_view)),
        byte_offset: Some(USize64(0)),
        count: USize64(count as u64),
        component_type: Valid(json::accessor::GenericComponentType(component_type)),
        extensions: Default::default(),
        extras: Default::default(),
        type_: Valid(type_),
        min: min.map(|m| json::Value::from(m.to_vec())),
        max: max.map(|m| json::Value::from(m.to_vec())),
        normalized: false,
        sparse: None,
    }
}

fn create_primitive(
    attributes: BTreeMap<json::validation::Checked<json::mesh::Semantic>, json::Index<json::Accessor>>,
    indices_accessor: u32,
    material: u32,
) -> json::mesh::Primitive {
    json::mesh::Primitive {
        attributes,
        extensions: Default::default(),
        extras: Default::default(),
        indices: Some(json::Index::new(indices_accessor)),
        material: Some(json::Index::new(material)),
        mode: Valid(json::mesh::Mode::Triangles),
        targets: None,
    }
}

fn create_material(material: &Material, texture: Option<u32>) -> json::Material {
    let [r, g, b, a] = material.color.map(|c| c as f32 / 255.0);
    json::Material {
        pbr_metallic_roughness: json::material::PbrMetallicRoughness {
            base_color_texture: texture.map(|index| json::texture::Info {
                index: json::Index::new(index),
                tex_coord: 0,
                extensions: Default::default(),
                extras: Default::default(),
            }),
            base_color_factor: json::material::PbrBaseColorFactor([r, g, b, a]),
            metallic_factor: json::material::StrengthFactor(0.0),
            roughness_factor: json::material::StrengthFactor(1.0),
            metallic_roughness_texture: None,
            extensions: Default::default(),
            extras: Default::default(),
        },
        alpha_mode: Valid(if a < 1.0 {
            json::material::AlphaMode::Blend
        } else {
            json::material::AlphaMode::Opaque
        }),
        alpha_cutoff: None,
        double_sided: true,
        normal_texture: None,
        occlusion_texture: None,
        emissive_texture: None,
        emissive_factor: json::material::EmissiveFactor([0.0, 0.0, 0.0]),
        extensions: Default::default(),
        extras: Default::default(),
    }
}
