//! Point-cloud content.

use super::{rtc_center, ContentPayload};
use crate::hierarchy::Lod;
use crate::spool::sampler::sample_count;
use crate::types::GeometryRecord;
use serde_json::{json, Value};

/// Byte offsets of the feature-table binary for `n` points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointsLayout {
    pub rgb: usize,
    pub batch_id: usize,
    pub len: usize,
}

impl PointsLayout {
    pub fn new(n: usize) -> Self {
        let rgb = n * 12;
        let batch_id = align4(rgb + n * 3);
        Self {
            rgb,
            batch_id,
            len: batch_id + n * 2,
        }
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Points to keep from each unit at `lod`, capped at `cap` in total.
pub fn sample_limits(counts: &[u64], lod: Lod, cap: usize) -> Vec<usize> {
    let limits: Vec<usize> = counts
        .iter()
        .map(|&n| sample_count(n as usize, lod.sample_fraction()))
        .collect();
    let total: usize = limits.iter().sum();
    if total <= cap {
        return limits;
    }
    let scale = cap as f64 / total as f64;
    limits.into_iter().map(|n| (n as f64 * scale).floor() as usize).collect()
}

/// Build a point payload from a merged record whose positions are already
/// relative to `rtc`. Vertex features become batch ids.
pub fn points_payload(record: &GeometryRecord, rtc: [f64; 3], batch_table: Value, batch_length: usize) -> ContentPayload {
    let vertices = record.vertices().iter().filter(|v| v.has_position());
    let mut positions = Vec::with_capacity(record.vertex_count());
    let mut colors = Vec::with_capacity(record.vertex_count());
    let mut batch_ids = Vec::with_capacity(record.vertex_count());
    for v in vertices {
        positions.push(v.position.map(|c| c as f32));
        let c = v.color.unwrap_or([255; 4]);
        colors.push([c[0], c[1], c[2]]);
        batch_ids.push(v.feature.min(u16::MAX as u32) as u16);
    }

    let layout = PointsLayout::new(positions.len());
    let feature_table = json!({
        "POINTS_LENGTH": positions.len(),
        "RTC_CENTER": rtc_center(rtc),
        "POSITION": { "byteOffset": 0 },
        "RGB": { "byteOffset": layout.rgb },
        "BATCH_LENGTH": batch_length,
        "BATCH_ID": { "byteOffset": layout.batch_id, "componentType": "UNSIGNED_SHORT" },
    });

    ContentPayload::Points {
        feature_table,
        batch_table,
        positions,
        colors,
        batch_ids,
    }
}

/// Feature-table binary in [`PointsLayout`] order.
pub(crate) fn feature_binary(positions: &[[f32; 3]], colors: &[[u8; 3]], batch_ids: &[u16]) -> Vec<u8> {
    let layout = PointsLayout::new(positions.len());
    let mut out = Vec::with_capacity(layout.len);
    for p in positions {
        for c in p {
            out.extend_from_slice(&c.to_le_bytes());
        }
    }
    out.extend_from_slice(bytemuck::cast_slice(colors));
    out.resize(layout.batch_id, 0);
    for id in batch_ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}
