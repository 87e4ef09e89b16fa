//! Tile content encoding.
//!
//! Both content formats share one layout: a 28-byte header followed by the
//! feature table (JSON + binary), the batch table (JSON + binary), and an
//! optional body. All integers are little-endian; JSON sections are padded
//! with spaces and binary sections with zeros to 8-byte boundaries.

pub mod batched;
pub mod points;
pub mod tileset;
pub mod writer;

pub use tileset::{tileset_json, write_tileset};
pub use writer::ContentWriter;

use crate::error::{Result, TilerError};
use crate::types::Properties;
use serde_json::{json, Map, Value};

pub const HEADER_LEN: usize = 28;
pub const CONTENT_VERSION: u32 = 1;

/// Encoded tile content, one variant per format.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPayload {
    /// Batched 3D model: a GLB body with per-vertex batch ids.
    Batched {
        feature_table: Value,
        batch_table: Value,
        glb: Vec<u8>,
    },
    /// Point cloud with RTC-relative positions.
    Points {
        feature_table: Value,
        batch_table: Value,
        positions: Vec<[f32; 3]>,
        colors: Vec<[u8; 3]>,
        batch_ids: Vec<u16>,
    },
}

impl ContentPayload {
    pub fn magic(&self) -> &'static [u8; 4] {
        match self {
            Self::Batched { .. } => b"b3dm",
            Self::Points { .. } => b"pnts",
        }
    }

    /// File extension for the content URI.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Batched { .. } => "b3dm",
            Self::Points { .. } => "pnts",
        }
    }

    /// Serialize header and sections.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (feature_table, batch_table, feature_binary, body) = match self {
            Self::Batched {
                feature_table,
                batch_table,
                glb,
            } => (feature_table, batch_table, Vec::new(), glb.as_slice()),
            Self::Points {
                feature_table,
                batch_table,
                positions,
                colors,
                batch_ids,
            } => (
                feature_table,
                batch_table,
                points::feature_binary(positions, colors, batch_ids),
                &[][..],
            ),
        };

        let ft_json = padded_json(feature_table, HEADER_LEN)?;
        let ft_bin = padded_binary(feature_binary);
        let bt_json = padded_json(batch_table, HEADER_LEN + ft_json.len() + ft_bin.len())?;
        let bt_bin: Vec<u8> = Vec::new();

        let total = HEADER_LEN + ft_json.len() + ft_bin.len() + bt_json.len() + bt_bin.len() + body.len();
        let mut out = Vec::with_capacity(total);
        write_header(
            &mut out,
            self.magic(),
            total,
            [ft_json.len(), ft_bin.len(), bt_json.len(), bt_bin.len()],
        )?;
        out.extend_from_slice(&ft_json);
        out.extend_from_slice(&ft_bin);
        out.extend_from_slice(&bt_json);
        out.extend_from_slice(&bt_bin);
        out.extend_from_slice(body);
        Ok(out)
    }
}

/// Write the 28-byte header shared by every content format.
pub fn write_header(out: &mut Vec<u8>, magic: &[u8; 4], total: usize, sections: [usize; 4]) -> Result<()> {
    let as_u32 = |n: usize| {
        u32::try_from(n).map_err(|_| TilerError::Export(format!("content section of {n} bytes is too large")))
    };
    out.extend_from_slice(magic);
    out.extend_from_slice(&CONTENT_VERSION.to_le_bytes());
    out.extend_from_slice(&as_u32(total)?.to_le_bytes());
    for len in sections {
        out.extend_from_slice(&as_u32(len)?.to_le_bytes());
    }
    Ok(())
}

/// Parsed content header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub total: u32,
    pub feature_json: u32,
    pub feature_binary: u32,
    pub batch_json: u32,
    pub batch_binary: u32,
}

impl ContentHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(TilerError::InvalidInput(format!("content of {} bytes has no header", data.len())));
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Ok(Self {
            magic: [data[0], data[1], data[2], data[3]],
            version: word(4),
            total: word(8),
            feature_json: word(12),
            feature_binary: word(16),
            batch_json: word(20),
            batch_binary: word(24),
        })
    }

    /// Byte offset of the body after both tables.
    pub fn body_offset(&self) -> usize {
        HEADER_LEN
            + (self.feature_json + self.feature_binary + self.batch_json + self.batch_binary) as usize
    }
}

/// JSON bytes padded with spaces so `offset + len` lands on 8 bytes.
fn padded_json(value: &Value, offset: usize) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    let pad = (8 - (offset + bytes.len()) % 8) % 8;
    bytes.extend(std::iter::repeat(b' ').take(pad));
    Ok(bytes)
}

/// Binary bytes zero-padded to a multiple of 8.
fn padded_binary(mut bytes: Vec<u8>) -> Vec<u8> {
    let pad = (8 - bytes.len() % 8) % 8;
    bytes.extend(std::iter::repeat(0u8).take(pad));
    bytes
}

/// Batch table with one array per property key, indexed by batch id.
/// Units lacking a key get `null`.
pub fn batch_table(properties: &[&Properties]) -> Value {
    let mut table = Map::new();
    for (batch, props) in properties.iter().enumerate() {
        for (key, value) in props.iter() {
            let column = table
                .entry(key.clone())
                .or_insert_with(|| Value::Array(vec![Value::Null; properties.len()]));
            if let Value::Array(values) = column {
                values[batch] = value.clone();
            }
        }
    }
    Value::Object(table)
}

/// `RTC_CENTER` entry for a feature table.
pub(crate) fn rtc_center(center: [f64; 3]) -> Value {
    json!(center)
}
