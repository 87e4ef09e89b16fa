//! Spatial grid of point spool files.
//!
//! Every occupied cell owns one file: a 52-byte [`CellHeader`] followed by
//! fixed 16-byte point records. All cells share one quantization frame taken
//! from the global grid bounds, so records can be concatenated across cells
//! without re-encoding.

use super::sampler::Sampler;
use crate::error::{IoContext, Result, TilerError};
use crate::types::BoundingBox;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CELL_FORMAT_VERSION: u16 = 1;
pub const CELL_HEADER_SIZE: usize = 52;
pub const POINT_RECORD_SIZE: usize = 16;

/// Affine quantization frame: `encoded = (world - offset) / scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantization {
    pub scale: [f64; 3],
    pub offset: [f64; 3],
}

impl Quantization {
    /// Frame mapping `bounds` onto the unit cube.
    pub fn for_bounds(bounds: &BoundingBox) -> Self {
        let d = bounds.dimensions();
        Self {
            scale: [d[0].max(1e-9), d[1].max(1e-9), d[2].max(1e-9)],
            offset: bounds.min,
        }
    }

    pub fn encode(&self, p: [f64; 3]) -> [f32; 3] {
        [
            ((p[0] - self.offset[0]) / self.scale[0]) as f32,
            ((p[1] - self.offset[1]) / self.scale[1]) as f32,
            ((p[2] - self.offset[2]) / self.scale[2]) as f32,
        ]
    }

    pub fn decode(&self, e: [f32; 3]) -> [f64; 3] {
        [
            e[0] as f64 * self.scale[0] + self.offset[0],
            e[1] as f64 * self.scale[1] + self.offset[1],
            e[2] as f64 * self.scale[2] + self.offset[2],
        ]
    }
}

/// Fixed-size header at the start of each cell file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellHeader {
    pub version: u16,
    pub record_size: u16,
    pub quantization: Quantization,
}

impl CellHeader {
    pub fn new(quantization: Quantization) -> Self {
        Self {
            version: CELL_FORMAT_VERSION,
            record_size: POINT_RECORD_SIZE as u16,
            quantization,
        }
    }

    pub fn to_bytes(&self) -> [u8; CELL_HEADER_SIZE] {
        let mut out = [0u8; CELL_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.version.to_le_bytes());
        out[2..4].copy_from_slice(&self.record_size.to_le_bytes());
        let values = self.quantization.scale.iter().chain(self.quantization.offset.iter());
        for (i, v) in values.enumerate() {
            out[4 + i * 8..12 + i * 8].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; CELL_HEADER_SIZE]) -> Result<Self> {
        let version = u16::from_le_bytes([bytes[0], bytes[1]]);
        let record_size = u16::from_le_bytes([bytes[2], bytes[3]]);
        if version != CELL_FORMAT_VERSION || record_size as usize != POINT_RECORD_SIZE {
            return Err(TilerError::Spool(format!(
                "unsupported cell format (version {version}, record size {record_size})"
            )));
        }
        let mut values = [0f64; 6];
        for (i, v) in values.iter_mut().enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[4 + i * 8..12 + i * 8]);
            *v = f64::from_le_bytes(buf);
        }
        Ok(Self {
            version,
            record_size,
            quantization: Quantization {
                scale: [values[0], values[1], values[2]],
                offset: [values[3], values[4], values[5]],
            },
        })
    }
}

/// One spooled point: quantized position and RGB color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRecord {
    pub position: [f32; 3],
    pub color: [u8; 3],
}

impl PointRecord {
    pub fn to_bytes(&self) -> [u8; POINT_RECORD_SIZE] {
        let mut out = [0u8; POINT_RECORD_SIZE];
        for (i, c) in self.position.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&c.to_le_bytes());
        }
        out[12..15].copy_from_slice(&self.color);
        out
    }

    pub fn from_bytes(b: &[u8; POINT_RECORD_SIZE]) -> Self {
        let f = |i: usize| f32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        Self {
            position: [f(0), f(4), f(8)],
            color: [b[12], b[13], b[14]],
        }
    }
}

/// A cell file that survived spooling.
#[derive(Debug, Clone, PartialEq)]
pub struct SpooledCell {
    pub index: [u32; 3],
    pub path: PathBuf,
    /// Cell extent in the grid frame.
    pub bounds: BoundingBox,
    pub points: u64,
}

/// Uniform grid of cell files over the union of all input bounds.
pub struct SpatialGrid {
    bounds: BoundingBox,
    cell_size: [f64; 3],
    counts: [u32; 3],
    quantization: Quantization,
    dir: PathBuf,
    writers: HashMap<[u32; 3], BufWriter<File>>,
    points: HashMap<[u32; 3], u64>,
    failed: HashSet<[u32; 3]>,
    dropped: u64,
}

impl SpatialGrid {
    /// Size the grid so each axis has `ceil(extent / cell)` cells (at least one).
    pub fn new(bounds: BoundingBox, cell_size: [f64; 3], dir: impl Into<PathBuf>) -> Self {
        let d = bounds.dimensions();
        let mut counts = [1u32; 3];
        for i in 0..3 {
            if cell_size[i] > 0.0 {
                counts[i] = ((d[i] / cell_size[i]).ceil() as u32).max(1);
            }
        }
        Self {
            bounds,
            cell_size,
            counts,
            quantization: Quantization::for_bounds(&bounds),
            dir: dir.into(),
            writers: HashMap::new(),
            points: HashMap::new(),
            failed: HashSet::new(),
            dropped: 0,
        }
    }

    pub fn counts(&self) -> [u32; 3] {
        self.counts
    }

    pub fn quantization(&self) -> Quantization {
        self.quantization
    }

    /// Points lost to cells whose file could not be written.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Cell containing `p`. Points outside the grid clamp to the border cell.
    pub fn cell_of(&self, p: [f64; 3]) -> [u32; 3] {
        let mut cell = [0u32; 3];
        for i in 0..3 {
            let size = if self.cell_size[i] > 0.0 { self.cell_size[i] } else { f64::MAX };
            let k = ((p[i] - self.bounds.min[i]) / size).floor();
            cell[i] = k.clamp(0.0, (self.counts[i] - 1) as f64) as u32;
        }
        cell
    }

    pub fn cell_bounds(&self, cell: [u32; 3]) -> BoundingBox {
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for i in 0..3 {
            let size = if self.cell_size[i] > 0.0 {
                self.cell_size[i]
            } else {
                self.bounds.dimensions()[i]
            };
            min[i] = self.bounds.min[i] + cell[i] as f64 * size;
            max[i] = (min[i] + size).min(self.bounds.max[i].max(min[i]));
        }
        BoundingBox::new(min, max)
    }

    pub fn cell_path(&self, cell: [u32; 3]) -> PathBuf {
        self.dir
            .join(format!("cell_{}_{}_{}.pnt", cell[0], cell[1], cell[2]))
    }

    /// Append one point to its cell file, opening the file on first use.
    pub fn push(&mut self, p: [f64; 3], color: [u8; 3]) -> Result<()> {
        let cell = self.cell_of(p);
        if self.failed.contains(&cell) {
            self.dropped += 1;
            return Ok(());
        }

        if !self.writers.contains_key(&cell) {
            let path = self.cell_path(cell);
            let opened = File::create(&path).and_then(|file| {
                let mut writer = BufWriter::new(file);
                writer.write_all(&CellHeader::new(self.quantization).to_bytes())?;
                Ok(writer)
            });
            match opened {
                Ok(writer) => {
                    self.writers.insert(cell, writer);
                }
                Err(e) => {
                    self.failed.insert(cell);
                    self.dropped += 1;
                    return Err(TilerError::file(path, e));
                }
            }
        }

        let record = PointRecord {
            position: self.quantization.encode(p),
            color,
        };
        let path = self.cell_path(cell);
        let writer = self
            .writers
            .get_mut(&cell)
            .ok_or_else(|| TilerError::Spool("cell writer vanished".to_string()))?;
        if let Err(e) = writer.write_all(&record.to_bytes()) {
            self.failed.insert(cell);
            self.writers.remove(&cell);
            self.dropped += 1;
            return Err(TilerError::file(path, e));
        }
        *self.points.entry(cell).or_insert(0) += 1;
        Ok(())
    }

    /// Flush every cell, delete header-only files, and list the rest.
    ///
    /// A cell that cannot be flushed or inspected is logged and left out;
    /// the other cells are still returned.
    pub fn finish(mut self) -> Vec<SpooledCell> {
        let mut cells = Vec::new();
        let mut writers: Vec<_> = self.writers.drain().collect();
        writers.sort_by_key(|(cell, _)| *cell);

        for (cell, mut writer) in writers {
            let path = self.cell_path(cell);
            let flushed = writer.flush().with_path(&path);
            drop(writer);
            let len = match flushed.and_then(|()| std::fs::metadata(&path).with_path(&path)) {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "abandoning cell file");
                    self.failed.insert(cell);
                    continue;
                }
            };
            if len <= CELL_HEADER_SIZE as u64 {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "could not remove empty cell file");
                }
                continue;
            }
            if self.failed.contains(&cell) {
                continue;
            }
            cells.push(SpooledCell {
                index: cell,
                path,
                bounds: self.cell_bounds(cell),
                points: self.points.get(&cell).copied().unwrap_or(0),
            });
        }

        cells
    }
}

fn read_header(reader: &mut impl Read, path: &Path) -> Result<CellHeader> {
    let mut header = [0u8; CELL_HEADER_SIZE];
    reader.read_exact(&mut header).with_path(path)?;
    CellHeader::from_bytes(&header)
}

/// Read up to `limit` points from a cell file, decoded into the grid frame.
pub fn read_cell(path: &Path, limit: Option<usize>) -> Result<Vec<([f64; 3], [u8; 3])>> {
    let file = File::open(path).with_path(path)?;
    let total = (file.metadata().with_path(path)?.len() as usize).saturating_sub(CELL_HEADER_SIZE)
        / POINT_RECORD_SIZE;
    let mut reader = BufReader::new(file);
    let header = read_header(&mut reader, path)?;

    let n = limit.map_or(total, |l| l.min(total));
    let mut out = Vec::with_capacity(n);
    let mut buf = [0u8; POINT_RECORD_SIZE];
    for _ in 0..n {
        reader.read_exact(&mut buf).with_path(path)?;
        let record = PointRecord::from_bytes(&buf);
        out.push((header.quantization.decode(record.position), record.color));
    }
    Ok(out)
}

/// Rewrite a cell file with its records in random order.
pub fn shuffle_cell(path: &Path, sampler: &mut Sampler) -> Result<()> {
    let data = std::fs::read(path).with_path(path)?;
    if data.len() < CELL_HEADER_SIZE {
        return Err(TilerError::Spool(format!(
            "cell file {} is shorter than its header",
            path.display()
        )));
    }
    let (header, body) = data.split_at(CELL_HEADER_SIZE);
    let mut records: Vec<[u8; POINT_RECORD_SIZE]> = body
        .chunks_exact(POINT_RECORD_SIZE)
        .map(|c| {
            let mut r = [0u8; POINT_RECORD_SIZE];
            r.copy_from_slice(c);
            r
        })
        .collect();
    sampler.shuffle(&mut records);

    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(header);
    for r in &records {
        out.extend_from_slice(r);
    }
    std::fs::write(path, out).with_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_box() -> BoundingBox {
        BoundingBox::new([0.0, 0.0, 0.0], [1200.0, 500.0, 60.0])
    }

    #[test]
    fn test_grid_counts() {
        let dir = tempfile::tempdir().unwrap();
        let grid = SpatialGrid::new(grid_box(), [500.0, 500.0, 50.0], dir.path());
        assert_eq!(grid.counts(), [3, 1, 2]);
        assert_eq!(grid.cell_of([1199.0, 10.0, 55.0]), [2, 0, 1]);
        assert_eq!(grid.cell_of([-5.0, 600.0, 0.0]), [0, 0, 0]);
    }

    #[test]
    fn test_header_is_52_bytes() {
        let header = CellHeader::new(Quantization::for_bounds(&grid_box()));
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 52);
        assert_eq!(CellHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_quantization_error_within_one_step() {
        let bounds = BoundingBox::new([-2500.0, 100.0, -30.0], [7500.0, 9100.0, 470.0]);
        let q = Quantization::for_bounds(&bounds);
        let samples = [
            [-2500.0, 100.0, -30.0],
            [7500.0, 9100.0, 470.0],
            [1234.5678, 4321.125, 12.3456],
            [7499.9999, 100.0001, 469.99],
        ];
        for p in samples {
            let back = q.decode(q.encode(p));
            for i in 0..3 {
                let step = q.scale[i] / (1u64 << 24) as f64;
                assert!((back[i] - p[i]).abs() <= step, "axis {i}: {} vs {}", back[i], p[i]);
            }
        }
    }

    #[test]
    fn test_spool_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut grid = SpatialGrid::new(grid_box(), [500.0, 500.0, 50.0], dir.path());
        grid.push([10.0, 10.0, 1.0], [255, 0, 0]).unwrap();
        grid.push([20.0, 30.0, 2.0], [0, 255, 0]).unwrap();
        grid.push([1100.0, 30.0, 55.0], [0, 0, 255]).unwrap();

        let cells = grid.finish();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].index, [0, 0, 0]);
        assert_eq!(cells[0].points, 2);
        let len = std::fs::metadata(&cells[0].path).unwrap().len();
        assert_eq!(len, (CELL_HEADER_SIZE + 2 * POINT_RECORD_SIZE) as u64);

        let points = read_cell(&cells[1].path, None).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].1, [0, 0, 255]);
        assert!((points[0].0[0] - 1100.0).abs() < 1e-3);

        let limited = read_cell(&cells[0].path, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_lost_cell_does_not_abort_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut grid = SpatialGrid::new(grid_box(), [500.0, 500.0, 50.0], dir.path());
        grid.push([10.0, 10.0, 1.0], [255, 0, 0]).unwrap();
        grid.push([1100.0, 30.0, 55.0], [0, 0, 255]).unwrap();
        std::fs::remove_file(grid.cell_path([0, 0, 0])).unwrap();

        let cells = grid.finish();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].index, [2, 0, 1]);
        assert_eq!(read_cell(&cells[0].path, None).unwrap().len(), 1);
    }

    #[test]
    fn test_shuffle_keeps_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut grid = SpatialGrid::new(grid_box(), [500.0, 500.0, 50.0], dir.path());
        for i in 0..200 {
            grid.push([i as f64, 1.0, 1.0], [i as u8, 0, 0]).unwrap();
        }
        let cells = grid.finish();
        let before = read_cell(&cells[0].path, None).unwrap();

        let mut sampler = Sampler::new(1);
        shuffle_cell(&cells[0].path, &mut sampler).unwrap();
        let after = read_cell(&cells[0].path, None).unwrap();

        assert_eq!(after.len(), 200);
        assert_ne!(before, after);
        let mut reds: Vec<u8> = after.iter().map(|(_, c)| c[0]).collect();
        reds.sort_unstable();
        assert_eq!(reds, (0..200).map(|i| i as u8).collect::<Vec<_>>());
    }
}
