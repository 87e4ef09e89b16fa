//! Spooling of intermediate data to disk.
//!
//! Mesh records are spooled one file per unit ([`record`]); point clouds go
//! through a three-pass pipeline into a spatial grid of cell files ([`grid`]):
//! header scan, streaming spool, then a shuffle so that the first N records of
//! any cell are an unbiased sample.

pub mod grid;
pub mod record;
pub mod sampler;

pub use grid::{Quantization, SpatialGrid, SpooledCell};
pub use sampler::Sampler;

use crate::config::SpoolConfig;
use crate::crs::CrsService;
use crate::error::Result;
use crate::importer::PointCloudImporter;
use crate::types::{AnchorInfo, BoundingBox, TileUnit, UnitId};
use glam::{DMat4, DVec3};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Local metric frame the point grid is laid out in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridFrame {
    /// Union of all input bounds, in grid (east-north-up) metres.
    pub bounds: BoundingBox,
    /// Grid frame to ECEF.
    pub to_ecef: DMat4,
}

/// Drives the header scan, spool, and shuffle passes for point clouds.
pub struct PointSpooler<'a> {
    crs: &'a dyn CrsService,
    config: &'a SpoolConfig,
    source_crs: &'a str,
    sampler: Sampler,
}

impl<'a> PointSpooler<'a> {
    pub fn new(crs: &'a dyn CrsService, config: &'a SpoolConfig, source_crs: &'a str) -> Self {
        Self {
            crs,
            config,
            source_crs,
            sampler: Sampler::new(config.seed),
        }
    }

    /// Run all three passes and turn the surviving cells into tile units
    /// numbered from `first_id`.
    pub fn run(
        &mut self,
        importer: &dyn PointCloudImporter,
        inputs: &[PathBuf],
        dir: &Path,
        first_id: u32,
    ) -> Result<Vec<TileUnit>> {
        let Some(frame) = self.scan(importer, inputs)? else {
            warn!("no readable point cloud headers");
            return Ok(Vec::new());
        };
        let cells = self.spool(importer, inputs, &frame, dir)?;
        let cells = self.consolidate(cells);
        Ok(cells_to_units(&cells, &frame, self.crs, first_id))
    }

    /// Pass 1: union every input's declared bounds into the grid frame.
    pub fn scan(&self, importer: &dyn PointCloudImporter, inputs: &[PathBuf]) -> Result<Option<GridFrame>> {
        let mut headers = Vec::new();
        for path in inputs {
            match importer.read_header(path) {
                Ok(header) => headers.push(header),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable point cloud header"),
            }
        }

        let Some(source_bounds) = headers
            .iter()
            .map(|h| h.bounds)
            .reduce(|a, b| a.union(&b))
        else {
            return Ok(None);
        };

        let center = self
            .crs
            .transform(self.source_crs, DVec3::from_array(source_bounds.center()))?;
        let to_ecef = self.crs.local_tangent_frame(center);
        let to_grid = to_ecef.inverse();

        // Sample a 3×3×3 lattice per box so curvature between corners is covered.
        let mut local = Vec::with_capacity(headers.len() * 27);
        for header in &headers {
            let (min, max) = (header.bounds.min, header.bounds.max);
            for i in 0..27 {
                let t = [(i % 3) as f64 * 0.5, ((i / 3) % 3) as f64 * 0.5, (i / 9) as f64 * 0.5];
                let p = DVec3::new(
                    min[0] + (max[0] - min[0]) * t[0],
                    min[1] + (max[1] - min[1]) * t[1],
                    min[2] + (max[2] - min[2]) * t[2],
                );
                let ecef = self.crs.transform(self.source_crs, p)?;
                local.push(to_grid.transform_point3(ecef).to_array());
            }
        }

        let point_total: u64 = headers.iter().map(|h| h.point_count).sum();
        // Lattice samples can miss a few centimetres of curvature; pad by a metre.
        let bounds = BoundingBox::from_points(local.into_iter())
            .map(|b| BoundingBox::new(b.min.map(|v| v - 1.0), b.max.map(|v| v + 1.0)))
            .unwrap_or(BoundingBox::new([0.0; 3], [0.0; 3]));
        info!(
            inputs = headers.len(),
            points = point_total,
            extent = ?bounds.dimensions(),
            "scanned point cloud headers"
        );
        Ok(Some(GridFrame { bounds, to_ecef }))
    }

    /// Pass 2: stream every point into its grid cell.
    pub fn spool(
        &self,
        importer: &dyn PointCloudImporter,
        inputs: &[PathBuf],
        frame: &GridFrame,
        dir: &Path,
    ) -> Result<Vec<SpooledCell>> {
        let mut grid = SpatialGrid::new(frame.bounds, self.config.cell_size, dir);
        let to_grid = frame.to_ecef.inverse();

        for path in inputs {
            let mut spooled = 0u64;
            let outcome = (|| -> Result<()> {
                for point in importer.stream_points(path)? {
                    let point = match point {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(path = %path.display(), error = %e, "skipping malformed point");
                            continue;
                        }
                    };
                    let ecef = self.crs.transform(self.source_crs, DVec3::from_array(point.position))?;
                    let local = to_grid.transform_point3(ecef).to_array();
                    match grid.push(local, point.color) {
                        Ok(()) => spooled += 1,
                        Err(e) => warn!(error = %e, "cannot write point cell, dropping its points"),
                    }
                }
                Ok(())
            })();

            match outcome {
                Ok(()) => info!(path = %path.display(), points = spooled, "spooled point cloud"),
                Err(e) => warn!(path = %path.display(), error = %e, points = spooled, "abandoned point cloud"),
            }
        }

        if grid.dropped() > 0 {
            warn!(points = grid.dropped(), "points lost to unwritable cells");
        }
        let counts = grid.counts();
        let cells = grid.finish();
        info!(grid = ?counts, occupied = cells.len(), "point grid spooled");
        Ok(cells)
    }

    /// Pass 3: shuffle every cell in place. Cells that fail are dropped.
    pub fn consolidate(&mut self, cells: Vec<SpooledCell>) -> Vec<SpooledCell> {
        cells
            .into_iter()
            .filter(|cell| match grid::shuffle_cell(&cell.path, &mut self.sampler) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "dropping cell that could not be shuffled");
                    false
                }
            })
            .collect()
    }
}

/// One point-cloud unit per cell, anchored at the cell centre.
pub fn cells_to_units(
    cells: &[SpooledCell],
    frame: &GridFrame,
    crs: &dyn CrsService,
    first_id: u32,
) -> Vec<TileUnit> {
    cells
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let center = frame.to_ecef.transform_point3(DVec3::from_array(cell.bounds.center()));
            let [lon, lat, height] = crs.cartesian_to_geographic(center);
            let anchor = AnchorInfo::new(lon, lat, height);
            let to_local = anchor.local_to_ecef(crs).inverse() * frame.to_ecef;
            let bounds = BoundingBox::from_points(
                cell.bounds
                    .corners()
                    .into_iter()
                    .map(|c| to_local.transform_point3(DVec3::from_array(c)).to_array()),
            )
            .unwrap_or(cell.bounds);

            TileUnit::point_cell(
                UnitId(first_id + i as u32),
                cell.path.clone(),
                to_local,
                cell.points,
                bounds,
                anchor,
            )
        })
        .collect()
}
