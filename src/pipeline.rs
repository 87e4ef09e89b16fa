//! End-to-end tiling runs.
//!
//! A run has three stages. Preprocess loads every input in parallel and turns
//! it into tile units (welded and spooled for meshes, gridded and shuffled
//! for point clouds). Tile-process builds the hierarchy on one thread.
//! Postprocess writes content files in parallel, then the manifest.

use crate::config::TilerConfig;
use crate::consolidate::{weld, Consolidator};
use crate::content::writer::TILES_DIR;
use crate::content::{write_tileset, ContentWriter};
use crate::crs::CrsService;
use crate::error::{IoContext, Result};
use crate::hierarchy::{HierarchyBuilder, NodeId, Tileset};
use crate::importer::{GeometryImporter, ImportedGeometry, PointCloudImporter};
use crate::spool::PointSpooler;
use crate::types::{GeometryRecord, TileUnit, UnitId};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct TilingReport {
    pub units: usize,
    pub nodes: usize,
    pub depth: usize,
    pub contents_written: usize,
    pub contents_failed: usize,
}

/// Drives a tiling run with one configuration.
pub struct Tiler<'a> {
    config: TilerConfig,
    crs: &'a dyn CrsService,
}

impl<'a> Tiler<'a> {
    pub fn new(config: TilerConfig, crs: &'a dyn CrsService) -> Self {
        Self { config, crs }
    }

    pub fn config(&self) -> &TilerConfig {
        &self.config
    }

    /// Tile mesh and vector inputs into `out_dir`.
    pub fn run_meshes(
        &self,
        importer: &dyn GeometryImporter,
        inputs: &[PathBuf],
        out_dir: &Path,
    ) -> Result<TilingReport> {
        let start = Instant::now();
        let pool = self.thread_pool()?;
        let work = self.work_dir()?;

        let units = self.preprocess_meshes(&pool, importer, inputs, work.path())?;
        let report = self.tile_and_write(&pool, &units, out_dir)?;
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "mesh run finished");
        Ok(report)
    }

    /// Tile point-cloud inputs into `out_dir`.
    pub fn run_points(
        &self,
        importer: &dyn PointCloudImporter,
        inputs: &[PathBuf],
        out_dir: &Path,
    ) -> Result<TilingReport> {
        let start = Instant::now();
        let pool = self.thread_pool()?;
        let work = self.work_dir()?;

        let mut spooler = PointSpooler::new(self.crs, &self.config.spool, &self.config.source_crs);
        let units = spooler.run(importer, inputs, work.path(), 0)?;
        info!(units = units.len(), "point clouds preprocessed");

        let report = self.tile_and_write(&pool, &units, out_dir)?;
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "point run finished");
        Ok(report)
    }

    /// Load, normalize and optionally spool mesh inputs. Unit ids follow
    /// input order.
    pub fn preprocess_meshes(
        &self,
        pool: &rayon::ThreadPool,
        importer: &dyn GeometryImporter,
        inputs: &[PathBuf],
        work: &Path,
    ) -> Result<Vec<TileUnit>> {
        let weld_options = *Consolidator::new(&self.config.consolidate).weld_options();
        let weld_on_load = self.config.weld_on_load;

        let loaded: Vec<Vec<ImportedGeometry>> = pool.install(|| {
            inputs
                .par_iter()
                .map(|path| match importer.load_geometry(path) {
                    Ok(mut geometries) => {
                        for geometry in &mut geometries {
                            check_materials(path, &mut geometry.record);
                            if weld_on_load {
                                geometry.record = weld(&geometry.record, &weld_options);
                            }
                        }
                        info!(path = %path.display(), records = geometries.len(), "loaded input");
                        geometries
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable input");
                        Vec::new()
                    }
                })
                .collect()
        });

        let mut units = Vec::new();
        for geometry in loaded.into_iter().flatten() {
            let id = UnitId(units.len() as u32);
            match TileUnit::new(id, geometry.record, geometry.anchor, geometry.properties) {
                Ok(unit) => units.push(unit),
                Err(e) => warn!(error = %e, "skipping record"),
            }
        }

        if self.config.spool_geometry {
            pool.install(|| {
                units.par_iter_mut().for_each(|unit| {
                    if let Err(e) = unit.spool(work) {
                        warn!(unit = %unit.id, error = %e, "spool failed, keeping record in memory");
                    }
                })
            });
        }

        info!(inputs = inputs.len(), units = units.len(), "meshes preprocessed");
        Ok(units)
    }

    /// Build the hierarchy, write every content node, then the manifest.
    fn tile_and_write(&self, pool: &rayon::ThreadPool, units: &[TileUnit], out_dir: &Path) -> Result<TilingReport> {
        let mut tileset = HierarchyBuilder::new(&self.config.hierarchy, self.crs).build(units);

        let tiles_dir = out_dir.join(TILES_DIR);
        fs::create_dir_all(&tiles_dir).with_path(&tiles_dir)?;

        let (written, failed) = self.write_contents(pool, &mut tileset, units, out_dir);
        write_tileset(&tileset, self.config.volume, self.crs, out_dir)?;

        let report = TilingReport {
            units: units.len(),
            nodes: tileset.arena.len(),
            depth: tileset.depth(),
            contents_written: written,
            contents_failed: failed,
        };
        info!(?report, out = %out_dir.display(), "tileset complete");
        Ok(report)
    }

    /// Write content for every content node in parallel. Nodes whose content
    /// fails lose it in the manifest.
    fn write_contents(
        &self,
        pool: &rayon::ThreadPool,
        tileset: &mut Tileset,
        units: &[TileUnit],
        out_dir: &Path,
    ) -> (usize, usize) {
        let index: HashMap<UnitId, &TileUnit> = units.iter().map(|u| (u.id, u)).collect();
        let writer = ContentWriter::new(&self.config, self.crs, out_dir);
        let nodes = tileset.content_nodes();

        let shared: &Tileset = tileset;
        let results: Vec<(NodeId, Option<String>)> = pool.install(|| {
            nodes
                .par_iter()
                .map(|&id| {
                    let node = shared.arena.get(id);
                    match writer.write(node, &index) {
                        Ok(uri) => (id, Some(uri)),
                        Err(e) => {
                            error!(code = %node.code, error = %e, "content failed, dropping it from the manifest");
                            (id, None)
                        }
                    }
                })
                .collect()
        });

        let mut written = 0;
        for (id, uri) in results {
            let node = tileset.arena.get_mut(id);
            match uri {
                Some(uri) => {
                    if let Some(content) = node.content.as_mut() {
                        content.uri = Some(uri);
                        written += 1;
                    }
                }
                None => node.content = None,
            }
        }
        (written, nodes.len() - written)
    }

    fn thread_pool(&self) -> Result<rayon::ThreadPool> {
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .thread_name(|i| format!("geotiler-{i}"))
            .build()?)
    }

    fn work_dir(&self) -> Result<tempfile::TempDir> {
        Ok(tempfile::Builder::new().prefix("geotiler-").tempdir()?)
    }
}

/// Faces pointing at a material the record does not have are reported and
/// fall back to the default material. A record with no materials at all is
/// reported too but kept as is. Returns the number of problems logged.
fn check_materials(path: &Path, record: &mut GeometryRecord) -> usize {
    let count = record.materials.len();
    let mut problems = 0;
    if count == 0 {
        error!(path = %path.display(), "record has no materials, using default");
        problems += 1;
    }
    for surface in &mut record.surfaces {
        if let Some(m) = surface.material {
            if m >= count {
                error!(path = %path.display(), material = m, "missing material, using default");
                surface.material = None;
                problems += 1;
            }
        }
    }
    problems
}

/// Expand `paths` into input files with one of `extensions`. Directories are
/// listed (recursively when asked); explicit files are kept as given.
pub fn collect_inputs(paths: &[PathBuf], extensions: &[&str], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            collect_dir(path, extensions, recursive, &mut out)?;
        } else {
            out.push(path.clone());
        }
    }
    Ok(out)
}

fn collect_dir(dir: &Path, extensions: &[&str], recursive: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_path(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            if recursive {
                collect_dir(&path, extensions, recursive, out)?;
            }
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
        {
            out.push(path);
        }
    }
    Ok(())
}
