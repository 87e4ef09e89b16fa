//! Tiler configuration.
//!
//! Every struct has a `Default` matching the stock tiler behaviour and
//! deserializes with `#[serde(default)]`, so a JSON config file only needs the
//! keys it changes.

use crate::error::{IoContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How child tiles combine with their parent when rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Refine {
    Add,
    #[default]
    Replace,
}

impl Refine {
    /// Manifest spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Refine::Add => "ADD",
            Refine::Replace => "REPLACE",
        }
    }
}

/// Bounding volume flavour written to the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    #[default]
    Region,
    Box,
}

/// Spatial partitioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Largest number of units one content node may hold.
    pub max_count: usize,
    /// Square a region before quartering it.
    pub square_regions: bool,
    /// Lowest LOD a content node is refined down to (0..=3).
    pub min_lod: u8,
    /// LOD of content nodes right below the structural tree (0..=3).
    pub max_lod: u8,
    /// Refinement of content children.
    pub refine: Refine,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            max_count: 256,
            square_regions: false,
            min_lod: 0,
            max_lod: 3,
            refine: Refine::Replace,
        }
    }
}

/// Weld, join, and cluster settings used on content merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidateConfig {
    /// Weld distance in metres.
    pub weld_epsilon: f64,
    pub match_normal: bool,
    pub match_color: bool,
    pub match_uv: bool,
    /// Cluster cell size as a fraction of the node's geometric error.
    pub cluster_ratio: f64,
    /// Cells smaller than this (metres) skip clustering.
    pub min_cluster_cell: f64,
    /// Merge connected surfaces sharing a material.
    pub join_surfaces: bool,
}

impl Default for ConsolidateConfig {
    fn default() -> Self {
        Self {
            weld_epsilon: 1e-3,
            match_normal: false,
            match_color: true,
            match_uv: true,
            cluster_ratio: 0.1,
            min_cluster_cell: 0.05,
            join_surfaces: true,
        }
    }
}

/// Point-cloud grid spooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Grid cell size in metres (east, north, up).
    pub cell_size: [f64; 3],
    /// Seed for the cell shuffle.
    pub seed: u64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            cell_size: [500.0, 500.0, 50.0],
            seed: 0x5eed,
        }
    }
}

/// Top-level configuration for a tiling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilerConfig {
    pub hierarchy: HierarchyConfig,
    pub consolidate: ConsolidateConfig,
    pub spool: SpoolConfig,
    pub volume: VolumeKind,
    /// Worker threads for the parallel stages (0 = all cores).
    pub workers: usize,
    /// CRS of point-cloud inputs.
    pub source_crs: String,
    /// Byte budget of one content file.
    pub max_content_bytes: usize,
    /// Point cap per point-cloud content file.
    pub max_points_per_tile: usize,
    /// Spool mesh records to disk after loading.
    pub spool_geometry: bool,
    /// Weld each record once right after loading.
    pub weld_on_load: bool,
}

impl Default for TilerConfig {
    fn default() -> Self {
        Self {
            hierarchy: HierarchyConfig::default(),
            consolidate: ConsolidateConfig::default(),
            spool: SpoolConfig::default(),
            volume: VolumeKind::Region,
            workers: 0,
            source_crs: "EPSG:4326".to_string(),
            max_content_bytes: 4 * 1024 * 1024,
            max_points_per_tile: 500_000,
            spool_geometry: true,
            weld_on_load: true,
        }
    }
}

impl TilerConfig {
    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.hierarchy.max_count = max_count.max(1);
        self
    }

    /// Set the LOD range; values above 3 are clamped.
    pub fn with_lod_range(mut self, min_lod: u8, max_lod: u8) -> Self {
        let max_lod = max_lod.min(3);
        self.hierarchy.min_lod = min_lod.min(max_lod);
        self.hierarchy.max_lod = max_lod;
        self
    }

    pub fn with_refine(mut self, refine: Refine) -> Self {
        self.hierarchy.refine = refine;
        self
    }

    pub fn with_volume(mut self, volume: VolumeKind) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_source_crs(mut self, crs: impl Into<String>) -> Self {
        self.source_crs = crs.into();
        self
    }

    pub fn with_max_content_bytes(mut self, bytes: usize) -> Self {
        self.max_content_bytes = bytes;
        self
    }

    pub fn with_spool_geometry(mut self, spool: bool) -> Self {
        self.spool_geometry = spool;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TilerConfig::default();
        assert_eq!(config.hierarchy.max_count, 256);
        assert_eq!(config.hierarchy.refine, Refine::Replace);
        assert_eq!(config.spool.cell_size, [500.0, 500.0, 50.0]);
        assert_eq!(config.volume, VolumeKind::Region);
    }

    #[test]
    fn test_partial_json() {
        let config: TilerConfig = serde_json::from_str(
            r#"{"hierarchy": {"max_count": 64, "refine": "add"}, "volume": "box", "workers": 2}"#,
        )
        .unwrap();
        assert_eq!(config.hierarchy.max_count, 64);
        assert_eq!(config.hierarchy.refine, Refine::Add);
        assert_eq!(config.hierarchy.max_lod, 3);
        assert_eq!(config.volume, VolumeKind::Box);
        assert_eq!(config.workers, 2);
        assert_eq!(config.consolidate, ConsolidateConfig::default());
    }

    #[test]
    fn test_builders() {
        let config = TilerConfig::default()
            .with_max_count(0)
            .with_lod_range(5, 9)
            .with_refine(Refine::Add);
        assert_eq!(config.hierarchy.max_count, 1);
        assert_eq!(config.hierarchy.min_lod, 3);
        assert_eq!(config.hierarchy.max_lod, 3);
        assert_eq!(Refine::Add.as_str(), "ADD");
    }
}
