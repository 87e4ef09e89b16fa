//! # geotiler
//!
//! Build hierarchical, streamable 3D Tiles tilesets from triangle meshes,
//! extruded GIS footprints and point clouds.
//!
//! ## Overview
//!
//! Inputs are read through importer traits into geometry records anchored on
//! the globe. Records become tile units, which are spooled to disk and
//! partitioned into a quadtree of nodes with bounding volumes, LODs and
//! geometric errors. Each content node is written as one `b3dm` or `pnts`
//! file, and `tileset.json` ties the tree together.
//!
//! ## Quick Start
//!
//! ```ignore
//! use geotiler::{JsonMeshImporter, Tiler, TilerConfig, Wgs84};
//! use std::path::{Path, PathBuf};
//!
//! let config = TilerConfig::default().with_max_count(128);
//! let tiler = Tiler::new(config, &Wgs84);
//! let report = tiler.run_meshes(
//!     &JsonMeshImporter,
//!     &[PathBuf::from("city.json")],
//!     Path::new("out"),
//! )?;
//! println!("{} content files", report.contents_written);
//! ```
//!
//! ## Plugging in formats
//!
//! Implement [`GeometryImporter`] or [`PointCloudImporter`] for a source
//! format and [`CrsService`] for a projection library; the pipeline only
//! talks to those traits.

pub mod config;
pub mod consolidate;
pub mod content;
pub mod crs;
pub mod error;
pub mod hierarchy;
pub mod importer;
pub mod logging;
pub mod pipeline;
pub mod spool;
pub mod types;
pub mod volume;

// Re-export main types for convenience
pub use config::{ConsolidateConfig, HierarchyConfig, Refine, SpoolConfig, TilerConfig, VolumeKind};
pub use consolidate::{cluster_decimate, join_surfaces, weld, Consolidator, WeldOptions};
pub use content::{tileset_json, write_tileset, ContentPayload, ContentWriter};
pub use crs::{CrsService, Wgs84};
pub use error::{Result, TilerError};
pub use hierarchy::{HierarchyBuilder, Lod, Node, NodeId, Tileset};
pub use importer::{GeometryImporter, ImportedGeometry, JsonMeshImporter, PointCloudImporter, XyzPointImporter};
pub use logging::init_logging;
pub use pipeline::{collect_inputs, Tiler, TilingReport};
pub use types::{AnchorInfo, BoundingBox, GeometryRecord, Material, Properties, Surface, TileUnit, UnitId, Vertex};
pub use volume::BoundingVolume;
