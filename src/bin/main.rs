//! geotiler CLI
//!
//! Build a 3D Tiles tileset from mesh or point-cloud files.

use clap::{Args, Parser, Subcommand, ValueEnum};
use geotiler::{
    collect_inputs, init_logging, JsonMeshImporter, Refine, Tiler, TilerConfig, TilingReport, VolumeKind, Wgs84,
    XyzPointImporter,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "geotiler")]
#[command(author, version, about = "Build 3D Tiles tilesets from meshes and point clouds", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log filter directive (e.g. "debug" or "info,geotiler::hierarchy=debug")
    #[arg(long, global = true)]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Tile JSON mesh / footprint documents
    Mesh(RunArgs),

    /// Tile XYZ point clouds
    Points(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Input files or directories
    #[arg(short, long, required = true, num_args = 1..)]
    input: Vec<PathBuf>,

    /// Output directory for tileset.json and tiles/
    #[arg(short, long)]
    output: PathBuf,

    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum units per content node
    #[arg(long)]
    max_count: Option<usize>,

    /// Lowest LOD to generate (0-3)
    #[arg(long)]
    min_lod: Option<u8>,

    /// Highest LOD to generate (0-3)
    #[arg(long)]
    max_lod: Option<u8>,

    /// Source CRS of the inputs (e.g. EPSG:4326)
    #[arg(long)]
    crs: Option<String>,

    /// Descend into subdirectories of input directories
    #[arg(short, long)]
    recursive: bool,

    /// Refinement of content children
    #[arg(long, value_enum)]
    refine: Option<RefineArg>,

    /// Bounding volume type in the manifest
    #[arg(long, value_enum)]
    volume: Option<VolumeArg>,

    /// Worker threads (0 = all cores)
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum RefineArg {
    Add,
    Replace,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum VolumeArg {
    Region,
    Box,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    let report = match cli.command {
        Commands::Mesh(args) => {
            let (tiler_config, inputs) = prepare(&args, &["json", "geojson"])?;
            let tiler = Tiler::new(tiler_config, &Wgs84);
            tiler.run_meshes(&JsonMeshImporter, &inputs, &args.output)?
        }
        Commands::Points(args) => {
            let (tiler_config, inputs) = prepare(&args, &["xyz", "txt", "csv"])?;
            let tiler = Tiler::new(tiler_config, &Wgs84);
            tiler.run_points(&XyzPointImporter, &inputs, &args.output)?
        }
    };

    print_report(&report);
    Ok(())
}

/// Merge the config file with flags and expand input directories.
fn prepare(args: &RunArgs, extensions: &[&str]) -> Result<(TilerConfig, Vec<PathBuf>), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => TilerConfig::from_file(path)?,
        None => TilerConfig::default(),
    };

    if let Some(max_count) = args.max_count {
        config = config.with_max_count(max_count);
    }
    if args.min_lod.is_some() || args.max_lod.is_some() {
        let min = args.min_lod.unwrap_or(config.hierarchy.min_lod);
        let max = args.max_lod.unwrap_or(config.hierarchy.max_lod);
        config = config.with_lod_range(min, max);
    }
    if let Some(crs) = &args.crs {
        config = config.with_source_crs(crs.clone());
    }
    if let Some(refine) = args.refine {
        config = config.with_refine(match refine {
            RefineArg::Add => Refine::Add,
            RefineArg::Replace => Refine::Replace,
        });
    }
    if let Some(volume) = args.volume {
        config = config.with_volume(match volume {
            VolumeArg::Region => VolumeKind::Region,
            VolumeArg::Box => VolumeKind::Box,
        });
    }
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }

    let inputs = collect_inputs(&args.input, extensions, args.recursive)?;
    if inputs.is_empty() {
        return Err("no input files found".into());
    }
    Ok((config, inputs))
}

fn print_report(report: &TilingReport) {
    println!("Tileset built:");
    println!("  Units: {}", report.units);
    println!("  Nodes: {} (depth {})", report.nodes, report.depth);
    println!("  Content files: {}", report.contents_written);
    if report.contents_failed > 0 {
        println!("  Failed content files: {} (see log)", report.contents_failed);
    }
}
