use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use voxtile::config::SegmentationConfig;
use voxtile::logging::init_logger;
use voxtile::pipeline::Orchestrator;

#[derive(Parser)]
#[command(name = "voxtile")]
#[command(about = "Distributed tiling, dispatch, and stitching for volumetric segmentation", long_about = None)]
struct Cli {
    /// Run configuration (TOML)
    #[arg(short, long, global = true, default_value = "voxtile.toml")]
    config: PathBuf,

    /// Override the configured worker count
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompose the raw volume into padded tiles
    Tile,
    /// Stitch classified tiles into a per-class volume
    Combine,
    /// Post-process the cell class into labeled instances
    Consolidate,
    /// Check the tile store against the current configuration
    Validate,
    /// Print volume and grid information
    Info,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logger(args.verbose);

    let mut cfg = SegmentationConfig::load(&args.config)
        .with_context(|| format!("failed to load config {:?}", args.config))?;
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }

    let orchestrator = Orchestrator::new(&cfg)?;
    match args.command {
        Commands::Tile => orchestrator.decompose()?,
        Commands::Combine => orchestrator.combine()?,
        Commands::Consolidate => orchestrator.consolidate()?,
        Commands::Validate => orchestrator.validate()?,
        Commands::Info => print!("{}", orchestrator.describe()?),
    }
    Ok(())
}
