use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "ct-bodycomp",
    version,
    about = "T1-T12 body composition indices from CT series"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Quantify every unit listed in a manifest.
    Run(RunArgs),
    /// Load one series and print its geometry.
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long, help = "JSON array of {patient, timepoint, series_dir, height_m}")]
    pub manifest: PathBuf,

    #[arg(long, help = "Segmentation model program")]
    pub model_cmd: PathBuf,

    #[arg(long = "model-arg", help = "Extra argument passed to the model program (repeatable)")]
    pub model_args: Vec<String>,

    #[arg(long, help = "Pipeline configuration (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Directory for cached stage results")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, help = "Write the batch report here instead of stdout")]
    pub output: Option<PathBuf>,

    #[arg(long, help = "Write QC preview images into this directory")]
    pub qc_dir: Option<PathBuf>,

    #[arg(long, help = "Units processed concurrently (0 = auto)")]
    pub workers: Option<usize>,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    pub series_dir: PathBuf,
}
