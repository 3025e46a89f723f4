use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ct_bodycomp::cache::{ArtifactCache, DirCache, NoCache};
use ct_bodycomp::cli::{Cli, Commands, InspectArgs, RunArgs};
use ct_bodycomp::{CommandModel, Pipeline, PipelineConfig, ScanUnit, VolumeLoader, qc};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Inspect(args) => inspect(args),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let manifest = fs::read_to_string(&args.manifest)
        .with_context(|| format!("failed to read manifest {}", args.manifest.display()))?;
    let units: Vec<ScanUnit> = serde_json::from_str(&manifest)
        .with_context(|| format!("failed to parse manifest {}", args.manifest.display()))?;
    if units.is_empty() {
        anyhow::bail!("manifest {} lists no units", args.manifest.display());
    }

    let mut model = CommandModel::new(&args.model_cmd);
    model.args = args.model_args.clone();
    model.coarse_patch = config.coarse.patch_shape;
    model.coarse_classes = config.coarse.classes.len();
    model.fine_patch = config.fine.patch_shape;
    model.fine_classes = config.fine.classes.len();

    let cache: Box<dyn ArtifactCache> = match &args.cache_dir {
        Some(dir) => Box::new(DirCache::new(dir)),
        None => Box::new(NoCache),
    };
    let window = config.hu_window;
    let pipeline = Pipeline::new(config, model)?.with_cache(cache);

    info!(units = units.len(), "starting batch");
    let report = pipeline.run_batch_with(&units, |outcome| {
        if let Some(dir) = &args.qc_dir {
            if let Err(err) = qc::save_previews(outcome, window, dir) {
                warn!(patient = %outcome.unit.patient, error = %err, "failed to write qc previews");
            }
        }
    });

    let json = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }

    if report.failures() > 0 {
        warn!(failures = report.failures(), "some units failed");
    }
    Ok(())
}

fn inspect(args: InspectArgs) -> Result<()> {
    let series = VolumeLoader::load_from_directory(&args.series_dir)
        .with_context(|| format!("failed to load {}", args.series_dir.display()))?;
    let geometry = series.volume.geometry();

    println!("patient:   {}", series.patient_id.as_deref().unwrap_or("-"));
    println!("series:    {}", series.series_uid.as_deref().unwrap_or("-"));
    println!("shape:     {:?}", series.volume.shape());
    println!("spacing:   {:?}", geometry.spacing());
    println!("origin:    {:?}", geometry.origin());
    println!("direction: {:?}", geometry.direction());
    if let Some((min, max)) = series.volume.min_max() {
        println!("hu range:  {min} .. {max}");
    }
    for warning in &series.warnings {
        println!("warning:   {warning}");
    }
    Ok(())
}
