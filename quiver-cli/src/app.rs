use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use quiver_config::load_pipeline;
use quiver_indicators::indicator_registry;
use quiver_pipeline::{
    build_pipeline, deserialize_state, execute, init_streaming, serialize_state, PipelineConfig,
    StagePoint, StreamingState,
};
use tracing::{info, warn};

use crate::data::{load_csv, write_json_lines};
use crate::telemetry::init_tracing;

#[derive(Parser)]
#[command(author, version, about = "Quiver indicator pipelines")]
pub struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. `info`, `quiver_pipeline=debug`)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
    /// Also write JSON logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline definition and print its execution plan
    Validate(ValidateArgs),
    /// Run a pipeline over a CSV dataset in one batch
    Run(RunArgs),
    /// Feed a CSV dataset through a pipeline point by point
    Stream(StreamArgs),
    /// List registered indicators
    Indicators,
}

#[derive(Args)]
pub struct ValidateArgs {
    #[arg(long)]
    pipeline: PathBuf,
}

#[derive(Args)]
pub struct RunArgs {
    #[arg(long)]
    pipeline: PathBuf,
    #[arg(long)]
    data: PathBuf,
    /// Write JSON lines here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
pub struct StreamArgs {
    #[arg(long)]
    pipeline: PathBuf,
    #[arg(long)]
    data: PathBuf,
    /// Continue from a state blob written by `--save`
    #[arg(long)]
    resume: Option<PathBuf>,
    /// Persist the final state to this path
    #[arg(long)]
    save: Option<PathBuf>,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(&cli.log_level, cli.log_json, cli.log_dir.as_deref())?;
    match cli.command {
        Commands::Validate(args) => validate(&args),
        Commands::Run(args) => run_batch(&args),
        Commands::Stream(args) => run_stream(&args),
        Commands::Indicators => list_indicators(),
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    let definition = load_pipeline(path)?;
    let config = build_pipeline(&definition)
        .with_context(|| format!("pipeline {} is invalid", path.display()))?;
    info!(
        pipeline = definition.display_name(),
        id = %config.id(),
        "pipeline loaded"
    );
    Ok(config)
}

fn validate(args: &ValidateArgs) -> Result<()> {
    let config = load_config(&args.pipeline)?;
    println!(
        "pipeline is valid: {} stages in {} waves",
        config.stages().len(),
        config.waves().len()
    );
    for (idx, wave) in config.waves().iter().enumerate() {
        println!("wave {}: {}", idx + 1, wave.join(", "));
    }
    println!("execution order: {}", config.execution_order().join(" -> "));
    Ok(())
}

fn run_batch(args: &RunArgs) -> Result<()> {
    let config = load_config(&args.pipeline)?;
    let data = load_csv(&args.data)?;
    let result = execute(&config, &data)?;
    for error in &result.errors {
        warn!(stage = %error.stage_id, error = %error, "stage failed");
    }
    let written = write_json_lines(args.output.as_deref(), &result.merged)?;
    info!(
        points = data.len(),
        outputs = written,
        elapsed_ms = result.metrics.elapsed.as_millis() as u64,
        "batch run complete"
    );
    Ok(())
}

fn run_stream(args: &StreamArgs) -> Result<()> {
    let config = Arc::new(load_config(&args.pipeline)?);
    let data = load_csv(&args.data)?;
    let mut state: StreamingState = match &args.resume {
        Some(path) => {
            let blob =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            deserialize_state(Arc::clone(&config), &blob)
                .with_context(|| format!("cannot resume from {}", path.display()))?
        }
        None => init_streaming(Arc::clone(&config))?,
    };

    let mut outputs = Vec::new();
    for point in &data {
        let update = state.advance(point)?;
        for error in &update.output.errors {
            warn!(stage = %error.stage_id, error = %error, "stage update failed");
        }
        outputs.extend(
            update
                .output
                .results
                .into_iter()
                .map(|(stage_id, point)| StagePoint { stage_id, point }),
        );
        state = update.state;
    }
    write_json_lines(None, &outputs)?;

    if let Some(path) = &args.save {
        let blob = serialize_state(&state)?;
        fs::write(path, blob).with_context(|| format!("failed to write {}", path.display()))?;
    }
    let metrics = state.metrics();
    info!(
        calls = metrics.total_executions(),
        points = metrics.points_processed(),
        errors = metrics.total_errors(),
        throughput = metrics.throughput(),
        "stream complete"
    );
    Ok(())
}

fn list_indicators() -> Result<()> {
    let registry = indicator_registry();
    for name in registry.names() {
        let capability = registry.resolve(&name)?;
        let kind = if capability.is_streaming() {
            "streaming"
        } else {
            "stateless"
        };
        println!("{name}\t{kind}");
    }
    Ok(())
}
