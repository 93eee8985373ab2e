//! quantpipe - command line interface
//!
//! ## Commands
//!
//! - `run` - Quantize and measure every requested variant, resuming whatever
//!   an earlier run left unfinished
//! - `plan` - Show what `run` would do without doing it
//! - `merge` - Fold leftover result shards into the canonical record
//! - `init-config` - Write a default configuration file

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use quantpipe::{
    init_production_logging, init_simple_logging, parse_device_list, parse_ratio_list,
    parse_variant_list, DispatchMode, Pipeline, PipelineConfig, ProcessBackend, RunSummary,
    ShardMerger,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Resumable multi-device quantize/measure pipeline
#[derive(Parser, Debug)]
#[command(name = "quantpipe")]
#[command(about = "Quantize a model at several bitrates and measure every variant", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.quantpipe/pipeline.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline
    Run(RunArgs),

    /// Plan every stage and print it without running anything
    Plan(RunArgs),

    /// Fold unmerged result shards into the canonical record
    Merge {
        /// Model directory
        #[arg(short, long)]
        model: Option<PathBuf>,
    },

    /// Write a default configuration file
    InitConfig {
        /// Output path (default: ~/.quantpipe/pipeline.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Command-line overrides for the configuration file
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Model directory
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Variants, e.g. "2 2.5 3" or "bf16,4"
    #[arg(short, long)]
    bpws: Option<String>,

    /// Device ordinals, e.g. "0,1"
    #[arg(short, long)]
    devices: Option<String>,

    /// Relative device capacity, e.g. "2,1"
    #[arg(short = 'r', long)]
    device_ratios: Option<String>,

    /// Dispatch mode: queue or static
    #[arg(long, value_parser = parse_schedule)]
    schedule: Option<DispatchMode>,

    /// Skip the quantize stage
    #[arg(long)]
    no_quant: bool,

    /// Skip the measure stage
    #[arg(long)]
    no_measure: bool,

    /// Do not measure the unquantized base model
    #[arg(long)]
    no_base: bool,

    /// Redo items that are already complete
    #[arg(long)]
    force: bool,

    /// Remove work dirs, shards and logs after a clean run
    #[arg(long)]
    cleanup: bool,

    /// Extra argument for the quantizer (repeatable)
    #[arg(long = "quant-arg", allow_hyphen_values = true)]
    quant_args: Vec<String>,

    /// Extra argument for the measurement tools (repeatable)
    #[arg(long = "measure-arg", allow_hyphen_values = true)]
    measure_args: Vec<String>,
}

fn parse_schedule(s: &str) -> std::result::Result<DispatchMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "queue" => Ok(DispatchMode::Queue),
        "static" => Ok(DispatchMode::Static),
        other => Err(format!("unknown schedule '{}', expected queue or static", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let config = build_config(cli.config.as_deref(), cli.log_level, &args)?;
            init_logging(&config)?;
            let summary = cmd_run(config).await?;
            std::process::exit(exit_code(&summary));
        }

        Commands::Plan(args) => {
            let mut config = build_config(cli.config.as_deref(), cli.log_level, &args)?;
            config.pipeline.dry_run = true;
            init_simple_logging(&config.logging.level)?;
            cmd_run(config).await?;
        }

        Commands::Merge { model } => {
            let args = RunArgs {
                model,
                ..RunArgs::default()
            };
            let config = load_config(cli.config.as_deref(), cli.log_level, &args)?;
            init_simple_logging(&config.logging.level)?;
            cmd_merge(&config)?;
        }

        Commands::InitConfig { output, force } => {
            init_simple_logging(cli.log_level.as_deref().unwrap_or("info"))?;
            cmd_init_config(output, force)?;
        }
    }

    Ok(())
}

/// Load the configuration file (if any) and apply command-line overrides
fn load_config(path: Option<&Path>, log_level: Option<String>, args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            let default = PipelineConfig::default_path()?;
            if default.is_file() {
                PipelineConfig::load(&default).context("Failed to load default configuration")?
            } else {
                PipelineConfig::default()
            }
        }
    };

    if let Some(level) = log_level {
        config.logging.level = level;
    }
    if let Some(model) = &args.model {
        config.pipeline.model_dir = model.clone();
    }
    if let Some(bpws) = &args.bpws {
        config.pipeline.variants = parse_variant_list(bpws).context("Invalid --bpws")?;
    }
    if let Some(devices) = &args.devices {
        config.devices.ids = parse_device_list(devices).context("Invalid --devices")?;
    }
    if let Some(ratios) = &args.device_ratios {
        config.devices.ratios = Some(parse_ratio_list(ratios).context("Invalid --device-ratios")?);
    }
    if let Some(schedule) = args.schedule {
        config.devices.schedule = schedule;
    }
    if args.no_quant {
        config.pipeline.quantize = false;
    }
    if args.no_measure {
        config.pipeline.measure = false;
    }
    if args.no_base {
        config.pipeline.measure_base = false;
    }
    if args.force {
        config.pipeline.force = true;
    }
    if args.cleanup {
        config.pipeline.cleanup = true;
    }
    if !args.quant_args.is_empty() {
        config.backend.quantize_args = args.quant_args.clone();
    }
    if !args.measure_args.is_empty() {
        config.backend.measure_args = args.measure_args.clone();
    }

    Ok(config)
}

fn build_config(path: Option<&Path>, log_level: Option<String>, args: &RunArgs) -> Result<PipelineConfig> {
    let config = load_config(path, log_level, args)?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging(config: &PipelineConfig) -> Result<()> {
    if config.logging.log_to_file {
        let layout = config.layout()?;
        init_production_logging(&config.logging.level, Some(layout.log_dir().as_path()))
    } else {
        init_simple_logging(&config.logging.level)
    }
}

fn exit_code(summary: &RunSummary) -> i32 {
    if summary.interrupted {
        130
    } else if summary.failed() > 0 {
        1
    } else {
        0
    }
}

/// Run (or plan) the pipeline until done or Ctrl+C
async fn cmd_run(config: PipelineConfig) -> Result<RunSummary> {
    let backend = Arc::new(ProcessBackend::new(&config.backend));
    let pipeline = Pipeline::new(config, backend).context("Failed to set up pipeline")?;

    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, finishing in-flight items before stopping");
            shutdown.trigger();
        }
    });

    let summary = pipeline.run().await.context("Pipeline run failed")?;

    println!();
    for stage in &summary.stages {
        println!(
            "{} {:<8} planned {:>3}  skipped {:>3}  done {:>3}  failed {:>3}",
            if stage.failed == 0 { "✅" } else { "🔴" },
            stage.stage.to_string(),
            stage.planned,
            stage.skipped,
            stage.completed,
            stage.failed
        );
        for (item, err) in &stage.failures {
            println!("   ✗ {}: {}", item, err);
        }
    }
    if summary.interrupted {
        println!("\n⚠️  Interrupted. Run again to resume.");
    } else if !summary.dry_run {
        println!("\n📄 {}", pipeline.layout().canonical_path().display());
    }

    Ok(summary)
}

/// Merge leftover shards into the canonical record
fn cmd_merge(config: &PipelineConfig) -> Result<()> {
    let layout = config.layout().context("Invalid model directory")?;
    let report = ShardMerger::new(&layout)
        .finalize(config.pipeline.shard_retention)
        .context("Merge failed")?;

    info!(
        shards = report.shards,
        rows = report.rows,
        written = report.written,
        "Merge complete"
    );
    println!(
        "✅ {} shard(s) merged, {} row(s) in {}",
        report.shards,
        report.rows,
        layout.canonical_path().display()
    );
    Ok(())
}

/// Write a default configuration file
fn cmd_init_config(output: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match output {
        Some(path) => path,
        None => PipelineConfig::default_path()?,
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    PipelineConfig::default()
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("✅ Configuration written to {}", path.display());
    println!("   Set pipeline.model_dir and pipeline.variants before running.");
    Ok(())
}
