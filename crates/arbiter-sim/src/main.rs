use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gpu_arbiter::{Arbiter, ArbiterPrometheusMetrics, ArbiterSnapshot};

mod config;
mod workload;

use config::SimConfig;
use workload::{run_workload, SyntheticUsageSampler, WorkloadReport};

/// Drive the GPU arbiter with a synthetic speech translation workload
#[derive(Parser)]
#[command(name = "arbiter-sim")]
#[command(about = "Synthetic ASR/NMT/TTS workload driver for the GPU arbiter")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload and print a summary
    Run {
        /// Path to the configuration YAML file (defaults to the small example)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the workload duration in seconds
        #[arg(short, long)]
        duration_s: Option<f64>,

        /// Override the random seed
        #[arg(short, long)]
        seed: Option<u64>,

        /// Write the JSON summary to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also print the Prometheus exposition of the final state
        #[arg(long)]
        prometheus: bool,
    },

    /// Generate an example configuration file
    Generate {
        /// Type of example to generate (small, busy)
        #[arg(short, long, default_value = "small")]
        example_type: String,

        /// Output file path
        #[arg(short, long, default_value = "arbiter-sim.yaml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration YAML file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Serialize)]
struct RunSummary {
    report: WorkloadReport,
    resources: Vec<ArbiterSnapshot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.verbose, cli.json)?;

    match cli.command {
        Commands::Run {
            config,
            duration_s,
            seed,
            output,
            prometheus,
        } => run(config, duration_s, seed, output, prometheus).await,
        Commands::Generate { example_type, output } => generate_example(&example_type, output),
        Commands::Validate { config } => validate_config(config),
    }
}

fn init_tracing(log_level: &str, verbose: bool, json: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        match log_level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "info" => tracing::Level::INFO,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("arbiter_sim={},gpu_arbiter={}", level, level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    Ok(())
}

async fn run(
    config_path: Option<PathBuf>,
    duration_s: Option<f64>,
    seed: Option<u64>,
    output: Option<PathBuf>,
    prometheus: bool,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            SimConfig::from_yaml_file(path)?
        }
        None => SimConfig::default(),
    };
    if let Some(duration_s) = duration_s {
        config.workload.duration_s = duration_s;
    }
    if let Some(seed) = seed {
        config.workload.seed = seed;
    }
    config.validate()?;

    let sampler = Arc::new(SyntheticUsageSampler::new(
        config.workload.usage.clone(),
        config.workload.seed,
    ));
    let arbiter = Arbiter::new(config.arbiter.clone(), sampler)?;

    let report = run_workload(&arbiter, &config.workload).await?;
    let summary = RunSummary {
        report,
        resources: arbiter.snapshots(),
    };
    arbiter.shutdown();

    let json = serde_json::to_string_pretty(&summary)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)?;
            info!("Summary saved to {:?}", path);
        }
        None => println!("{}", json),
    }

    if prometheus {
        let metrics = ArbiterPrometheusMetrics::new()?;
        for snapshot in &summary.resources {
            metrics.update_from_snapshot(snapshot);
        }
        print!("{}", metrics.render()?);
    }

    Ok(())
}

fn generate_example(example_type: &str, output_path: PathBuf) -> Result<()> {
    info!("Generating {} example configuration", example_type);

    let config = match example_type {
        "small" => SimConfig::default(),
        "busy" => SimConfig::busy(),
        _ => {
            error!("Unknown example type: {}. Use 'small' or 'busy'", example_type);
            return Err(anyhow!("Unknown example type: {}", example_type));
        }
    };

    config.to_yaml_file(&output_path)?;
    info!("Example configuration saved to {:?}", output_path);
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {:?}", config_path);

    let config = SimConfig::from_yaml_file(&config_path)?;
    config.validate()?;

    info!("Configuration is valid!");
    info!("  - Resources: {:?}", config.arbiter.resource_keys);
    info!("  - Sessions: {}", config.workload.sessions);
    info!("  - Duration: {} seconds", config.workload.duration_s);
    info!(
        "  - Water marks: {}/{}",
        config.arbiter.gpu_usage.base_high_water, config.arbiter.gpu_usage.base_low_water
    );

    Ok(())
}
