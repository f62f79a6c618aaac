//! Keel Node - runs Keel validators.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keel_consensus::generate_devnet_genesis;
use keel_node::logging::{init_logging, LogFormat};
use keel_node::{load_genesis, run_devnet, NodeConfig};
use keel_types::Height;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Keel Node - BFT consensus validators
#[derive(Parser, Debug)]
#[command(name = "keel-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a devnet genesis document
    Genesis {
        /// Number of validators
        #[arg(long)]
        validators: Option<usize>,

        /// Output file (.json, .yaml or .yml)
        #[arg(short, long, default_value = "genesis.yaml")]
        output: PathBuf,
    },
    /// Run validators in-process until they decide the target height
    Devnet {
        /// Number of validators in a generated genesis
        #[arg(long)]
        validators: Option<usize>,

        /// Height to decide
        #[arg(long)]
        height: Option<Height>,

        /// Validator index kept offline until the others reach the height
        #[arg(long)]
        offline: Option<usize>,

        /// Genesis document to run instead of a generated one
        #[arg(long)]
        genesis: Option<PathBuf>,

        /// Data directory for the write-ahead logs
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Print metrics when done
        #[arg(long)]
        metrics: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = NodeConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if args.json {
        config.log_format = "json".into();
    }
    init_logging(&config.log_level, LogFormat::parse(&config.log_format));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting keel node");

    match args.command {
        Command::Genesis { validators, output } => {
            let count = validators.unwrap_or(config.validators);
            write_genesis(count, &output)?;
            tracing::info!(validators = count, path = %output.display(), "wrote genesis");
        }
        Command::Devnet {
            validators,
            height,
            offline,
            genesis,
            data_dir,
            metrics,
        } => {
            if let Some(validators) = validators {
                config.validators = validators;
            }
            if let Some(height) = height {
                config.target_height = height;
            }
            if offline.is_some() {
                config.offline_validator = offline;
            }
            if genesis.is_some() {
                config.genesis = genesis;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            config.print_metrics |= metrics;
            config.validate()?;
            devnet(config).await?;
        }
        Command::Config => print!("{}", config.to_yaml()?),
    }
    Ok(())
}

async fn devnet(config: NodeConfig) -> Result<()> {
    let genesis = load_genesis(&config)?;
    let report = tokio::select! {
        report = run_devnet(&config, genesis) => report?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted");
            return Ok(());
        }
    };

    tracing::info!(
        chain_id = %report.chain_id,
        height = report.height(),
        transactions = report.transactions,
        evidence = report.evidence,
        "devnet finished, all nodes agree"
    );
    for (index, block_id) in report.blocks.iter().enumerate() {
        println!("{:>6}  {}", index + 1, block_id.to_hex());
    }
    if config.print_metrics {
        print!("{}", report.metrics);
    }
    Ok(())
}

fn write_genesis(validators: usize, path: &Path) -> Result<()> {
    let genesis_time_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?
        .as_millis() as u64;
    let genesis = generate_devnet_genesis(validators, genesis_time_ms);
    genesis.validate()?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => genesis.save_json(path)?,
        _ => genesis.save_yaml(path)?,
    }
    Ok(())
}
