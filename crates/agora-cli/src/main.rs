//! agora - run and inspect virtual-economy simulations
//!
//! `agora run` builds a world from an optional YAML config, starts the
//! agent loops, and writes the event stream as JSONL under the logs
//! directory. `agora validate-config` parses a config and prints the
//! effective settings without running anything.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use agora_audit::FileEventLog;
use agora_llm::DeterministicProvider;
use agora_sim::SimulationRunner;
use agora_world::{generate_run_id, World, WorldConfig};

#[derive(Parser)]
#[command(name = "agora")]
#[command(version)]
#[command(about = "Virtual-economy kernel: autonomous agents, scrip, and a mint", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation to completion and print the final state
    Run {
        /// YAML config file; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Run length in seconds (default from config)
        #[arg(short, long)]
        duration: Option<f64>,

        /// Directory for event and summary logs (default from config)
        #[arg(long)]
        logs_dir: Option<PathBuf>,

        /// Skip the final state summary on stdout
        #[arg(long)]
        quiet: bool,
    },

    /// Parse a config file and print the effective settings
    ValidateConfig {
        config: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<WorldConfig> {
    let Some(path) = path else {
        return Ok(WorldConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

async fn run(
    config: Option<PathBuf>,
    duration: Option<f64>,
    logs_dir: Option<PathBuf>,
    quiet: bool,
) -> Result<()> {
    let config = load_config(config.as_ref())?;
    let logs_dir = logs_dir.unwrap_or_else(|| PathBuf::from(&config.logging.logs_dir));
    let run_id = generate_run_id();
    let log = FileEventLog::create(&logs_dir, &run_id)
        .with_context(|| format!("creating event log in {}", logs_dir.display()))?;
    info!(run_id = %run_id, logs_dir = %logs_dir.display(), "starting run");

    let world = World::new(
        config,
        Arc::new(DeterministicProvider::new()),
        Box::new(log),
        run_id,
    );
    let runner = SimulationRunner::new(world);
    let duration = duration.map(Duration::from_secs_f64);
    runner.run(duration).await;

    if !quiet {
        let world = runner.world();
        let mut world = world.lock().await;
        let summary = world.state_summary(50);
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            duration,
            logs_dir,
            quiet,
        } => run(config, duration, logs_dir, quiet).await,
        Commands::ValidateConfig { config } => {
            let parsed = load_config(Some(&config))?;
            println!("{}", serde_yaml::to_string(&ConfigEcho::from(&parsed))?);
            Ok(())
        }
    }
}

/// Flattened view of the settings operators most often tune.
#[derive(serde::Serialize)]
struct ConfigEcho {
    principals: u32,
    id_prefix: String,
    starting_scrip: i64,
    starting_llm_budget: f64,
    duration_seconds: f64,
    mint_enabled: bool,
    minimum_bid: i64,
    default_model: String,
    logs_dir: String,
}

impl From<&WorldConfig> for ConfigEcho {
    fn from(config: &WorldConfig) -> Self {
        Self {
            principals: config.principals.count,
            id_prefix: config.principals.id_prefix.clone(),
            starting_scrip: config.principals.starting_scrip,
            starting_llm_budget: config.principals.starting_llm_budget,
            duration_seconds: config.simulation.default_duration_seconds,
            mint_enabled: config.mint.enabled,
            minimum_bid: config.mint.minimum_bid,
            default_model: config.llm.default_model.clone(),
            logs_dir: config.logging.logs_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_config_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.principals.count, 3);
    }

    #[test]
    fn yaml_config_overrides_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "principals:\n  count: 7\n  starting_scrip: 42\nmint:\n  enabled: false"
        )
        .unwrap();
        let path = file.path().to_path_buf();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.principals.count, 7);
        assert_eq!(config.principals.starting_scrip, 42);
        assert!(!config.mint.enabled);
        assert_eq!(config.principals.id_prefix, "alpha_");
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "principls:\n  count: 7").unwrap();
        let path = file.path().to_path_buf();
        assert!(load_config(Some(&path)).is_err());
    }
}
