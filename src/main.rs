use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use swarmtrade_coordinator::{config::ENV_PREFIX, telemetry, CoordinatorConfig};
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(name = "swarmtrade-coordinator", version, about = "Paid piece exchange coordinator tooling")]
struct Args {
    /// TOML config file, layered over the defaults
    #[arg(long, env = "SWARMTRADE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Load and validate the configuration, then print it as JSON
    Check,
    /// Print the default configuration as TOML
    DefaultConfig,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::DefaultConfig = args.command {
        let rendered = CoordinatorConfig::default()
            .to_toml()
            .context("rendering default config")?;
        print!("{rendered}");
        return Ok(());
    }

    let mut config = CoordinatorConfig::load(args.config.as_deref()).with_context(|| {
        format!(
            "loading config (file {:?}, env prefix {ENV_PREFIX}__)",
            args.config
        )
    })?;
    if args.json_logs {
        config.log.json = true;
    }

    telemetry::init(&config.log).context("initialising logging")?;

    config.validate().context("invalid configuration")?;
    info!(interaction = ?config.interaction, "configuration ok");

    let json = serde_json::to_string_pretty(&config).context("serialising config")?;
    println!("{json}");
    Ok(())
}
