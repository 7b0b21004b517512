use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use paf_core::config::ConfigStore;
use paf_core::health::HealthTracker;
use paf_core::server::ListenerSet;
use paf_core::{cli, logging};

#[derive(Parser, Debug)]
#[command(
    name = "paf",
    version,
    about = "paf: multi-tenant reverse proxy for Anthropic- and OpenAI-compatible LLM APIs"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the dashboard listener and both family proxy listeners (default).
    Run {
        /// Data directory holding `system.json`, `anthropic.json`, `openai.json`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Config file management.
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write default per-family and system config files if absent.
    Init {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Load and validate both family configs and the system config, without
    /// starting any listener.
    Check {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    match args.command {
        Some(Command::Config { cmd }) => match cmd {
            ConfigCommand::Init { data_dir } => {
                cli::init(data_dir.unwrap_or_else(cli::default_data_dir))
            }
            ConfigCommand::Check { data_dir } => {
                cli::check(data_dir.unwrap_or_else(cli::default_data_dir))
            }
        },
        Some(Command::Run { data_dir }) => run(data_dir),
        None => run(None),
    }
}

fn run(data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    logging::init_logging();

    let data_dir = data_dir.unwrap_or_else(cli::default_data_dir);
    let config = Arc::new(ConfigStore::open_for_server(&data_dir)?);
    let health = Arc::new(HealthTracker::new());

    let listeners = ListenerSet::build(config, health)?;
    listeners.run_forever();
}
