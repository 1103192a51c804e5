mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rhythm_core::Settings;
use std::path::PathBuf;

use commands::simulate::SimulateOptions;

#[derive(Parser)]
#[command(name = "rhythm")]
#[command(about = "Cadence training sessions with a paired companion", long_about = None)]
struct Cli {
    /// Config file (defaults to config.toml in the data directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one session with the wrist engine and companion in this process
    Simulate {
        /// Companion is out of range until the session ends
        #[arg(long)]
        offline: bool,
        /// Wearer does not move
        #[arg(long)]
        still: bool,
        /// Device has no accelerometer
        #[arg(long)]
        no_sensor: bool,
        /// Override the configured number of reps
        #[arg(short, long)]
        reps: Option<u32>,
    },
    /// Run the wrist-side agent, starting sessions on request
    Watch {
        /// Start a session right away instead of waiting for a request
        #[arg(long)]
        now: bool,
        /// Simulate a wearer who does not move
        #[arg(long)]
        still: bool,
    },
    /// Run the companion receiver and print session results
    Companion {
        /// Ask the wrist agent to start a session
        #[arg(long)]
        start: bool,
    },
    /// Send one start request to the wrist agent
    StartRemote,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Simulate {
            offline,
            still,
            no_sensor,
            reps,
        } => {
            let settings = Settings::load(config_path)?;
            let options = SimulateOptions {
                offline,
                still,
                no_sensor,
                reps,
            };
            commands::simulate::run(&settings, options).await
        }
        Commands::Watch { now, still } => {
            let settings = Settings::load(config_path)?;
            commands::watch::run(&settings, now, still).await
        }
        Commands::Companion { start } => {
            let settings = Settings::load(config_path)?;
            commands::companion::run(&settings, start).await
        }
        Commands::StartRemote => {
            let settings = Settings::load(config_path)?;
            commands::companion::send_start_request(&settings).await
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config::show(&Settings::load(config_path)?),
            ConfigAction::Path => commands::config::path(config_path),
            ConfigAction::Init { force } => commands::config::init(config_path, force),
        },
    }
}
