//! Switchboard CLI - run and configure the messaging gateway.

mod commands;
mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use switchboard_core::config::{GlobalSettings, LogFormat};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Switchboard - multi-tenant messaging gateway")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.switchboard/switchboard.json)
    #[arg(short, long, global = true, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until Ctrl+C
    Serve {
        /// Override gateway.port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Validate the config file
    Check,
    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(settings: &GlobalSettings, verbose: bool) {
    let filter = if verbose || settings.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match settings.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = commands::config::config_path(cli.config);

    match cli.command {
        Commands::Serve { port } => {
            let config = if path.exists() {
                switchboard_core::Config::load(&path)?
            } else {
                ui::warning(&format!(
                    "{} not found, using defaults",
                    path.display()
                ));
                ui::info("Run 'switchboard config init' to create one");
                switchboard_core::Config::default()
            };
            init_logging(&config.settings, cli.verbose);
            commands::run_serve(config, port).await?;
        }

        Commands::Config { action } => {
            init_logging(&GlobalSettings::default(), cli.verbose);
            match action {
                ConfigCommands::Check => {
                    if let Err(e) = commands::run_check(&path) {
                        ui::error(&format!("{e:#}"));
                        std::process::exit(1);
                    }
                }
                ConfigCommands::Init { force } => commands::run_init(&path, force)?,
            }
        }
    }

    Ok(())
}
