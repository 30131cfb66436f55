//! deribit-link - keep one authenticated Deribit WebSocket session alive
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Keep an authenticated Deribit WebSocket session alive and stream its events
#[derive(Parser, Debug)]
#[command(name = "dlink")]
#[command(about = "Authenticated Deribit WebSocket session", long_about = None)]
struct Args {
    /// Path to config.toml (default: .dlink/config.toml in the working directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the session and print every event as NDJSON
    Run {
        /// Extra channel to subscribe (repeatable)
        #[arg(long = "channel", short = 'c', value_name = "CHANNEL")]
        channels: Vec<String>,

        /// Write a default .dlink/config.toml and exit
        #[arg(long)]
        init: bool,
    },

    /// List instruments over REST and exit
    Instruments {
        #[arg(long, default_value = "BTC")]
        currency: String,

        /// Instrument kind filter (future, option, spot, ...)
        #[arg(long)]
        kind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    // Logs go to a file; stdout carries the NDJSON stream.
    dlink_core::logging::init()?;

    let args = Args::parse();
    match args.command {
        Command::Run { init: true, .. } => {
            let cwd = std::env::current_dir()?;
            dlink_app::config::init_config_dir(&cwd)?;
            eprintln!("Config written to {}", cwd.join(".dlink").display());
        }
        Command::Run { channels, .. } => {
            deribit_link::run_headless(args.config.as_deref(), channels).await?;
        }
        Command::Instruments { currency, kind } => {
            deribit_link::run_instruments(args.config.as_deref(), &currency, kind.as_deref())
                .await?;
        }
    }

    Ok(())
}
