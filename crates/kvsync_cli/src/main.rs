//! KvSync CLI
//!
//! Command-line tools for exercising the KvSync engine.
//!
//! # Commands
//!
//! - `simulate` - Run one sync across simulated devices and report the result
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use commands::simulate::{CliMode, SimulateOptions, StoreKind};
use tracing_subscriber::EnvFilter;

/// KvSync command-line tools.
#[derive(Parser)]
#[command(name = "kvsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync one device with simulated peers over an in-process network
    Simulate {
        /// Number of peer devices
        #[arg(short, long, default_value = "2")]
        peers: usize,

        /// Sync mode requested by the local device
        #[arg(short, long, value_enum, default_value = "push-and-pull")]
        mode: CliMode,

        /// Storage flavour of every device
        #[arg(short, long, value_enum, default_value = "single")]
        store: StoreKind,

        /// Peers to take offline before syncing (e.g. peer-1)
        #[arg(long)]
        offline: Vec<String>,

        /// Peers that never receive messages
        #[arg(long)]
        unreachable: Vec<String>,

        /// Step timeout in milliseconds
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,

        /// Retries per step
        #[arg(long, default_value = "3")]
        retries: u32,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            peers,
            mode,
            store,
            offline,
            unreachable,
            timeout_ms,
            retries,
            format,
        } => {
            let options = SimulateOptions {
                peers,
                mode,
                store,
                offline,
                unreachable,
                timeout_ms,
                retries,
            };
            commands::simulate::run(&options, &format)?;
        }
        Commands::Version => {
            println!("KvSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
