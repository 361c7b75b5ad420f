//! Chain-P2P node CLI
//!
//! Runs a network node or prints its effective configuration.

use chain_p2p::cli::{self, CliResult, StartOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chain-p2p")]
#[command(author = "Darshan")]
#[command(version)]
#[command(about = "P2P core of a blockchain full node", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Print the effective configuration
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(clap::Args)]
struct Overrides {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Seed peers (comma-separated host:port)
    #[arg(short, long)]
    seeds: Option<String>,

    /// Network: mainnet, testnet, privnet or a magic number
    #[arg(short, long)]
    net: Option<String>,

    /// Protocol tick interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Number of peers to keep connected
    #[arg(long)]
    min_peers: Option<usize>,
}

impl From<Overrides> for StartOptions {
    fn from(o: Overrides) -> Self {
        StartOptions {
            port: o.port,
            seeds: o.seeds,
            net: o.net,
            tick_ms: o.tick_ms,
            min_peers: o.min_peers,
        }
    }
}

fn main() -> CliResult<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { overrides } => {
            let config = cli::build_config(cli.config.as_deref(), &overrides.into())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_start(config))?;
        }

        Commands::Config { overrides } => {
            let config = cli::build_config(cli.config.as_deref(), &overrides.into())?;
            cli::cmd_config(&config)?;
        }
    }

    Ok(())
}
