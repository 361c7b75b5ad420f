//! CLI commands for the node
//!
//! Implements the command handlers for the CLI interface.

use crate::network::{parse_net, Server, ServerConfig};
use std::path::Path;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Command-line overrides for the server configuration
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub port: Option<u16>,
    /// Comma-separated host:port list
    pub seeds: Option<String>,
    /// Network name or magic number
    pub net: Option<String>,
    pub tick_ms: Option<u64>,
    pub min_peers: Option<usize>,
}

/// Load the config file if given, then apply the command-line overrides
pub fn build_config(path: Option<&Path>, opts: &StartOptions) -> CliResult<ServerConfig> {
    let mut config = match path {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    if let Some(port) = opts.port {
        config.listen_tcp = port;
    }
    if let Some(seeds) = &opts.seeds {
        config.seeds = seeds
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(net) = &opts.net {
        config.net = parse_net(net)?;
    }
    if let Some(ms) = opts.tick_ms {
        config.proto_tick_interval = Duration::from_millis(ms);
    }
    if let Some(min_peers) = opts.min_peers {
        config.min_peers = min_peers;
    }

    config.validate()?;
    Ok(config)
}

/// Run a node until Ctrl+C
pub async fn cmd_start(config: ServerConfig) -> CliResult<()> {
    println!(
        "🌐 Starting node on port {} (net {}, {} seeds)...",
        config.listen_tcp,
        config.net,
        config.seeds.len()
    );

    let server = Server::with_memory_chain(config);
    println!("   Node id: {}", server.id());

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n📴 Shutting down node...");
            shutdown.shutdown().await;
        }
    });

    server.start().await?;

    let bad = server.bad_peers().await;
    if !bad.is_empty() {
        println!("   Bad peers: {}", bad.join(", "));
    }
    println!("✅ Node stopped");
    Ok(())
}

/// Print the effective configuration as JSON
pub fn cmd_config(config: &ServerConfig) -> CliResult<()> {
    println!("{}", config.to_json()?);
    Ok(())
}
