//! Chain-P2P: the peer-to-peer core of a blockchain full node
//!
//! This crate provides:
//! - A network server that registers peers, runs the version/verack
//!   handshake and dispatches inbound messages
//! - Per-peer synchronization of headers, blocks and peer addresses
//! - Address discovery with good/bad bookkeeping
//! - A TCP transport with a framed JSON wire format
//! - An in-memory header-first chain to sync into
//!
//! # Example
//!
//! ```rust,no_run
//! use chain_p2p::network::{Server, ServerConfig};
//!
//! # async fn run() {
//! let config = ServerConfig {
//!     seeds: vec!["127.0.0.1:20334".to_string()],
//!     ..ServerConfig::default()
//! };
//! let server = Server::with_memory_chain(config);
//! println!("Node id: {}", server.id());
//! server.start().await.unwrap();
//! # }
//! ```

pub mod cli;
pub mod core;
pub mod crypto;
pub mod network;

// Re-export commonly used types
pub use core::{Block, Blockchainer, ChainError, Header, MemoryChain};
pub use crypto::Uint256;
pub use network::{Peer, PeerError, Server, ServerConfig, ServerError};
