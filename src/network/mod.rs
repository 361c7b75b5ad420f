//! P2P Networking module
//!
//! The server side of the node's peer-to-peer protocol.
//!
//! # Features
//! - Single event loop owning the peer registry
//! - Version/verack handshake with port and nonce checks
//! - Header-first synchronization with batched block requests
//! - Address exchange feeding peer discovery
//! - TCP transport with length-prefixed JSON framing

pub mod config;
pub mod discovery;
mod dispatch;
pub mod handshake;
pub mod message;
pub mod payload;
pub mod peer;
pub mod server;
pub mod sync;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{parse_net, ConfigError, ServerConfig, DEFAULT_MIN_PEERS};
pub use discovery::{AddressPools, DefaultDiscovery, Discoverer, BAD_ADDR_RETRY, MAX_POOL_SIZE};
pub use dispatch::MAX_ADDR_RESPONSE;
pub use handshake::{validate_version, HandshakeState};
pub use message::{
    CommandType, Message, Payload, MAGIC_MAINNET, MAGIC_PRIVNET, MAGIC_TESTNET, MAX_MESSAGE_SIZE,
};
pub use payload::{
    AddressAndTime, AddressList, GetBlocks, Headers, Inventory, InventoryType, ServiceFlags,
    Version, MAX_HEADERS_ALLOWED, PROTOCOL_VERSION,
};
pub use peer::{DoneSignal, Peer, PeerDrop, PeerError};
pub use server::{channels, Inbox, ProtoTuple, Server, ServerError, ServerHandle, INBOX_CAPACITY};
pub use sync::{block_request_range, MAX_BLOCK_BATCH, MIN_POOL_COUNT};
pub use transport::{MessageCodec, TcpPeer, TcpTransport, Transporter};
