//! Typed message payloads
//!
//! Each command that carries data has one struct here. The `Message`
//! envelope in `message.rs` ties a payload to its network magic.

use crate::core::Header;
use crate::crypto::Uint256;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Protocol version announced in our Version payload
pub const PROTOCOL_VERSION: u32 = 0;

/// Maximum number of headers a peer is expected to send per response
pub const MAX_HEADERS_ALLOWED: usize = 2000;

bitflags! {
    /// Services a node offers to its peers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        /// Serves full blocks and headers
        const NODE_NETWORK = 1;
    }
}

/// Handshake data announced by each side of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version: u32,
    pub services: ServiceFlags,
    /// Seconds since the unix epoch at the sender
    pub timestamp: u32,
    /// Port the sender listens on
    pub port: u16,
    /// Random identifier of the sending node
    pub nonce: u32,
    pub user_agent: String,
    /// Sender's block height at connection time
    pub start_height: u32,
    pub relay: bool,
}

impl Version {
    pub fn new(nonce: u32, port: u16, user_agent: String, start_height: u32, relay: bool) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK,
            timestamp: chrono::Utc::now().timestamp() as u32,
            port,
            nonce,
            user_agent,
            start_height,
            relay,
        }
    }
}

/// An ordered batch of headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    pub headers: Vec<Header>,
}

impl Headers {
    pub fn new(headers: Vec<Header>) -> Self {
        Self { headers }
    }
}

/// Kind of item an inventory refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryType(pub u8);

impl InventoryType {
    pub const TX: InventoryType = InventoryType(0x01);
    pub const BLOCK: InventoryType = InventoryType(0x02);
    pub const CONSENSUS: InventoryType = InventoryType(0xe0);

    /// Whether this is one of the recognized kinds
    pub fn is_valid(&self) -> bool {
        matches!(*self, Self::TX | Self::BLOCK | Self::CONSENSUS)
    }
}

/// Announcement or request of items by hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(rename = "type")]
    pub inv_type: InventoryType,
    pub hashes: Vec<Uint256>,
}

impl Inventory {
    pub fn new(inv_type: InventoryType, hashes: Vec<Uint256>) -> Self {
        Self { inv_type, hashes }
    }
}

/// Locator used by getheaders and getblocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocks {
    pub hash_start: Vec<Uint256>,
    /// `Uint256::ZERO` means "as many as the peer will give"
    pub hash_stop: Uint256,
}

impl GetBlocks {
    pub fn new(hash_start: Vec<Uint256>, hash_stop: Uint256) -> Self {
        Self {
            hash_start,
            hash_stop,
        }
    }
}

/// A peer address together with when it was last seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAndTime {
    pub timestamp: u32,
    pub services: ServiceFlags,
    pub endpoint: SocketAddr,
}

impl AddressAndTime {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp() as u32,
            services: ServiceFlags::NODE_NETWORK,
            endpoint,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressList {
    pub addrs: Vec<AddressAndTime>,
}

impl AddressList {
    pub fn new(addrs: Vec<AddressAndTime>) -> Self {
        Self { addrs }
    }
}
