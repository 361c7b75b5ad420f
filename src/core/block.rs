//! Header and block types exchanged with peers
//!
//! Headers travel on their own during header-first sync; full blocks are
//! fetched afterwards by hash.

use crate::crypto::{double_sha256, Uint256};
use serde::{Deserialize, Serialize};

/// Fixed timestamp of the genesis header so every node derives the same hash
pub const GENESIS_TIMESTAMP: u32 = 1_468_595_301;

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header version
    pub version: u32,
    /// Hash of the previous header
    pub prev_hash: Uint256,
    /// Merkle root of the block's transactions
    pub merkle_root: Uint256,
    /// Creation time, seconds since the unix epoch
    pub timestamp: u32,
    /// Height of this header in the chain
    pub index: u32,
    /// Opaque consensus nonce
    pub consensus_data: u64,
}

impl Header {
    /// The deterministic genesis header
    pub fn genesis() -> Self {
        Self {
            version: 0,
            prev_hash: Uint256::ZERO,
            merkle_root: Uint256::ZERO,
            timestamp: GENESIS_TIMESTAMP,
            index: 0,
            consensus_data: 2_083_236_893,
        }
    }

    /// Build the header following `parent`
    pub fn child_of(parent: &Header, merkle_root: Uint256, timestamp: u32) -> Self {
        Self {
            version: parent.version,
            prev_hash: parent.hash(),
            merkle_root,
            timestamp,
            index: parent.index + 1,
            consensus_data: 0,
        }
    }

    /// Double SHA-256 over the little-endian field layout
    pub fn hash(&self) -> Uint256 {
        let mut data = Vec::with_capacity(4 + 32 + 32 + 4 + 4 + 8);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.index.to_le_bytes());
        data.extend_from_slice(&self.consensus_data.to_le_bytes());
        double_sha256(&data)
    }
}

/// A full block: header plus the hashes of its transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Uint256>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Uint256>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// The genesis block
    pub fn genesis() -> Self {
        Self::new(Header::genesis(), Vec::new())
    }

    /// Block hash, identical to its header hash
    pub fn hash(&self) -> Uint256 {
        self.header.hash()
    }

    pub fn index(&self) -> u32 {
        self.header.index
    }
}
