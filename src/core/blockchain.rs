//! Chain service consumed by the networking core
//!
//! `Blockchainer` is the seam between the network server and whatever
//! stores headers and blocks. `MemoryChain` is an in-memory implementation
//! with header-first height bookkeeping: headers extend the header chain,
//! blocks are cached on arrival and persisted strictly in header order.

use crate::core::block::{Block, Header};
use crate::crypto::Uint256;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Upper bound on blocks held ahead of the persisted tip
pub const MAX_BLOCK_CACHE: usize = 2000;

/// Blockchain-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Invalid header {hash}: {reason}")]
    InvalidHeader { hash: Uint256, reason: String },
    #[error("Header out of order: expected index {expected}, got {got}")]
    HeaderOutOfOrder { expected: u32, got: u32 },
    #[error("Invalid block {hash}: {reason}")]
    InvalidBlock { hash: Uint256, reason: String },
    #[error("Block cache full ({0} blocks)")]
    CacheFull(usize),
}

/// Authoritative header/block store
#[async_trait]
pub trait Blockchainer: Send + Sync {
    /// Height of the highest persisted block
    async fn block_height(&self) -> u32;

    /// Height of the highest known header
    async fn header_height(&self) -> u32;

    /// Hash of the highest known header
    async fn current_header_hash(&self) -> Uint256;

    /// Hash of the highest persisted block
    async fn current_block_hash(&self) -> Uint256;

    /// Header hash at `index`, if that header is known
    async fn get_header_hash(&self, index: u32) -> Option<Uint256>;

    async fn get_header(&self, hash: &Uint256) -> Option<Header>;

    async fn get_block(&self, hash: &Uint256) -> Option<Block>;

    async fn has_block(&self, hash: &Uint256) -> bool;

    async fn add_block(&self, block: Block) -> Result<(), ChainError>;

    async fn add_headers(&self, headers: Vec<Header>) -> Result<(), ChainError>;
}

#[derive(Debug)]
struct ChainState {
    /// Header hashes by index
    header_list: Vec<Uint256>,
    headers: HashMap<Uint256, Header>,
    blocks: HashMap<Uint256, Block>,
    /// Blocks received but not yet connected to the persisted tip
    block_cache: HashMap<Uint256, Block>,
    block_height: u32,
}

impl ChainState {
    fn with_genesis(genesis: Block) -> Self {
        let hash = genesis.hash();
        let mut headers = HashMap::new();
        headers.insert(hash, genesis.header.clone());
        let mut blocks = HashMap::new();
        blocks.insert(hash, genesis);

        Self {
            header_list: vec![hash],
            headers,
            blocks,
            block_cache: HashMap::new(),
            block_height: 0,
        }
    }

    fn header_height(&self) -> u32 {
        self.header_list.len() as u32 - 1
    }

    fn current_header_hash(&self) -> Uint256 {
        self.header_list[self.header_list.len() - 1]
    }

    fn add_header(&mut self, header: Header) -> Result<(), ChainError> {
        let hash = header.hash();
        if self.headers.contains_key(&hash) {
            return Ok(());
        }

        let expected = self.header_list.len() as u32;
        if header.index != expected {
            return Err(ChainError::HeaderOutOfOrder {
                expected,
                got: header.index,
            });
        }
        if header.prev_hash != self.current_header_hash() {
            return Err(ChainError::InvalidHeader {
                hash,
                reason: format!("previous hash {} is not the tip", header.prev_hash),
            });
        }

        self.header_list.push(hash);
        self.headers.insert(hash, header);
        Ok(())
    }

    /// Move cached blocks onto the persisted chain while they connect
    fn persist(&mut self) -> usize {
        let mut persisted = 0;
        while let Some(next) = self.header_list.get(self.block_height as usize + 1).copied() {
            match self.block_cache.remove(&next) {
                Some(block) => {
                    self.blocks.insert(next, block);
                    self.block_height += 1;
                    persisted += 1;
                }
                None => break,
            }
        }
        persisted
    }
}

/// In-memory chain starting from the genesis block
pub struct MemoryChain {
    state: RwLock<ChainState>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::with_genesis(Block::genesis())
    }

    pub fn with_genesis(genesis: Block) -> Self {
        Self {
            state: RwLock::new(ChainState::with_genesis(genesis)),
        }
    }

    /// Number of blocks waiting for their predecessors
    pub async fn cached_blocks(&self) -> usize {
        self.state.read().await.block_cache.len()
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Blockchainer for MemoryChain {
    async fn block_height(&self) -> u32 {
        self.state.read().await.block_height
    }

    async fn header_height(&self) -> u32 {
        self.state.read().await.header_height()
    }

    async fn current_header_hash(&self) -> Uint256 {
        self.state.read().await.current_header_hash()
    }

    async fn current_block_hash(&self) -> Uint256 {
        let state = self.state.read().await;
        state.header_list[state.block_height as usize]
    }

    async fn get_header_hash(&self, index: u32) -> Option<Uint256> {
        self.state
            .read()
            .await
            .header_list
            .get(index as usize)
            .copied()
    }

    async fn get_header(&self, hash: &Uint256) -> Option<Header> {
        self.state.read().await.headers.get(hash).cloned()
    }

    async fn get_block(&self, hash: &Uint256) -> Option<Block> {
        self.state.read().await.blocks.get(hash).cloned()
    }

    async fn has_block(&self, hash: &Uint256) -> bool {
        let state = self.state.read().await;
        state.blocks.contains_key(hash) || state.block_cache.contains_key(hash)
    }

    async fn add_block(&self, block: Block) -> Result<(), ChainError> {
        let hash = block.hash();
        let mut state = self.state.write().await;

        if state.blocks.contains_key(&hash) || state.block_cache.contains_key(&hash) {
            return Ok(());
        }

        let index = block.index();
        let header_len = state.header_list.len() as u32;
        if index < header_len {
            if state.header_list[index as usize] != hash {
                return Err(ChainError::InvalidBlock {
                    hash,
                    reason: format!("does not match known header at index {}", index),
                });
            }
        } else if index == header_len {
            state.add_header(block.header.clone())?;
        } else if state.block_cache.len() >= MAX_BLOCK_CACHE {
            return Err(ChainError::CacheFull(MAX_BLOCK_CACHE));
        }

        state.block_cache.insert(hash, block);
        let persisted = state.persist();
        if persisted > 0 {
            log::debug!(
                "Persisted {} blocks, block height now {}",
                persisted,
                state.block_height
            );
        }
        Ok(())
    }

    async fn add_headers(&self, headers: Vec<Header>) -> Result<(), ChainError> {
        let mut state = self.state.write().await;
        let before = state.header_height();

        let mut result = Ok(());
        for header in headers {
            if let Err(e) = state.add_header(header) {
                result = Err(e);
                break;
            }
        }

        let after = state.header_height();
        if after > before {
            log::debug!("Header height {} -> {}", before, after);
            state.persist();
        }
        result
    }
}
