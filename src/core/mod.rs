//! Chain primitives and the chain service seam
//!
//! - Headers and blocks as exchanged with peers
//! - The `Blockchainer` trait consumed by the network server
//! - `MemoryChain`, an in-memory header-first chain

pub mod block;
pub mod blockchain;

pub use block::{Block, Header, GENESIS_TIMESTAMP};
pub use blockchain::{Blockchainer, ChainError, MemoryChain, MAX_BLOCK_CACHE};
