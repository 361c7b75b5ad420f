//! Cryptographic utilities
//!
//! SHA-256 hashing and the `Uint256` hash type.

pub mod hash;

pub use hash::{double_sha256, sha256, HashError, Uint256};
