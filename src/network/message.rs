//! Network message envelope
//!
//! A message is a network magic plus one payload from a closed set of
//! commands. The magic isolates incompatible networks and is checked before
//! any payload is looked at.

use crate::core::Block;
use crate::network::payload::{AddressList, GetBlocks, Headers, Inventory, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Magic of the main network
pub const MAGIC_MAINNET: u32 = 7_630_401;

/// Magic of the public test network
pub const MAGIC_TESTNET: u32 = 1_953_787_457;

/// Magic of a local private network
pub const MAGIC_PRIVNET: u32 = 56_753;

/// Maximum encoded payload size accepted from the wire
pub const MAX_MESSAGE_SIZE: usize = 0x0200_0000;

/// Payload-free command tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Version,
    Verack,
    GetAddr,
    Addr,
    GetHeaders,
    Headers,
    GetBlocks,
    Inv,
    GetData,
    Block,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Version => "version",
            CommandType::Verack => "verack",
            CommandType::GetAddr => "getaddr",
            CommandType::Addr => "addr",
            CommandType::GetHeaders => "getheaders",
            CommandType::Headers => "headers",
            CommandType::GetBlocks => "getblocks",
            CommandType::Inv => "inv",
            CommandType::GetData => "getdata",
            CommandType::Block => "block",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command together with its typed payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "lowercase")]
pub enum Payload {
    Version(Version),
    Verack,
    GetAddr,
    Addr(AddressList),
    GetHeaders(GetBlocks),
    Headers(Headers),
    GetBlocks(GetBlocks),
    Inv(Inventory),
    GetData(Inventory),
    Block(Block),
}

impl Payload {
    pub fn command_type(&self) -> CommandType {
        match self {
            Payload::Version(_) => CommandType::Version,
            Payload::Verack => CommandType::Verack,
            Payload::GetAddr => CommandType::GetAddr,
            Payload::Addr(_) => CommandType::Addr,
            Payload::GetHeaders(_) => CommandType::GetHeaders,
            Payload::Headers(_) => CommandType::Headers,
            Payload::GetBlocks(_) => CommandType::GetBlocks,
            Payload::Inv(_) => CommandType::Inv,
            Payload::GetData(_) => CommandType::GetData,
            Payload::Block(_) => CommandType::Block,
        }
    }
}

/// A protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub magic: u32,
    pub payload: Payload,
}

impl Message {
    pub fn new(magic: u32, payload: Payload) -> Self {
        Self { magic, payload }
    }

    pub fn command_type(&self) -> CommandType {
        self.payload.command_type()
    }

    /// Serialize the payload (command tag included) to bytes
    pub fn payload_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload)
    }

    /// Rebuild a message from its magic and encoded payload
    pub fn from_parts(magic: u32, data: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            magic,
            payload: serde_json::from_slice(data)?,
        })
    }
}
