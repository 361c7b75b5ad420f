//! Peer abstraction
//!
//! A `Peer` is a handle to one remote connection. The server only ever
//! talks to peers through this trait; the TCP transport and the test
//! mocks provide implementations.

use crate::core::ChainError;
use crate::network::message::Message;
use crate::network::payload::Version;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Reasons a peer connection fails or is dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("port mismatch")]
    PortMismatch,
    #[error("identical node id")]
    IdenticalId,
    #[error("invalid handshake")]
    InvalidHandshake,
    #[error("invalid network")]
    InvalidNetwork,
    #[error("server shutdown")]
    ServerShutdown,
    #[error("invalid inventory type")]
    InvalidInvType,
    #[error("chain rejected data: {0}")]
    Chain(#[from] ChainError),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("peer disconnected")]
    Disconnected,
    #[error("replaced by a newer connection")]
    Replaced,
}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        PeerError::IoError(e.to_string())
    }
}

/// A handle to one remote node
#[async_trait]
pub trait Peer: Send + Sync {
    /// Remote address as observed on the connection
    fn endpoint(&self) -> SocketAddr;

    /// Version announced by the peer, `None` until its handshake is accepted
    async fn version(&self) -> Option<Version>;

    async fn set_version(&self, version: Version);

    async fn send(&self, msg: Message) -> Result<(), PeerError>;

    /// Close the connection. Only the first reason is kept.
    fn disconnect(&self, reason: PeerError);

    /// Resolves with the disconnect reason once the peer has terminated
    async fn done(&self) -> PeerError;
}

/// A peer removal request sent to the server loop
#[derive(Clone)]
pub struct PeerDrop {
    pub peer: Arc<dyn Peer>,
    pub reason: PeerError,
}

impl PeerDrop {
    pub fn new(peer: Arc<dyn Peer>, reason: PeerError) -> Self {
        Self { peer, reason }
    }
}

/// One-shot termination signal shared by peer implementations
#[derive(Debug)]
pub struct DoneSignal {
    tx: watch::Sender<Option<PeerError>>,
}

impl DoneSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Record `reason` if nothing was recorded yet; true on the first call
    pub fn fire(&self, reason: PeerError) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn reason(&self) -> Option<PeerError> {
        self.tx.borrow().clone()
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub async fn wait(&self) -> PeerError {
        let mut rx = self.tx.subscribe();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or(PeerError::Disconnected),
            Err(_) => PeerError::Disconnected,
        };
        reason
    }
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}
