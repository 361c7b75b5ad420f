//! Network server
//!
//! The server is the local node. A single event loop owns the peer
//! registry: registrations, drops and inbound messages all reach it over
//! channels and are applied one at a time. Other tasks only read the
//! registry through `peer_count` and `peers`.

use crate::core::{Blockchainer, MemoryChain};
use crate::network::config::ServerConfig;
use crate::network::discovery::{DefaultDiscovery, Discoverer};
use crate::network::handshake::HandshakeState;
use crate::network::message::{CommandType, Message};
use crate::network::peer::{Peer, PeerDrop, PeerError};
use crate::network::transport::{TcpTransport, Transporter};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Inbound messages buffered between the transport and the event loop
pub const INBOX_CAPACITY: usize = 100;

/// Server lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("Server already started")]
    AlreadyStarted,
}

/// A message together with the peer it came from
pub struct ProtoTuple {
    pub msg: Message,
    pub peer: Arc<dyn Peer>,
}

/// Sending side of the server's channels, handed to transports
#[derive(Clone)]
pub struct ServerHandle {
    register: mpsc::Sender<Arc<dyn Peer>>,
    unregister: mpsc::Sender<PeerDrop>,
    proto: mpsc::Sender<ProtoTuple>,
}

impl ServerHandle {
    /// Announce a new connection; fails once the server has stopped
    pub async fn register(&self, peer: Arc<dyn Peer>) -> Result<(), PeerError> {
        self.register
            .send(peer)
            .await
            .map_err(|_| PeerError::ServerShutdown)
    }

    /// Ask the server to drop a peer; removing an unknown peer is a no-op
    pub async fn unregister(&self, drop: PeerDrop) {
        if self.unregister.send(drop).await.is_err() {
            log::debug!("Server stopped, ignoring peer drop");
        }
    }

    /// Deliver an inbound message; waits while the inbox is full
    pub async fn deliver(&self, msg: Message, peer: Arc<dyn Peer>) -> Result<(), PeerError> {
        self.proto
            .send(ProtoTuple { msg, peer })
            .await
            .map_err(|_| PeerError::ServerShutdown)
    }
}

/// Receiving side of the server's channels, consumed by the event loop
pub struct Inbox {
    pub(crate) register: mpsc::Receiver<Arc<dyn Peer>>,
    pub(crate) unregister: mpsc::Receiver<PeerDrop>,
    pub(crate) proto: mpsc::Receiver<ProtoTuple>,
}

/// Create the server channels
pub fn channels() -> (ServerHandle, Inbox) {
    let (register_tx, register_rx) = mpsc::channel(1);
    let (unregister_tx, unregister_rx) = mpsc::channel(1);
    let (proto_tx, proto_rx) = mpsc::channel(INBOX_CAPACITY);

    (
        ServerHandle {
            register: register_tx,
            unregister: unregister_tx,
            proto: proto_tx,
        },
        Inbox {
            register: register_rx,
            unregister: unregister_rx,
            proto: proto_rx,
        },
    )
}

/// A registered peer and how far its handshake got
pub(crate) struct PeerEntry {
    pub(crate) peer: Arc<dyn Peer>,
    pub(crate) state: HandshakeState,
}

/// Compare peer handles by identity
pub(crate) fn same_peer(a: &Arc<dyn Peer>, b: &Arc<dyn Peer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// The local node in the network
pub struct Server {
    pub(crate) config: ServerConfig,
    /// Nonce announced in our Version
    id: u32,
    pub(crate) transport: Arc<dyn Transporter>,
    pub(crate) discovery: Arc<dyn Discoverer>,
    pub(crate) chain: Arc<dyn Blockchainer>,
    pub(crate) peers: RwLock<HashMap<SocketAddr, PeerEntry>>,
    pub(crate) handle: ServerHandle,
    inbox: Mutex<Option<Inbox>>,
    quit: CancellationToken,
}

impl Server {
    /// Create a server with the TCP transport and default discovery
    pub fn new(config: ServerConfig, chain: Arc<dyn Blockchainer>) -> Arc<Self> {
        let (handle, inbox) = channels();
        let transport: Arc<dyn Transporter> =
            Arc::new(TcpTransport::new(handle.clone(), config.listen_tcp));
        let discovery: Arc<dyn Discoverer> =
            Arc::new(DefaultDiscovery::new(config.dial_timeout, transport.clone()));

        Self::from_parts(config, chain, transport, discovery, handle, inbox)
    }

    /// Create a server with an in-memory chain
    pub fn with_memory_chain(config: ServerConfig) -> Arc<Self> {
        Self::new(config, Arc::new(MemoryChain::new()))
    }

    /// Assemble a server from its collaborators. `handle` and `inbox` must
    /// come from the same `channels()` call the transport was given.
    pub fn from_parts(
        config: ServerConfig,
        chain: Arc<dyn Blockchainer>,
        transport: Arc<dyn Transporter>,
        discovery: Arc<dyn Discoverer>,
        handle: ServerHandle,
        inbox: Inbox,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            id: rand::thread_rng().gen_range(1_000_000..=9_999_999),
            transport,
            discovery,
            chain,
            peers: RwLock::new(HashMap::new()),
            handle,
            inbox: Mutex::new(Some(inbox)),
            quit: CancellationToken::new(),
        })
    }

    /// The server's nonce
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Channel handle for feeding connections and messages to the server
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Start the transport and run the event loop until shutdown
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        let inbox = self
            .inbox
            .lock()
            .await
            .take()
            .ok_or(ServerError::AlreadyStarted)?;

        log::info!(
            "Node started: id={} block_height={} header_height={}",
            self.id,
            self.chain.block_height().await,
            self.chain.header_height().await
        );

        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.accept().await {
                log::error!("Transport stopped: {}", e);
            }
        });

        self.discovery.backfill(&self.config.seeds).await;
        self.run(inbox).await;
        Ok(())
    }

    /// Disconnect all peers and stop the event loop
    pub async fn shutdown(&self) {
        log::info!("Shutting down server, peers: {}", self.peer_count().await);
        self.discovery.close().await;
        self.quit.cancel();
    }

    /// Addresses discovery knows about but is not connected to
    pub async fn unconnected_peers(&self) -> Vec<String> {
        self.discovery.unconnected_peers().await
    }

    /// Addresses discovery has classed as bad
    pub async fn bad_peers(&self) -> Vec<String> {
        self.discovery.bad_peers().await
    }

    /// Number of currently registered peers
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Snapshot of the registered peers
    pub async fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.peers
            .read()
            .await
            .values()
            .map(|entry| entry.peer.clone())
            .collect()
    }

    /// Handshake state of the peer registered at `endpoint`
    pub async fn handshake_state(&self, endpoint: &SocketAddr) -> Option<HandshakeState> {
        self.peers.read().await.get(endpoint).map(|entry| entry.state)
    }

    async fn run(self: &Arc<Self>, mut inbox: Inbox) {
        // Fill up the minimum peer slots
        let missing = self
            .config
            .min_peers
            .saturating_sub(self.peer_count().await);
        self.discovery.request_remote(missing).await;

        loop {
            tokio::select! {
                biased;

                _ = self.quit.cancelled() => {
                    self.transport.close();
                    let mut peers = self.peers.write().await;
                    for entry in peers.values() {
                        entry.peer.disconnect(PeerError::ServerShutdown);
                    }
                    log::info!("Disconnected {} peers", peers.len());
                    peers.clear();
                    return;
                }
                Some(peer) = inbox.register.recv() => {
                    self.register_peer(peer).await;
                }
                Some(drop) = inbox.unregister.recv() => {
                    self.unregister_peer(drop).await;
                }
                Some(proto) = inbox.proto.recv() => {
                    self.handle_proto(proto).await;
                }
            }
        }
    }

    async fn register_peer(&self, peer: Arc<dyn Peer>) {
        let endpoint = peer.endpoint();

        // We send out our version immediately
        if let Err(e) = self.send_version(&peer).await {
            log::warn!("Failed to send version to {}: {}", endpoint, e);
        }

        let displaced = self.peers.write().await.insert(
            endpoint,
            PeerEntry {
                peer: peer.clone(),
                state: HandshakeState::VersionSent,
            },
        );
        if let Some(old) = displaced {
            if !same_peer(&old.peer, &peer) {
                log::info!("Replacing earlier connection from {}", endpoint);
                old.peer.disconnect(PeerError::Replaced);
            }
        }
        log::info!("New peer connected: {}", endpoint);
    }

    /// Remove a peer from the registry. Idempotent.
    pub(crate) async fn unregister_peer(&self, drop: PeerDrop) {
        let endpoint = drop.peer.endpoint();
        let removed = {
            let mut peers = self.peers.write().await;
            match peers.get(&endpoint) {
                Some(entry) if same_peer(&entry.peer, &drop.peer) => peers.remove(&endpoint),
                _ => None,
            }
        };

        if removed.is_none() {
            log::debug!("Peer {} already removed", endpoint);
            return;
        }

        self.discovery
            .register_bad_addr(&endpoint.to_string())
            .await;
        let peer_count = self.peer_count().await;
        log::warn!(
            "Peer disconnected: {} reason={} peer_count={}",
            endpoint,
            drop.reason,
            peer_count
        );

        if !self.quit.is_cancelled() {
            let missing = self.config.min_peers.saturating_sub(peer_count);
            if missing > 0 {
                self.discovery.request_remote(missing).await;
            }
        }
    }

    async fn handle_proto(self: &Arc<Self>, proto: ProtoTuple) {
        let ProtoTuple { msg, peer } = proto;
        let command = msg.command_type();

        if let Err(err) = self.process_proto(&peer, msg).await {
            log::warn!(
                "Failed handling {} from {}: {}",
                command,
                peer.endpoint(),
                err
            );
            peer.disconnect(err.clone());

            // Peers failing the handshake have no protocol task that would
            // report their termination, so drop them here
            if matches!(command, CommandType::Version | CommandType::Verack) {
                self.unregister_peer(PeerDrop::new(peer, err)).await;
            }
        }
    }
}
