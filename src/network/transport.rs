//! TCP transport and connection handling
//!
//! Accepts inbound connections, dials outbound ones, frames messages on the
//! wire and hands every connection to the server as a `Peer`.

use crate::network::message::{Message, MAX_MESSAGE_SIZE};
use crate::network::payload::Version;
use crate::network::peer::{DoneSignal, Peer, PeerDrop, PeerError};
use crate::network::server::ServerHandle;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;

/// Messages queued for one peer's writer task
const OUTBOUND_QUEUE: usize = 100;

/// Frame header: magic (4) + length (4)
const FRAME_HEADER_LEN: usize = 8;

/// Connection service consumed by the server and discovery
#[async_trait]
pub trait Transporter: Send + Sync {
    /// Run the accept loop until `close` is called
    async fn accept(&self) -> Result<(), PeerError>;

    /// Connect to `addr` and register the new peer with the server
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<(), PeerError>;

    /// Stop accepting connections
    fn close(&self);
}

/// Message codec: big-endian magic, big-endian length, JSON payload
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item
            .payload_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("message too large: {} bytes", data.len()),
            ));
        }

        dst.reserve(FRAME_HEADER_LEN + data.len());
        dst.put_u32(item.magic);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let magic = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("message too large: {} bytes", len),
            ));
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let data = src.split_to(len);

        // The magic is not checked here; the server rejects foreign networks
        let msg = Message::from_parts(magic, &data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(Some(msg))
    }
}

/// A peer reached over TCP
pub struct TcpPeer {
    endpoint: SocketAddr,
    tx: mpsc::Sender<Message>,
    version: RwLock<Option<Version>>,
    done: DoneSignal,
}

impl TcpPeer {
    fn new(endpoint: SocketAddr, tx: mpsc::Sender<Message>) -> Self {
        Self {
            endpoint,
            tx,
            version: RwLock::new(None),
            done: DoneSignal::new(),
        }
    }
}

#[async_trait]
impl Peer for TcpPeer {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn version(&self) -> Option<Version> {
        self.version.read().await.clone()
    }

    async fn set_version(&self, version: Version) {
        *self.version.write().await = Some(version);
    }

    async fn send(&self, msg: Message) -> Result<(), PeerError> {
        if self.done.is_fired() {
            return Err(PeerError::Disconnected);
        }
        self.tx.send(msg).await.map_err(|_| PeerError::Disconnected)
    }

    fn disconnect(&self, reason: PeerError) {
        if self.done.fire(reason.clone()) {
            log::debug!("Disconnecting {}: {}", self.endpoint, reason);
        }
    }

    async fn done(&self) -> PeerError {
        self.done.wait().await
    }
}

/// Run one connection until it closes, then report the drop to the server
async fn handle_connection(stream: TcpStream, endpoint: SocketAddr, handle: ServerHandle) {
    let framed = Framed::new(stream, MessageCodec);
    let (mut writer, mut reader) = framed.split();

    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let peer = Arc::new(TcpPeer::new(endpoint, tx));
    let dyn_peer: Arc<dyn Peer> = peer.clone();

    if handle.register(dyn_peer.clone()).await.is_err() {
        log::debug!("Server stopped, dropping connection from {}", endpoint);
        return;
    }

    let write_peer = peer.clone();
    let write_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_peer.done.wait() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = writer.send(msg).await {
                            write_peer.disconnect(e.into());
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = writer.close().await;
    });

    let reason = loop {
        tokio::select! {
            reason = peer.done.wait() => break reason,
            frame = reader.next() => match frame {
                Some(Ok(msg)) => {
                    if handle.deliver(msg, dyn_peer.clone()).await.is_err() {
                        break PeerError::ServerShutdown;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", endpoint, e);
                    break e.into();
                }
                None => break PeerError::Disconnected,
            },
        }
    };

    peer.disconnect(reason.clone());
    let _ = write_handle.await;
    log::debug!("Connection to {} closed: {}", endpoint, reason);

    // Peers that never finished the handshake have no protocol task to do this
    handle.unregister(PeerDrop::new(dyn_peer, reason)).await;
}

/// TCP transport for accepting and dialing peer connections
pub struct TcpTransport {
    handle: ServerHandle,
    bind_addr: String,
    closed: CancellationToken,
}

impl TcpTransport {
    pub fn new(handle: ServerHandle, port: u16) -> Self {
        Self::with_bind_addr(handle, format!("0.0.0.0:{}", port))
    }

    pub fn with_bind_addr(handle: ServerHandle, bind_addr: String) -> Self {
        Self {
            handle,
            bind_addr,
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transporter for TcpTransport {
    async fn accept(&self) -> Result<(), PeerError> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        log::info!("Listening on {}", self.bind_addr);

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::info!("Incoming connection from {}", addr);
                        tokio::spawn(handle_connection(stream, addr, self.handle.clone()));
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                    }
                },
            }
        }

        log::info!("Stopped listening on {}", self.bind_addr);
        Ok(())
    }

    async fn dial(&self, addr: &str, timeout: Duration) -> Result<(), PeerError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::ConnectionFailed(format!("dial {} timed out", addr)))?
            .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

        let endpoint = stream
            .peer_addr()
            .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

        log::info!("Connected to {}", endpoint);
        tokio::spawn(handle_connection(stream, endpoint, self.handle.clone()));
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
