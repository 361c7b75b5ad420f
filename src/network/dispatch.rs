//! Inbound message dispatch
//!
//! Called from the event loop for every delivered message. An error
//! returned from here disconnects the peer that sent the message.

use crate::core::Block;
use crate::network::handshake::HandshakeState;
use crate::network::message::{Message, Payload};
use crate::network::payload::{
    AddressAndTime, AddressList, GetBlocks, Headers, Inventory, InventoryType,
    MAX_HEADERS_ALLOWED,
};
use crate::network::peer::{Peer, PeerError};
use crate::network::server::{same_peer, Server};
use std::net::SocketAddr;
use std::sync::Arc;

/// Maximum number of addresses returned for one GetAddr
pub const MAX_ADDR_RESPONSE: usize = 200;

impl Server {
    pub(crate) async fn process_proto(
        self: &Arc<Self>,
        peer: &Arc<dyn Peer>,
        msg: Message,
    ) -> Result<(), PeerError> {
        if msg.magic != self.config.net {
            return Err(PeerError::InvalidNetwork);
        }

        match msg.payload {
            Payload::Version(version) => self.handle_version(peer, version).await,
            Payload::Verack => self.handle_verack(peer).await,
            Payload::Headers(headers) => {
                let server = self.clone();
                let peer = peer.clone();
                tokio::spawn(async move { server.handle_headers(peer, headers).await });
                Ok(())
            }
            Payload::Inv(inv) => self.handle_inv(peer, inv).await,
            Payload::Block(block) => self.handle_block(block).await,
            Payload::GetHeaders(get) => self.handle_get_headers(peer, get).await,
            Payload::GetAddr => self.handle_get_addr(peer).await,
            Payload::Addr(list) => {
                self.handle_addr(list).await;
                Ok(())
            }
            Payload::GetData(inv) => self.handle_get_data(peer, inv).await,
            Payload::GetBlocks(get) => {
                log::debug!(
                    "Ignoring getblocks from {} ({} start hashes)",
                    peer.endpoint(),
                    get.hash_start.len()
                );
                Ok(())
            }
        }
    }

    /// Ask for everything the peer announces
    async fn handle_inv(&self, peer: &Arc<dyn Peer>, inv: Inventory) -> Result<(), PeerError> {
        if !inv.inv_type.is_valid() || inv.hashes.is_empty() {
            return Err(PeerError::InvalidInvType);
        }
        peer.send(Message::new(self.config.net, Payload::GetData(inv)))
            .await
    }

    async fn handle_block(&self, block: Block) -> Result<(), PeerError> {
        if !self.chain.has_block(&block.hash()).await {
            self.chain.add_block(block).await?;
        }
        Ok(())
    }

    /// Serve headers following the first start hash we know
    async fn handle_get_headers(
        &self,
        peer: &Arc<dyn Peer>,
        get: GetBlocks,
    ) -> Result<(), PeerError> {
        let mut start = None;
        for hash in &get.hash_start {
            if let Some(header) = self.chain.get_header(hash).await {
                start = Some(header.index);
                break;
            }
        }
        let start = match start {
            Some(index) => index,
            None => {
                log::debug!("No known start hash in getheaders from {}", peer.endpoint());
                return Ok(());
            }
        };

        let mut headers = Vec::new();
        let mut index = start.saturating_add(1);
        while headers.len() < MAX_HEADERS_ALLOWED {
            let hash = match self.chain.get_header_hash(index).await {
                Some(hash) => hash,
                None => break,
            };
            let header = match self.chain.get_header(&hash).await {
                Some(header) => header,
                None => break,
            };
            headers.push(header);
            if hash == get.hash_stop {
                break;
            }
            index += 1;
        }

        if headers.is_empty() {
            return Ok(());
        }
        log::debug!("Serving {} headers to {}", headers.len(), peer.endpoint());
        peer.send(Message::new(
            self.config.net,
            Payload::Headers(Headers::new(headers)),
        ))
        .await
    }

    /// Reply with the listening addresses of our established peers
    async fn handle_get_addr(&self, peer: &Arc<dyn Peer>) -> Result<(), PeerError> {
        let candidates: Vec<Arc<dyn Peer>> = self
            .peers
            .read()
            .await
            .values()
            .filter(|entry| entry.state == HandshakeState::Established)
            .filter(|entry| !same_peer(&entry.peer, peer))
            .map(|entry| entry.peer.clone())
            .collect();

        let mut addrs = Vec::new();
        for other in candidates {
            if addrs.len() >= MAX_ADDR_RESPONSE {
                break;
            }
            if let Some(version) = other.version().await {
                let endpoint = SocketAddr::new(other.endpoint().ip(), version.port);
                addrs.push(AddressAndTime::new(endpoint));
            }
        }

        peer.send(Message::new(
            self.config.net,
            Payload::Addr(AddressList::new(addrs)),
        ))
        .await
    }

    async fn handle_addr(&self, list: AddressList) {
        let addrs: Vec<String> = list
            .addrs
            .iter()
            .map(|addr| addr.endpoint.to_string())
            .collect();
        self.discovery.backfill(&addrs).await;
    }

    /// Send the requested blocks we have; other inventory is not served
    async fn handle_get_data(&self, peer: &Arc<dyn Peer>, inv: Inventory) -> Result<(), PeerError> {
        if !inv.inv_type.is_valid() || inv.hashes.is_empty() {
            return Err(PeerError::InvalidInvType);
        }
        if inv.inv_type != InventoryType::BLOCK {
            log::debug!(
                "Ignoring getdata for type {:#04x} from {}",
                inv.inv_type.0,
                peer.endpoint()
            );
            return Ok(());
        }

        for hash in &inv.hashes {
            if let Some(block) = self.chain.get_block(hash).await {
                peer.send(Message::new(self.config.net, Payload::Block(block)))
                    .await?;
            }
        }
        Ok(())
    }
}
