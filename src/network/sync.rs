//! Per-peer synchronization
//!
//! Every established peer gets a protocol task that wakes up once per tick
//! and decides whether to ask that peer for blocks or more addresses.
//! Headers are pulled eagerly: each processed Headers message triggers the
//! next request while we are still behind the peer.

use crate::crypto::Uint256;
use crate::network::message::{Message, Payload};
use crate::network::payload::{GetBlocks, Headers, Inventory, InventoryType};
use crate::network::peer::{Peer, PeerDrop, PeerError};
use crate::network::server::Server;
use std::ops::Range;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Maximum number of blocks requested in one GetData
pub const MAX_BLOCK_BATCH: u32 = 200;

/// Below this many known addresses we ask peers for more
pub const MIN_POOL_COUNT: usize = 30;

/// Indices of the blocks to request next: after the block tip and below the
/// header tip, at most `MAX_BLOCK_BATCH` of them.
pub fn block_request_range(block_height: u32, header_height: u32) -> Range<u32> {
    let start = block_height.saturating_add(1);
    let end = header_height.min(start.saturating_add(MAX_BLOCK_BATCH));
    start..end.max(start)
}

impl Server {
    /// Steady-state loop of one established peer
    pub(crate) async fn start_protocol(self: Arc<Self>, peer: Arc<dyn Peer>) {
        let endpoint = peer.endpoint();
        let start_height = peer
            .version()
            .await
            .map(|v| v.start_height)
            .unwrap_or_default();
        log::info!(
            "Starting protocol with {}: start_height={} block_height={} header_height={}",
            endpoint,
            start_height,
            self.chain.block_height().await,
            self.chain.header_height().await
        );

        if let Err(e) = self.request_headers(&peer).await {
            log::debug!("Failed to request headers from {}: {}", endpoint, e);
        }
        if let Err(e) = self.request_peer_info(&peer).await {
            log::debug!("Failed to request addresses from {}: {}", endpoint, e);
        }

        let tick = self.config.proto_tick_interval;
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut done = peer.done();

        loop {
            tokio::select! {
                reason = &mut done => {
                    log::debug!("Protocol with {} stopped: {}", endpoint, reason);
                    self.handle
                        .unregister(PeerDrop::new(peer.clone(), reason))
                        .await;
                    return;
                }
                _ = ticker.tick() => {
                    self.on_tick(&peer, start_height).await;
                }
            }
        }
    }

    async fn on_tick(&self, peer: &Arc<dyn Peer>, start_height: u32) {
        if start_height > self.chain.block_height().await {
            if let Err(e) = self.request_blocks(peer, start_height).await {
                log::debug!("Failed to request blocks from {}: {}", peer.endpoint(), e);
            }
        }

        if self.discovery.pool_count().await < MIN_POOL_COUNT {
            if let Err(e) = self.request_peer_info(peer).await {
                log::debug!("Failed to request addresses from {}: {}", peer.endpoint(), e);
            }
        }
    }

    /// Add received headers and keep pulling while behind the peer.
    /// Runs detached from the event loop, so failures are only logged.
    pub(crate) async fn handle_headers(&self, peer: Arc<dyn Peer>, headers: Headers) {
        let count = headers.headers.len();
        if let Err(e) = self.chain.add_headers(headers.headers).await {
            log::warn!(
                "Failed to add {} headers from {}: {}",
                count,
                peer.endpoint(),
                e
            );
            return;
        }

        let start_height = match peer.version().await {
            Some(version) => version.start_height,
            None => return,
        };
        if self.chain.header_height().await < start_height {
            if let Err(e) = self.request_headers(&peer).await {
                log::debug!("Failed to request headers from {}: {}", peer.endpoint(), e);
            }
        }
    }

    pub(crate) async fn request_headers(&self, peer: &Arc<dyn Peer>) -> Result<(), PeerError> {
        let start = self.chain.current_header_hash().await;
        let payload = GetBlocks::new(vec![start], Uint256::ZERO);
        peer.send(Message::new(self.config.net, Payload::GetHeaders(payload)))
            .await
    }

    pub(crate) async fn request_peer_info(&self, peer: &Arc<dyn Peer>) -> Result<(), PeerError> {
        peer.send(Message::new(self.config.net, Payload::GetAddr))
            .await
    }

    /// Request the next batch of blocks, or more headers if there is
    /// nothing to fetch yet
    pub(crate) async fn request_blocks(
        &self,
        peer: &Arc<dyn Peer>,
        start_height: u32,
    ) -> Result<(), PeerError> {
        let header_height = self.chain.header_height().await;
        let range = block_request_range(self.chain.block_height().await, header_height);

        let mut hashes = Vec::with_capacity(range.len());
        for index in range {
            match self.chain.get_header_hash(index).await {
                Some(hash) => hashes.push(hash),
                None => break,
            }
        }

        if !hashes.is_empty() {
            log::debug!("Requesting {} blocks from {}", hashes.len(), peer.endpoint());
            let inv = Inventory::new(InventoryType::BLOCK, hashes);
            return peer
                .send(Message::new(self.config.net, Payload::GetData(inv)))
                .await;
        }

        if header_height < start_height {
            return self.request_headers(peer).await;
        }
        Ok(())
    }
}
