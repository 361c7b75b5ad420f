//! Version/verack handshake
//!
//! Registration sends our Version. The peer's Version is checked against
//! the connection it arrived on and answered with a Verack; the peer's
//! Verack then starts the steady-state protocol task.

use crate::network::message::{Message, Payload};
use crate::network::payload::Version;
use crate::network::peer::{Peer, PeerError};
use crate::network::server::{same_peer, Server};
use std::net::SocketAddr;
use std::sync::Arc;

/// How far a registered peer got through the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Registered and our Version sent
    VersionSent,
    /// Their Version accepted and our Verack sent
    Authenticated,
    /// Their Verack received, protocol task running
    Established,
}

/// Check a received Version against the connection it came in on
pub fn validate_version(local_id: u32, endpoint: SocketAddr, version: &Version) -> Result<(), PeerError> {
    if endpoint.port() != version.port {
        return Err(PeerError::PortMismatch);
    }
    if version.nonce == local_id {
        return Err(PeerError::IdenticalId);
    }
    Ok(())
}

impl Server {
    pub(crate) async fn send_version(&self, peer: &Arc<dyn Peer>) -> Result<(), PeerError> {
        let version = Version::new(
            self.id(),
            self.config.listen_tcp,
            self.config.user_agent.clone(),
            self.chain.block_height().await,
            self.config.relay,
        );
        peer.send(Message::new(self.config.net, Payload::Version(version)))
            .await
    }

    /// Validate the peer's version, store it and reply with a verack
    pub(crate) async fn handle_version(
        &self,
        peer: &Arc<dyn Peer>,
        version: Version,
    ) -> Result<(), PeerError> {
        if self.peer_state(peer).await != Some(HandshakeState::VersionSent) {
            return Err(PeerError::InvalidHandshake);
        }
        validate_version(self.id(), peer.endpoint(), &version)?;

        peer.set_version(version).await;
        self.set_handshake_state(peer, HandshakeState::Authenticated)
            .await;
        peer.send(Message::new(self.config.net, Payload::Verack))
            .await
    }

    /// Start the protocol for a peer whose version we accepted and which
    /// has not completed the handshake yet
    pub(crate) async fn handle_verack(self: &Arc<Self>, peer: &Arc<dyn Peer>) -> Result<(), PeerError> {
        if peer.version().await.is_none()
            || self.peer_state(peer).await != Some(HandshakeState::Authenticated)
        {
            return Err(PeerError::InvalidHandshake);
        }

        self.set_handshake_state(peer, HandshakeState::Established)
            .await;
        self.discovery
            .register_good_addr(&peer.endpoint().to_string())
            .await;

        tokio::spawn(self.clone().start_protocol(peer.clone()));
        Ok(())
    }

    /// State of this exact connection, `None` if it is not registered
    async fn peer_state(&self, peer: &Arc<dyn Peer>) -> Option<HandshakeState> {
        self.peers
            .read()
            .await
            .get(&peer.endpoint())
            .filter(|entry| same_peer(&entry.peer, peer))
            .map(|entry| entry.state)
    }

    async fn set_handshake_state(&self, peer: &Arc<dyn Peer>, state: HandshakeState) {
        let mut peers = self.peers.write().await;
        if let Some(entry) = peers.get_mut(&peer.endpoint()) {
            if same_peer(&entry.peer, peer) {
                entry.state = state;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Blockchainer;
    use crate::network::message::CommandType;
    use crate::network::testing::{eventually, eventually_async, test_node, MockPeer};
    use std::time::Duration;

    fn version(nonce: u32, port: u16) -> Version {
        Version::new(nonce, port, "/peer:1.0/".to_string(), 10, true)
    }

    #[test]
    fn test_validate_version() {
        let endpoint: SocketAddr = "127.0.0.1:20334".parse().unwrap();

        assert_eq!(validate_version(1_234_567, endpoint, &version(42, 20334)), Ok(()));
        assert_eq!(
            validate_version(1_234_567, endpoint, &version(42, 20335)),
            Err(PeerError::PortMismatch)
        );
        assert_eq!(
            validate_version(42, endpoint, &version(42, 20334)),
            Err(PeerError::IdenticalId)
        );
    }

    #[test]
    fn test_port_mismatch_wins_regardless_of_fields() {
        let endpoint: SocketAddr = "127.0.0.1:20334".parse().unwrap();
        for nonce in [0, 42, u32::MAX] {
            for port in [0, 1, 20333, 20335, u16::MAX] {
                let mut v = version(nonce, port);
                v.relay = nonce % 2 == 0;
                v.start_height = nonce;
                assert_eq!(
                    validate_version(nonce, endpoint, &v),
                    Err(PeerError::PortMismatch)
                );
            }
        }
    }

    #[tokio::test]
    async fn test_full_handshake_starts_protocol() {
        let node = test_node();
        let _task = node.start().await;

        let peer = MockPeer::new(20334);
        node.handle.register(peer.clone()).await.unwrap();
        node.deliver(&peer, Payload::Version(version(42, 20334))).await;

        assert!(eventually(|| peer.sent_commands() == vec![CommandType::Version, CommandType::Verack]).await);
        let stored = peer.version().await.unwrap();
        assert_eq!((stored.nonce, stored.port), (42, 20334));
        assert_eq!(
            node.server.handshake_state(&peer.endpoint()).await,
            Some(HandshakeState::Authenticated)
        );

        node.deliver(&peer, Payload::Verack).await;

        assert!(eventually(|| {
            let sent = peer.sent_commands();
            sent.len() >= 4
                && sent[2] == CommandType::GetHeaders
                && sent[3] == CommandType::GetAddr
        })
        .await);
        match &peer.sent()[2].payload {
            Payload::GetHeaders(get) => {
                assert_eq!(get.hash_start, vec![node.chain.current_header_hash().await]);
                assert!(get.hash_stop.is_zero());
            }
            other => panic!("expected getheaders, got {:?}", other),
        }
        assert_eq!(
            node.server.handshake_state(&peer.endpoint()).await,
            Some(HandshakeState::Established)
        );
        assert!(peer.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_identical_id_rejected() {
        let node = test_node();
        let _task = node.start().await;

        let peer = MockPeer::new(20334);
        node.handle.register(peer.clone()).await.unwrap();
        node.deliver(&peer, Payload::Version(version(node.server.id(), 20334)))
            .await;

        assert!(eventually(|| peer.disconnects() == vec![PeerError::IdenticalId]).await);
        assert_eq!(peer.sent_commands(), vec![CommandType::Version]);
        assert!(peer.version().await.is_none());

        let server = node.server.clone();
        assert!(eventually_async(|| {
            let server = server.clone();
            async move { server.peer_count().await == 0 }
        })
        .await);
    }

    #[tokio::test]
    async fn test_port_mismatch_rejected_and_unregistered() {
        let node = test_node();
        let _task = node.start().await;

        let peer = MockPeer::new(20334);
        node.handle.register(peer.clone()).await.unwrap();
        node.deliver(&peer, Payload::Version(version(42, 20999))).await;

        assert!(eventually(|| peer.disconnects() == vec![PeerError::PortMismatch]).await);
        assert!(eventually(|| node.discovery.bad() == vec![peer.endpoint().to_string()]).await);
        assert!(!peer.sent_commands().contains(&CommandType::Verack));
    }

    #[tokio::test]
    async fn test_verack_before_version_rejected() {
        let node = test_node();
        let _task = node.start().await;

        let peer = MockPeer::new(20334);
        node.handle.register(peer.clone()).await.unwrap();
        node.deliver(&peer, Payload::Verack).await;

        assert!(eventually(|| peer.disconnects() == vec![PeerError::InvalidHandshake]).await);

        // Several ticks pass without the protocol task sending anything
        tokio::time::sleep(node.server.config().proto_tick_interval * 4).await;
        assert_eq!(peer.sent_commands(), vec![CommandType::Version]);
        assert!(node.discovery.good().is_empty());
    }

    #[tokio::test]
    async fn test_second_verack_rejected() {
        let node = test_node();
        let _task = node.start().await;

        let peer = MockPeer::new(20334);
        node.handle.register(peer.clone()).await.unwrap();
        node.deliver(&peer, Payload::Version(version(42, 20334))).await;
        node.deliver(&peer, Payload::Verack).await;
        assert!(eventually(|| peer.sent_commands().contains(&CommandType::GetHeaders)).await);

        node.deliver(&peer, Payload::Verack).await;
        assert!(eventually(|| peer.disconnects() == vec![PeerError::InvalidHandshake]).await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let get_headers = peer
            .sent_commands()
            .iter()
            .filter(|c| **c == CommandType::GetHeaders)
            .count();
        assert!(get_headers >= 1);
    }

    #[tokio::test]
    async fn test_repeated_handshake_rejected() {
        let node = test_node();
        let _task = node.start().await;

        // Not ahead of us, so ticks never ask for headers again
        let synced = Version::new(42, 20334, "/peer:1.0/".to_string(), 0, true);

        let peer = MockPeer::new(20334);
        node.handle.register(peer.clone()).await.unwrap();
        node.deliver(&peer, Payload::Version(synced.clone())).await;
        node.deliver(&peer, Payload::Verack).await;
        assert!(eventually(|| peer.sent_commands().contains(&CommandType::GetHeaders)).await);

        node.deliver(&peer, Payload::Version(synced)).await;
        node.deliver(&peer, Payload::Verack).await;

        assert!(eventually(|| !peer.disconnects().is_empty()).await);
        tokio::time::sleep(node.server.config().proto_tick_interval * 4).await;

        assert!(peer
            .disconnects()
            .iter()
            .all(|reason| *reason == PeerError::InvalidHandshake));
        let get_headers = peer
            .sent_commands()
            .iter()
            .filter(|c| **c == CommandType::GetHeaders)
            .count();
        assert_eq!(get_headers, 1);
        assert_eq!(
            peer.sent_commands()
                .iter()
                .filter(|c| **c == CommandType::Verack)
                .count(),
            1
        );
        assert_eq!(node.discovery.good(), vec![peer.endpoint().to_string()]);
    }

    #[tokio::test]
    async fn test_version_from_unregistered_peer_rejected() {
        let node = test_node();
        let peer = MockPeer::new(20334);
        let dyn_peer: Arc<dyn Peer> = peer.clone();

        let result = node
            .server
            .handle_version(&dyn_peer, version(42, 20334))
            .await;

        assert_eq!(result, Err(PeerError::InvalidHandshake));
        assert!(peer.version().await.is_none());
        assert!(peer.sent().is_empty());
    }
}
