//! Test doubles for the server's collaborators

use crate::core::MemoryChain;
use crate::network::config::ServerConfig;
use crate::network::discovery::Discoverer;
use crate::network::message::{CommandType, Message, Payload};
use crate::network::payload::Version;
use crate::network::peer::{DoneSignal, Peer, PeerError};
use crate::network::server::{channels, Server, ServerError, ServerHandle};
use crate::network::transport::Transporter;
use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Peer that records what the server does with it
pub(crate) struct MockPeer {
    endpoint: SocketAddr,
    version: Mutex<Option<Version>>,
    sent: Mutex<Vec<Message>>,
    disconnects: Mutex<Vec<PeerError>>,
    done: DoneSignal,
}

impl MockPeer {
    pub(crate) fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            endpoint: SocketAddr::from(([127, 0, 0, 1], port)),
            version: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            done: DoneSignal::new(),
        })
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_commands(&self) -> Vec<CommandType> {
        self.sent().iter().map(Message::command_type).collect()
    }

    /// Every disconnect call, in order
    pub(crate) fn disconnects(&self) -> Vec<PeerError> {
        self.disconnects.lock().unwrap().clone()
    }
}

#[async_trait]
impl Peer for MockPeer {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn version(&self) -> Option<Version> {
        self.version.lock().unwrap().clone()
    }

    async fn set_version(&self, version: Version) {
        *self.version.lock().unwrap() = Some(version);
    }

    async fn send(&self, msg: Message) -> Result<(), PeerError> {
        if self.done.is_fired() {
            return Err(PeerError::Disconnected);
        }
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }

    fn disconnect(&self, reason: PeerError) {
        self.disconnects.lock().unwrap().push(reason.clone());
        self.done.fire(reason);
    }

    async fn done(&self) -> PeerError {
        self.done.wait().await
    }
}

/// Transport that never opens sockets
pub(crate) struct MockTransport {
    dialed: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    accepting: AtomicBool,
    closed: CancellationToken,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            dialed: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            accepting: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn fail_dial(&self, addr: &str) {
        self.failing.lock().unwrap().insert(addr.to_string());
    }

    pub(crate) fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }

    pub(crate) fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Transporter for MockTransport {
    async fn accept(&self) -> Result<(), PeerError> {
        self.accepting.store(true, Ordering::SeqCst);
        self.closed.cancelled().await;
        Ok(())
    }

    async fn dial(&self, addr: &str, _timeout: Duration) -> Result<(), PeerError> {
        self.dialed.lock().unwrap().push(addr.to_string());
        if self.failing.lock().unwrap().contains(addr) {
            return Err(PeerError::ConnectionFailed(format!("refused: {}", addr)));
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Discovery that only records calls
#[derive(Default)]
pub(crate) struct MockDiscovery {
    requested: Mutex<Vec<usize>>,
    backfilled: Mutex<Vec<String>>,
    good: Mutex<Vec<String>>,
    bad: Mutex<Vec<String>>,
    pool_count: AtomicUsize,
    closed: AtomicBool,
}

impl MockDiscovery {
    pub(crate) fn requested(&self) -> Vec<usize> {
        self.requested.lock().unwrap().clone()
    }

    pub(crate) fn backfilled(&self) -> Vec<String> {
        self.backfilled.lock().unwrap().clone()
    }

    pub(crate) fn good(&self) -> Vec<String> {
        self.good.lock().unwrap().clone()
    }

    pub(crate) fn bad(&self) -> Vec<String> {
        self.bad.lock().unwrap().clone()
    }

    pub(crate) fn set_pool_count(&self, count: usize) {
        self.pool_count.store(count, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discoverer for MockDiscovery {
    async fn backfill(&self, addrs: &[String]) {
        self.backfilled.lock().unwrap().extend_from_slice(addrs);
    }

    async fn request_remote(&self, n: usize) {
        self.requested.lock().unwrap().push(n);
    }

    async fn pool_count(&self) -> usize {
        self.pool_count.load(Ordering::SeqCst)
    }

    async fn register_bad_addr(&self, addr: &str) {
        self.bad.lock().unwrap().push(addr.to_string());
    }

    async fn register_good_addr(&self, addr: &str) {
        self.good.lock().unwrap().push(addr.to_string());
    }

    async fn unconnected_peers(&self) -> Vec<String> {
        self.backfilled()
    }

    async fn bad_peers(&self) -> Vec<String> {
        self.bad()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Default config with a short tick
pub(crate) fn test_config() -> ServerConfig {
    ServerConfig {
        proto_tick_interval: Duration::from_millis(20),
        ..ServerConfig::default()
    }
}

/// A server wired to mocks, with the mocks kept at hand
pub(crate) struct TestNode {
    pub(crate) server: Arc<Server>,
    pub(crate) transport: Arc<MockTransport>,
    pub(crate) discovery: Arc<MockDiscovery>,
    pub(crate) handle: ServerHandle,
    pub(crate) chain: Arc<MemoryChain>,
}

impl TestNode {
    /// Run the server in the background; returns once the event loop is up
    pub(crate) async fn start(&self) -> JoinHandle<Result<(), ServerError>> {
        let server = self.server.clone();
        let task = tokio::spawn(async move { server.start().await });

        let discovery = self.discovery.clone();
        assert!(eventually(|| !discovery.requested().is_empty()).await);
        task
    }

    /// Deliver `payload` from `peer` on the configured network
    pub(crate) async fn deliver(&self, peer: &Arc<MockPeer>, payload: Payload) {
        let msg = Message::new(self.server.config().net, payload);
        self.handle.deliver(msg, peer.clone()).await.unwrap();
    }
}

pub(crate) fn test_node() -> TestNode {
    test_node_with(test_config(), Arc::new(MemoryChain::new()))
}

pub(crate) fn test_node_with(config: ServerConfig, chain: Arc<MemoryChain>) -> TestNode {
    let (handle, inbox) = channels();
    let transport = Arc::new(MockTransport::new());
    let discovery = Arc::new(MockDiscovery::default());
    let server = Server::from_parts(
        config,
        chain.clone(),
        transport.clone(),
        discovery.clone(),
        handle.clone(),
        inbox,
    );

    TestNode {
        server,
        transport,
        discovery,
        handle,
        chain,
    }
}

/// Poll `condition` until it holds or two seconds pass
pub(crate) async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub(crate) async fn eventually_async<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}
