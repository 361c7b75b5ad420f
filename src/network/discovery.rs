//! Peer discovery
//!
//! Keeps the address pools the server feeds and drains:
//! - unconnected: heard about (seeds, addr messages) but not dialed yet
//! - connected: dialed successfully or completed a handshake
//! - bad: failed to dial or dropped by the server, retried after a cooldown
//!
//! The server only uses the `Discoverer` trait. `DefaultDiscovery` dials
//! candidates through the transport and replaces failed dials with the next
//! candidate from the pool.

use crate::network::transport::Transporter;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Maximum number of candidates waiting in the pool
pub const MAX_POOL_SIZE: usize = 200;

/// How long a bad address is kept out of the dial queue
pub const BAD_ADDR_RETRY: Duration = Duration::from_secs(300);

/// Address pool service consumed by the server
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Ingest candidate addresses; known, connected and bad ones are ignored
    async fn backfill(&self, addrs: &[String]);

    /// Start up to `n` new outbound connections
    async fn request_remote(&self, n: usize);

    /// Number of candidates in the pool
    async fn pool_count(&self) -> usize;

    async fn register_bad_addr(&self, addr: &str);

    async fn register_good_addr(&self, addr: &str);

    async fn unconnected_peers(&self) -> Vec<String>;

    async fn bad_peers(&self) -> Vec<String>;

    async fn close(&self);
}

/// The three address sets plus the dial queue. Bad addresses become dial
/// candidates again once `retry_after` has passed since they were marked.
#[derive(Debug)]
pub struct AddressPools {
    pool: VecDeque<String>,
    unconnected: HashSet<String>,
    connected: HashSet<String>,
    bad: HashMap<String, Instant>,
    retry_after: Duration,
}

impl Default for AddressPools {
    fn default() -> Self {
        Self::with_retry_after(BAD_ADDR_RETRY)
    }
}

impl AddressPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_after(retry_after: Duration) -> Self {
        Self {
            pool: VecDeque::new(),
            unconnected: HashSet::new(),
            connected: HashSet::new(),
            bad: HashMap::new(),
            retry_after,
        }
    }

    fn retry_due(&self, marked: Instant) -> bool {
        marked.elapsed() >= self.retry_after
    }

    /// Returns true if the address was queued
    pub fn backfill(&mut self, addr: &str) -> bool {
        if self.pool.len() >= MAX_POOL_SIZE
            || self.connected.contains(addr)
            || self.unconnected.contains(addr)
        {
            return false;
        }
        if let Some(marked) = self.bad.get(addr) {
            if !self.retry_due(*marked) {
                return false;
            }
            self.bad.remove(addr);
        }
        self.pool.push_back(addr.to_string());
        self.unconnected.insert(addr.to_string());
        true
    }

    /// Take the next candidate to dial. With an empty pool, the bad address
    /// marked longest ago is retried once its cooldown has passed.
    pub fn next_candidate(&mut self) -> Option<String> {
        if let Some(addr) = self.pool.pop_front() {
            self.unconnected.remove(&addr);
            return Some(addr);
        }

        let addr = self
            .bad
            .iter()
            .filter(|(_, marked)| self.retry_due(**marked))
            .min_by_key(|(_, marked)| **marked)
            .map(|(addr, _)| addr.clone())?;
        self.bad.remove(&addr);
        log::debug!("Retrying bad address {}", addr);
        Some(addr)
    }

    pub fn mark_bad(&mut self, addr: &str) {
        self.pool.retain(|a| a != addr);
        self.unconnected.remove(addr);
        self.connected.remove(addr);
        self.bad.insert(addr.to_string(), Instant::now());
    }

    pub fn mark_connected(&mut self, addr: &str) {
        self.pool.retain(|a| a != addr);
        self.unconnected.remove(addr);
        self.bad.remove(addr);
        self.connected.insert(addr.to_string());
    }

    pub fn pool_count(&self) -> usize {
        self.pool.len()
    }

    pub fn unconnected(&self) -> Vec<String> {
        self.pool.iter().cloned().collect()
    }

    pub fn bad(&self) -> Vec<String> {
        let mut bad: Vec<String> = self.bad.keys().cloned().collect();
        bad.sort();
        bad
    }

    pub fn is_connected(&self, addr: &str) -> bool {
        self.connected.contains(addr)
    }
}

struct DiscoveryInner {
    transport: Arc<dyn Transporter>,
    dial_timeout: Duration,
    pools: Mutex<AddressPools>,
    closed: CancellationToken,
}

/// Discovery that dials pool candidates through a transport
pub struct DefaultDiscovery {
    inner: Arc<DiscoveryInner>,
}

impl DefaultDiscovery {
    pub fn new(dial_timeout: Duration, transport: Arc<dyn Transporter>) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                transport,
                dial_timeout,
                pools: Mutex::new(AddressPools::new()),
                closed: CancellationToken::new(),
            }),
        }
    }
}

/// Dial `addr` in the background; on failure mark it bad and try the next one
fn spawn_dial(inner: Arc<DiscoveryInner>, addr: String) {
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = inner.closed.cancelled() => return,
            result = inner.transport.dial(&addr, inner.dial_timeout) => result,
        };

        let mut pools = inner.pools.lock().await;
        match result {
            Ok(()) => {
                pools.mark_connected(&addr);
                log::debug!("Dialed {}", addr);
            }
            Err(e) => {
                log::debug!("Failed to dial {}: {}", addr, e);
                pools.mark_bad(&addr);
                if let Some(next) = pools.next_candidate() {
                    drop(pools);
                    spawn_dial(inner.clone(), next);
                }
            }
        }
    });
}

#[async_trait]
impl Discoverer for DefaultDiscovery {
    async fn backfill(&self, addrs: &[String]) {
        let mut pools = self.inner.pools.lock().await;
        let added = addrs.iter().filter(|addr| pools.backfill(addr)).count();
        if added > 0 {
            log::debug!("Backfilled {} addresses, pool size {}", added, pools.pool_count());
        }
    }

    async fn request_remote(&self, n: usize) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        let mut pools = self.inner.pools.lock().await;
        for _ in 0..n {
            match pools.next_candidate() {
                Some(addr) => spawn_dial(self.inner.clone(), addr),
                None => break,
            }
        }
    }

    async fn pool_count(&self) -> usize {
        self.inner.pools.lock().await.pool_count()
    }

    async fn register_bad_addr(&self, addr: &str) {
        self.inner.pools.lock().await.mark_bad(addr);
    }

    async fn register_good_addr(&self, addr: &str) {
        self.inner.pools.lock().await.mark_connected(addr);
    }

    async fn unconnected_peers(&self) -> Vec<String> {
        self.inner.pools.lock().await.unconnected()
    }

    async fn bad_peers(&self) -> Vec<String> {
        self.inner.pools.lock().await.bad()
    }

    async fn close(&self) {
        self.inner.closed.cancel();
        log::info!("Stopped peer discovery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::MockTransport;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_backfill_is_idempotent() {
        let mut pools = AddressPools::new();
        assert!(pools.backfill("1.1.1.1:20333"));
        assert!(!pools.backfill("1.1.1.1:20333"));
        assert_eq!(pools.pool_count(), 1);
    }

    #[test]
    fn test_bad_addresses_not_backfilled() {
        let mut pools = AddressPools::new();
        pools.backfill("1.1.1.1:20333");
        pools.mark_bad("1.1.1.1:20333");

        assert_eq!(pools.pool_count(), 0);
        assert!(!pools.backfill("1.1.1.1:20333"));
        assert_eq!(pools.bad(), addrs(&["1.1.1.1:20333"]));
    }

    #[test]
    fn test_bad_address_retried_after_cooldown() {
        let mut pools = AddressPools::with_retry_after(Duration::ZERO);
        pools.backfill("1.1.1.1:20333");
        assert_eq!(pools.next_candidate().as_deref(), Some("1.1.1.1:20333"));
        pools.mark_bad("1.1.1.1:20333");

        // Empty pool falls back to the expired bad address
        assert_eq!(pools.next_candidate().as_deref(), Some("1.1.1.1:20333"));
        assert!(pools.bad().is_empty());

        // Re-announced bad addresses are queued again
        pools.mark_bad("1.1.1.1:20333");
        assert!(pools.backfill("1.1.1.1:20333"));
        assert_eq!(pools.pool_count(), 1);
        assert!(pools.bad().is_empty());
    }

    #[test]
    fn test_bad_address_held_during_cooldown() {
        let mut pools = AddressPools::new();
        pools.mark_bad("1.1.1.1:20333");

        assert_eq!(pools.next_candidate(), None);
        assert_eq!(pools.bad(), addrs(&["1.1.1.1:20333"]));
    }

    #[test]
    fn test_pool_is_bounded() {
        let mut pools = AddressPools::new();
        for i in 0..MAX_POOL_SIZE + 10 {
            pools.backfill(&format!("10.0.{}.{}:20333", i / 256, i % 256));
        }
        assert_eq!(pools.pool_count(), MAX_POOL_SIZE);
    }

    #[tokio::test]
    async fn test_request_remote_dials_candidates() {
        let transport = Arc::new(MockTransport::new());
        let discovery = DefaultDiscovery::new(Duration::from_secs(1), transport.clone());

        discovery
            .backfill(&addrs(&["1.1.1.1:20333", "2.2.2.2:20333", "3.3.3.3:20333"]))
            .await;
        assert_eq!(discovery.pool_count().await, 3);

        discovery.request_remote(2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.dialed().len(), 2);
        assert_eq!(discovery.pool_count().await, 1);
        assert_eq!(discovery.unconnected_peers().await, addrs(&["3.3.3.3:20333"]));
    }

    #[tokio::test]
    async fn test_failed_dial_is_replaced() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_dial("1.1.1.1:20333");
        let discovery = DefaultDiscovery::new(Duration::from_secs(1), transport.clone());

        discovery
            .backfill(&addrs(&["1.1.1.1:20333", "2.2.2.2:20333"]))
            .await;
        discovery.request_remote(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            transport.dialed(),
            addrs(&["1.1.1.1:20333", "2.2.2.2:20333"])
        );
        assert_eq!(discovery.bad_peers().await, addrs(&["1.1.1.1:20333"]));
        assert_eq!(discovery.pool_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_discovery_does_not_dial() {
        let transport = Arc::new(MockTransport::new());
        let discovery = DefaultDiscovery::new(Duration::from_secs(1), transport.clone());

        discovery.backfill(&addrs(&["1.1.1.1:20333"])).await;
        discovery.close().await;
        discovery.request_remote(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(transport.dialed().is_empty());
    }
}
