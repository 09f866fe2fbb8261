//! Transport and address-discovery collaborator traits (§6), plus in-memory
//! test doubles so the orchestrator, message queue, and lookup engine can be
//! exercised without real sockets — mirroring the teacher's
//! `BootstrapTransport` trait-for-testing pattern.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::addr::Addr;
use crate::{DhtError, Result};

/// Network transport: non-blocking send plus an inbound-datagram callback.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send `bytes` to `addr`. Non-blocking: returns once the datagram is
    /// handed to the OS (or the in-memory double), not once delivered.
    async fn send(&self, addr: &Addr, bytes: Vec<u8>) -> Result<()>;
}

/// NAT/port-forwarding collaborator (§6). The core re-invokes `forward_port`
/// every `UPNP_RELEASE_INTERVAL` seconds.
#[async_trait::async_trait]
pub trait AddressDiscovery: Send + Sync {
    async fn initialize(&self, ipv6: bool) -> Result<()>;
    async fn get_external_ip_address(&self) -> Result<String>;
    async fn get_local_ip_address(&self) -> Result<String>;
    async fn forward_port(&self, description: &str, proto: &str, port: u16) -> Result<bool>;
}

/// A transport double that always fails the send (simulating an unreachable peer).
#[derive(Default)]
pub struct NeverRespondsTransport;

#[async_trait::async_trait]
impl Transport for NeverRespondsTransport {
    async fn send(&self, addr: &Addr, _bytes: Vec<u8>) -> Result<()> {
        Err(DhtError::Network(format!("no route to {addr}")))
    }
}

/// A transport double that accepts every send but delivers nothing
/// (simulating a peer that is reachable but never replies).
#[derive(Default)]
pub struct AlwaysRespondsTransport {
    sent: Mutex<VecDeque<(Addr, Vec<u8>)>>,
}

#[async_trait::async_trait]
impl Transport for AlwaysRespondsTransport {
    async fn send(&self, addr: &Addr, bytes: Vec<u8>) -> Result<()> {
        self.sent.lock().expect("sent log mutex poisoned").push_back((addr.clone(), bytes));
        Ok(())
    }
}

impl AlwaysRespondsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<(Addr, Vec<u8>)> {
        self.sent.lock().expect("sent log mutex poisoned").drain(..).collect()
    }
}

type InboundSender = tokio::sync::mpsc::UnboundedSender<(Addr, Vec<u8>)>;

/// A shared-registry loopback transport connecting multiple in-process
/// nodes by address, delivering each send directly to the matching node's
/// inbound channel.
pub struct LoopbackRegistry {
    routes: Mutex<HashMap<Addr, InboundSender>>,
}

impl Default for LoopbackRegistry {
    fn default() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }
}

impl LoopbackRegistry {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Register a node's inbound address, returning the receiving half of
    /// its inbound channel.
    pub fn register(&self, addr: Addr) -> tokio::sync::mpsc::UnboundedReceiver<(Addr, Vec<u8>)> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.routes.lock().expect("routes mutex poisoned").insert(addr, tx);
        rx
    }

    /// A [`Transport`] handle bound to `from`, used as the sender identity
    /// for every datagram this node emits.
    pub fn handle(self: &std::sync::Arc<Self>, from: Addr) -> LoopbackTransport {
        LoopbackTransport {
            registry: self.clone(),
            from,
        }
    }
}

/// A [`Transport`] implementation that routes sends through a [`LoopbackRegistry`].
pub struct LoopbackTransport {
    registry: std::sync::Arc<LoopbackRegistry>,
    from: Addr,
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, addr: &Addr, bytes: Vec<u8>) -> Result<()> {
        let sender = self
            .registry
            .routes
            .lock()
            .expect("routes mutex poisoned")
            .get(addr)
            .cloned();
        match sender {
            Some(tx) => tx
                .send((self.from.clone(), bytes))
                .map_err(|_| DhtError::Network(format!("peer {addr} gone"))),
            None => Err(DhtError::Network(format!("no such peer {addr}"))),
        }
    }
}

/// An address-discovery double with fixed, configurable answers.
pub struct FixedAddressDiscovery {
    pub external_ip: String,
    pub local_ip: String,
    pub forward_result: bool,
}

impl Default for FixedAddressDiscovery {
    fn default() -> Self {
        Self {
            external_ip: "203.0.113.1".to_string(),
            local_ip: "192.168.1.1".to_string(),
            forward_result: true,
        }
    }
}

#[async_trait::async_trait]
impl AddressDiscovery for FixedAddressDiscovery {
    async fn initialize(&self, _ipv6: bool) -> Result<()> {
        Ok(())
    }

    async fn get_external_ip_address(&self) -> Result<String> {
        Ok(self.external_ip.clone())
    }

    async fn get_local_ip_address(&self) -> Result<String> {
        Ok(self.local_ip.clone())
    }

    async fn forward_port(&self, _description: &str, _proto: &str, _port: u16) -> Result<bool> {
        Ok(self.forward_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Transport as WireTransport;

    fn addr(port: u16) -> Addr {
        Addr::new(WireTransport::Udp, "127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_never_responds_transport_errors() {
        let t = NeverRespondsTransport;
        assert!(t.send(&addr(1), vec![1, 2, 3]).await.is_err());
    }

    #[tokio::test]
    async fn test_always_responds_transport_records_sends() {
        let t = AlwaysRespondsTransport::new();
        t.send(&addr(1), vec![1]).await.expect("accepted");
        let sent = t.drain();
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn test_loopback_registry_delivers_to_registered_peer() {
        let registry = LoopbackRegistry::new();
        let mut rx = registry.register(addr(2));
        let sender = registry.handle(addr(1));

        sender.send(&addr(2), b"hello".to_vec()).await.expect("delivered");
        let (from, bytes) = rx.recv().await.expect("message arrives");
        assert_eq!(from, addr(1));
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_loopback_registry_errors_on_unknown_peer() {
        let registry = LoopbackRegistry::new();
        let sender = registry.handle(addr(1));
        assert!(sender.send(&addr(99), vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_fixed_address_discovery() {
        let disc = FixedAddressDiscovery::default();
        assert_eq!(disc.get_external_ip_address().await.expect("ip"), "203.0.113.1");
        assert!(disc.forward_port("warren", "udp", 6881).await.expect("forward"));
    }
}
