//! Network addresses, single-endpoint peers, and multi-endpoint contacts.

use serde::{Deserialize, Serialize};

use crate::id::Id;

/// A transport-level endpoint: `{transport, host, port}`.
///
/// Equality is by all three fields, so the same peer reachable over two
/// transports (or two ports) is represented as distinct addresses.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
}

impl Addr {
    pub fn new(transport: Transport, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}://{}:{}", self.transport, self.host, self.port)
    }
}

/// The wire transport a [`Addr`] is reachable over. The DHT core is
/// transport-agnostic; this tag only round-trips through the wire codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

/// An identity with a single known endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: Id,
    pub addr: Addr,
}

impl Peer {
    pub fn new(id: Id, addr: Addr) -> Self {
        Self { id, addr }
    }
}

/// An identity with one or more known endpoints, tried in order.
///
/// Used by the message queue's failover send: when `addresses[0]` times out,
/// the queue drops it and retries `addresses[1]`, and so on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Id,
    pub addresses: Vec<Addr>,
}

impl Contact {
    pub fn new(id: Id, addresses: Vec<Addr>) -> Self {
        Self { id, addresses }
    }

    pub fn single(id: Id, addr: Addr) -> Self {
        Self {
            id,
            addresses: vec![addr],
        }
    }

    /// The first (most preferred) address, if any.
    pub fn primary(&self) -> Option<&Addr> {
        self.addresses.first()
    }
}

impl From<Peer> for Contact {
    fn from(p: Peer) -> Self {
        Contact::single(p.id, p.addr)
    }
}
