//! # warren-dht
//!
//! Kademlia-style distributed hash table with signed records, multi-address
//! peers, replacement caches, and disjoint-path value lookups.
//!
//! This crate implements:
//! - An XOR trie routing table with per-bucket replacement caches and
//!   per-address staleness accounting ([`routing`])
//! - An iterative node lookup and a libp2p-style quorum value lookup with
//!   outdated-peer repair, including a disjoint-path mode ([`lookup`])
//! - An asynchronous request/response message queue with timeout and
//!   alternate-address failover ([`queue`])
//! - The signed-record protocol: identity challenge, data records, and
//!   provider records ([`record`], [`identity`])
//! - The node orchestrator tying the above into RPC handlers, background
//!   refresh/republish loops, and a public put/get/provide API ([`node`])
//!
//! ## Key parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | K (bucket size) | 20 |
//! | ALPHA (lookup parallelism) | 3 |
//! | ADDR_LIMIT (addresses per entry) | 4 |
//! | MAX_STALE | 3 |
//! | REPL_CACHE_SIZE | 8 |
//! | NET_TIMEOUT | 5s |
//! | REFRESH_INTERVAL / REFRESH_TIME | 60s / 3600s |
//! | REPUBLISH_INTERVAL / REPUBLISH_TIME | 60s / 86400s |
//! | Node ID derivation | `sha1(public_key)` |

pub mod addr;
pub mod config;
pub mod id;
pub mod identity;
pub mod lookup;
pub mod node;
pub mod queue;
pub mod record;
pub mod routing;
pub mod transport;
pub mod wire;

/// Kademlia bucket size: maximum entries per leaf bucket.
pub const K: usize = 20;

/// Lookup parallelism factor: concurrent RPCs issued per lookup round.
pub const ALPHA: usize = 3;

/// Maximum number of addresses retained per routing-table entry.
pub const ADDR_LIMIT: usize = 4;

/// Maximum consecutive-failure staleness counter before an address is evicted.
pub const MAX_STALE: u32 = 3;

/// Maximum size of a bucket's replacement cache.
pub const REPL_CACHE_SIZE: usize = 8;

/// Width of node/key identifiers in bits.
pub const BIT_HASH_WIDTH: usize = 160;

/// Seconds to wait for a reply before a pending RPC times out.
pub const NET_TIMEOUT_SECS: u64 = 5;

/// Seconds between bucket-refresh sweeps.
pub const REFRESH_INTERVAL_SECS: u64 = 60;

/// Seconds of inactivity after which a bucket is refreshed.
pub const REFRESH_TIME_SECS: u64 = 3600;

/// Seconds between record-republish sweeps.
pub const REPUBLISH_INTERVAL_SECS: u64 = 60;

/// Seconds after which a data record is republished, or a provider record expires.
pub const REPUBLISH_TIME_SECS: u64 = 86_400;

/// Seconds between UPnP port-forward re-assertions.
pub const UPNP_RELEASE_INTERVAL_SECS: u64 = 3600;

/// Maximum accepted datagram size; larger inbound messages are dropped unread.
pub const MAX_DATA_SIZE: usize = 64 * 1024;

/// Error types for DHT operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// No reply arrived within `NET_TIMEOUT`.
    #[error("request timed out")]
    Timeout,

    /// A record or reply signature failed verification.
    #[error("invalid signature")]
    InvalidSignature,

    /// `hash(pubkey) != claimed id` during an identify exchange.
    #[error("identity mismatch: claimed {claimed}, derived {derived}")]
    IdentityMismatch { claimed: String, derived: String },

    /// A store request arrived for a key that is already present.
    #[error("duplicate store for existing key")]
    DuplicateStore,

    /// A provider record's expiry is not within `REPUBLISH_TIME` of now.
    #[error("provider record expiry out of range")]
    ExpiryOutOfRange,

    /// Decoding a wire message or payload failed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// An inbound datagram exceeded `MAX_DATA_SIZE`.
    #[error("oversized datagram: {size} bytes exceeds {max} bytes")]
    OversizedDatagram { size: usize, max: usize },

    /// The routing-table leaf is full and not eligible to split.
    #[error("bucket full")]
    BucketFull,

    /// Bootstrap failed to reach any seed node.
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// Transport-level send/receive failure.
    #[error("network error: {0}")]
    Network(String),

    /// Cryptographic error from the signing collaborator.
    #[error("crypto error: {0}")]
    Crypto(#[from] warren_crypto::CryptoError),
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;
