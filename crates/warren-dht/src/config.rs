//! Node configuration: tunable protocol constants, bind address, and seeds.

use serde::{Deserialize, Serialize};

use crate::addr::Addr;
use crate::{DhtError, Result};
use crate::{ADDR_LIMIT, ALPHA, K, MAX_STALE, NET_TIMEOUT_SECS, REFRESH_INTERVAL_SECS, REFRESH_TIME_SECS, REPL_CACHE_SIZE, REPUBLISH_INTERVAL_SECS, REPUBLISH_TIME_SECS};

/// A bootstrap seed: an address plus the node's expected id, used the same
/// way the teacher's `SeedNode` authenticates seeds before trusting them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeedNode {
    pub addr: Addr,
}

/// Tunable DHT parameters plus the local bind address and seed list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub bind_addr: Addr,
    pub seeds: Vec<SeedNode>,
    pub k: usize,
    pub alpha: usize,
    pub addr_limit: usize,
    pub max_stale: u32,
    pub repl_cache_size: usize,
    pub net_timeout_secs: u64,
    pub refresh_interval_secs: u64,
    pub refresh_time_secs: u64,
    pub republish_interval_secs: u64,
    pub republish_time_secs: u64,
    /// Desired quorum for value lookups.
    pub quorum: usize,
    /// Number of disjoint lookup paths (1 = single-path).
    pub disjoint_paths: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: Addr::new(crate::addr::Transport::Udp, "0.0.0.0", 6881),
            seeds: Vec::new(),
            k: K,
            alpha: ALPHA,
            addr_limit: ADDR_LIMIT,
            max_stale: MAX_STALE,
            repl_cache_size: REPL_CACHE_SIZE,
            net_timeout_secs: NET_TIMEOUT_SECS,
            refresh_interval_secs: REFRESH_INTERVAL_SECS,
            refresh_time_secs: REFRESH_TIME_SECS,
            republish_interval_secs: REPUBLISH_INTERVAL_SECS,
            republish_time_secs: REPUBLISH_TIME_SECS,
            quorum: 1,
            disjoint_paths: 1,
        }
    }
}

impl NodeConfig {
    pub fn new(seeds: Vec<SeedNode>) -> Self {
        Self {
            seeds,
            ..Default::default()
        }
    }

    /// Validate the configuration, following the `BootstrapConfig::validate`
    /// pattern: reject inconsistent quorum parameters and degenerate sizes.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DhtError::BootstrapFailed("k must be at least 1".to_string()));
        }
        if self.alpha == 0 {
            return Err(DhtError::BootstrapFailed("alpha must be at least 1".to_string()));
        }
        if self.disjoint_paths == 0 {
            return Err(DhtError::BootstrapFailed("disjoint_paths must be at least 1".to_string()));
        }
        if self.quorum == 0 {
            return Err(DhtError::BootstrapFailed("quorum must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_k_rejected() {
        let config = NodeConfig { k: 0, ..NodeConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_quorum_rejected() {
        let config = NodeConfig { quorum: 0, ..NodeConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_new_with_seeds() {
        let seed = SeedNode {
            addr: Addr::new(crate::addr::Transport::Udp, "198.51.100.1", 6881),
        };
        let config = NodeConfig::new(vec![seed]);
        assert_eq!(config.seeds.len(), 1);
        assert!(config.validate().is_ok());
    }
}
