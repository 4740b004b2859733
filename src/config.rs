use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A regional leader reachable over the cross-region surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionPeer {
    pub region_id: String,
    /// host:port of the peer leader's region listener.
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub default_timeout_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            min_timeout_ms: 1_000,
            max_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique id within the region.
    pub node_id: String,
    pub region_id: String,
    /// Raft listener addresses of the same-region peers (excluding self).
    pub peers: Vec<String>,
    /// Region listener addresses of the other regional leaders.
    pub region_peers: Vec<RegionPeer>,
    /// Base election timeout E; the timer fires after a random delay in [E, 2E].
    pub election_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub lease: LeaseConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            region_id: "default".to_string(),
            peers: Vec::new(),
            region_peers: Vec::new(),
            election_timeout_ms: 150,
            heartbeat_interval_ms: 50,
            lease: LeaseConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Normalize a client-supplied lease duration: non-positive values fall
    /// back to the default, everything else is clamped to [min, max].
    pub fn clamp_timeout(&self, requested_ms: i64) -> u64 {
        if requested_ms <= 0 {
            return self.lease.default_timeout_ms;
        }
        (requested_ms as u64).clamp(self.lease.min_timeout_ms, self.lease.max_timeout_ms)
    }

    /// Deadline for a single inter-node or inter-region RPC. A stuck peer must
    /// not hold up replication or quorum counting longer than an election.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }
}
