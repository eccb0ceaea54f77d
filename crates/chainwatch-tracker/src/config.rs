//! Tracker configuration.

use bitcoin::Network;
use chainwatch_primitives::GapLimits;
use std::time::Duration;

/// Runtime configuration of the tracker engine.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Network the daemon runs on. Addresses are rendered and validated
    /// against it.
    pub network: Network,
    /// Gap limits applied when expanding HD account windows.
    pub gap_limits: GapLimits,
    /// Period of the mempool buffer flush.
    pub mempool_flush_interval: Duration,
    /// Period of the unconfirmed-transaction reconciliation pass.
    pub unconfirmed_check_interval: Duration,
    /// Maximum number of blocks the index may lag behind the daemon's
    /// header height before mempool ingestion is suspended.
    pub activity_gap_tolerance: u32,
    /// Maximum number of txids remembered by the dedup cache.
    pub dedup_capacity: usize,
    /// Maximum age of a dedup cache entry.
    pub dedup_ttl: Duration,
}

impl TrackerConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            gap_limits: GapLimits::default(),
            mempool_flush_interval: Duration::from_secs(2),
            unconfirmed_check_interval: Duration::from_secs(300),
            activity_gap_tolerance: 6,
            dedup_capacity: 100_000,
            dedup_ttl: Duration::from_secs(2 * 3600),
        }
    }
}
