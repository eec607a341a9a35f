//! Configuration types for the Raft node.
//!
//! This module defines the configuration structures used to assemble a node:
//! the consensus timing and queue sizing in [`RaftConfig`], and the
//! process-level inputs in [`ServerConfig`].

use meshkv_overlay::OverlayConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Process-level configuration of a node.
///
/// # Examples
///
/// ```
/// use meshkv_raft::ServerConfig;
///
/// let config = ServerConfig {
///     min_peer_count: 3,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Number of overlay peers required before a cluster is created, and
    /// below which a running cluster is considered lost.
    /// Default: 3
    #[serde(default = "default_min_peer_count")]
    pub min_peer_count: usize,

    /// How this node joins the overlay.
    #[serde(default)]
    pub overlay: OverlayConfig,

    /// Consensus timing and queue sizing.
    #[serde(default)]
    pub raft: RaftConfig,
}

fn default_min_peer_count() -> usize {
    3
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            min_peer_count: default_min_peer_count(),
            overlay: OverlayConfig::default(),
            raft: RaftConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validates the server configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `min_peer_count` is 0
    /// - the overlay or Raft configuration is invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.min_peer_count == 0 {
            return Err("min_peer_count must be > 0".to_string());
        }
        self.overlay.validate()?;
        self.raft.validate()?;
        Ok(())
    }
}

/// Raft timing and resource configuration.
///
/// # Examples
///
/// ```
/// use meshkv_raft::RaftConfig;
///
/// // Use default values
/// let config = RaftConfig::default();
///
/// // Or speed everything up for a local cluster
/// let config = RaftConfig {
///     tick_interval_ms: 10,
///     bootstrap_poll_ms: 20,
///     membership_poll_ms: 20,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Interval between consensus ticks in milliseconds.
    /// Default: 100ms
    pub tick_interval_ms: u64,

    /// Ticks without a leader before a follower campaigns.
    /// Default: 10
    pub election_tick: usize,

    /// Ticks between leader heartbeats.
    /// Default: 1
    pub heartbeat_tick: usize,

    /// Interval between bootstrap peer-count checks in milliseconds.
    /// Default: 1000ms
    pub bootstrap_poll_ms: u64,

    /// Interval between membership checks in milliseconds.
    /// Default: 1000ms
    pub membership_poll_ms: u64,

    /// Number of applied entries between store snapshots.
    /// Default: 10,000
    pub snapshot_interval_entries: u64,

    /// Maximum size of the entries in one append message, in bytes.
    /// Default: 1MB
    pub max_size_per_msg: u64,

    /// Maximum in-flight append messages per follower.
    /// Default: 256
    pub max_inflight_msgs: usize,

    /// Ticks after which an uncommitted configuration change is proposed again.
    /// Default: 50
    pub conf_change_retry_ticks: usize,

    /// Capacity of the inter-component queues.
    /// Default: 1024
    pub queue_capacity: usize,

    /// Capacity of the unreachable-peer notification queue.
    /// Default: 10,000
    pub unreachable_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            election_tick: 10,
            heartbeat_tick: 1,
            bootstrap_poll_ms: 1000,
            membership_poll_ms: 1000,
            snapshot_interval_entries: 10_000,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            conf_change_retry_ticks: 50,
            queue_capacity: 1024,
            unreachable_capacity: 10_000,
        }
    }
}

impl RaftConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn bootstrap_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bootstrap_poll_ms)
    }

    pub fn membership_poll_interval(&self) -> Duration {
        Duration::from_millis(self.membership_poll_ms)
    }

    /// Validates the Raft configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - any interval is 0
    /// - `election_tick` <= `heartbeat_tick`
    /// - any queue capacity is 0
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be > 0".to_string());
        }
        if self.bootstrap_poll_ms == 0 || self.membership_poll_ms == 0 {
            return Err("poll intervals must be > 0".to_string());
        }
        if self.heartbeat_tick == 0 {
            return Err("heartbeat_tick must be > 0".to_string());
        }
        // raft-rs refuses an election timeout that is not above the heartbeat
        if self.election_tick <= self.heartbeat_tick {
            return Err(format!(
                "election_tick ({}) must be greater than heartbeat_tick ({})",
                self.election_tick, self.heartbeat_tick
            ));
        }
        if self.snapshot_interval_entries == 0 {
            return Err("snapshot_interval_entries must be > 0".to_string());
        }
        if self.conf_change_retry_ticks == 0 {
            return Err("conf_change_retry_ticks must be > 0".to_string());
        }
        if self.queue_capacity == 0 || self.unreachable_capacity == 0 {
            return Err("queue capacities must be > 0".to_string());
        }
        Ok(())
    }
}
