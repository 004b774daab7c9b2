//! Node configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::envelope::{channel_name, DEFAULT_CHANNEL_PREFIX};

/// Tunables for a single node.
///
/// Every field has a default so partial JSON files are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Resource the nodes coordinate around; names the channel
    #[serde(default = "default_resource")]
    pub resource: String,

    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Hop budget for frames built without an explicit TTL
    #[serde(default = "default_ttl")]
    pub default_ttl: u32,

    /// How long an election waits for a higher-ranked node (default: 100ms)
    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,

    /// How long `connect` waits for the first acknowledgement (default: 500ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How long `start` waits for leadership to settle (default: 2s)
    #[serde(default = "default_leadership_timeout")]
    pub leadership_timeout_ms: u64,

    /// Quiet period before a drained category counts as settled
    #[serde(default = "default_drain_grace")]
    pub drain_grace_ms: u64,

    /// Followers heartbeat the leader at this interval; off when unset
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,

    /// Neighbors silent for longer than this are evicted; off when unset
    #[serde(default)]
    pub neighbor_timeout_ms: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            resource: default_resource(),
            channel_prefix: default_channel_prefix(),
            default_ttl: default_ttl(),
            election_timeout_ms: default_election_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            leadership_timeout_ms: default_leadership_timeout(),
            drain_grace_ms: default_drain_grace(),
            heartbeat_interval_ms: None,
            neighbor_timeout_ms: None,
        }
    }
}

impl NodeConfig {
    pub fn channel(&self) -> String {
        channel_name(&self.resource, &self.channel_prefix)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn leadership_timeout(&self) -> Duration {
        Duration::from_millis(self.leadership_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

fn default_resource() -> String {
    "default".to_string()
}

fn default_channel_prefix() -> String {
    DEFAULT_CHANNEL_PREFIX.to_string()
}

fn default_ttl() -> u32 {
    3
}

fn default_election_timeout() -> u64 {
    100
}

fn default_connect_timeout() -> u64 {
    500
}

fn default_leadership_timeout() -> u64 {
    2_000
}

fn default_drain_grace() -> u64 {
    10
}
