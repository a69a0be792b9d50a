//! WolfChat Configuration
//!
//! This module provides configuration structures for a WolfChat node:
//! identity, static peer list, coordination timing and the client API.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::validation::DEFAULT_MAX_MESSAGE_LENGTH;

/// Main WolfChat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster (peer list) configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Coordination timing
    #[serde(default)]
    pub timing: TimingConfig,

    /// Input limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Client API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for peer RPC
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// A statically configured peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer node identifier
    pub id: String,
    /// Peer RPC address (host:port)
    pub address: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Known peer nodes
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Coordination timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Interval between heartbeat cycles in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Timeout of a single heartbeat RPC in milliseconds
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Consecutive missed heartbeats before a peer is marked failed
    #[serde(default = "default_max_consecutive_heartbeat_failures")]
    pub max_consecutive_heartbeat_failures: u32,

    /// Interval between stale-member cleanup cycles in seconds
    #[serde(default = "default_membership_cleanup_interval_secs")]
    pub membership_cleanup_interval_secs: u64,

    /// Inactivity after which a member is evicted, in seconds
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    /// Timeout for forwarding and broadcast RPCs in milliseconds
    #[serde(default = "default_peer_rpc_timeout_ms")]
    pub peer_rpc_timeout_ms: u64,

    /// Timeout for each 2PC phase RPC in milliseconds
    #[serde(default = "default_deletion_phase_timeout_ms")]
    pub deletion_phase_timeout_ms: u64,

    /// How long a participant keeps a prepared deletion before aborting locally, in seconds
    #[serde(default = "default_prepare_grace_period_secs")]
    pub prepare_grace_period_secs: u64,
}

/// Input limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message length in characters
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

/// Client API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the WebSocket/HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    2_000
}

fn default_max_consecutive_heartbeat_failures() -> u32 {
    3
}

fn default_membership_cleanup_interval_secs() -> u64 {
    60
}

fn default_inactivity_timeout_secs() -> u64 {
    900
}

fn default_peer_rpc_timeout_ms() -> u64 {
    5_000
}

fn default_deletion_phase_timeout_ms() -> u64 {
    5_000
}

fn default_prepare_grace_period_secs() -> u64 {
    30
}

fn default_max_message_length() -> usize {
    DEFAULT_MAX_MESSAGE_LENGTH
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8765".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_consecutive_heartbeat_failures: default_max_consecutive_heartbeat_failures(),
            membership_cleanup_interval_secs: default_membership_cleanup_interval_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            peer_rpc_timeout_ms: default_peer_rpc_timeout_ms(),
            deletion_phase_timeout_ms: default_deletion_phase_timeout_ms(),
            prepare_grace_period_secs: default_prepare_grace_period_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl TimingConfig {
    /// Heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat RPC timeout as Duration
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Cleanup interval as Duration
    pub fn membership_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.membership_cleanup_interval_secs)
    }

    /// Inactivity timeout as Duration
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    /// Peer RPC timeout as Duration
    pub fn peer_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_rpc_timeout_ms)
    }

    /// How long an administrator waits for broadcast acks before reporting
    /// the missing ones as delivery warnings. Half the peer RPC timeout, so a
    /// forwarded send is answered before the forwarder gives up on it.
    pub fn broadcast_ack_timeout(&self) -> Duration {
        self.peer_rpc_timeout() / 2
    }

    /// 2PC phase timeout as Duration
    pub fn deletion_phase_timeout(&self) -> Duration {
        Duration::from_millis(self.deletion_phase_timeout_ms)
    }

    /// Prepared-transaction grace period as Duration
    pub fn prepare_grace_period(&self) -> Duration {
        Duration::from_secs(self.prepare_grace_period_secs)
    }
}

impl ChatConfig {
    /// Minimal configuration for a node with no peers
    pub fn for_node(id: impl Into<String>, bind_address: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                id: id.into(),
                bind_address: bind_address.into(),
                advertise_address: None,
            },
            cluster: ClusterConfig::default(),
            timing: TimingConfig::default(),
            limits: LimitsConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ChatConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for peer in &self.cluster.peers {
            if peer.id.is_empty() || peer.address.is_empty() {
                return Err(crate::Error::Config(
                    "cluster.peers entries need both id and address".into(),
                ));
            }
            if peer.id == self.node.id {
                return Err(crate::Error::Config(format!(
                    "cluster.peers contains this node's own id '{}'",
                    peer.id
                )));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate peer id '{}' in cluster.peers",
                    peer.id
                )));
            }
        }

        let timing = &self.timing;
        if timing.heartbeat_interval_ms == 0
            || timing.heartbeat_timeout_ms == 0
            || timing.peer_rpc_timeout_ms == 0
            || timing.deletion_phase_timeout_ms == 0
            || timing.membership_cleanup_interval_secs == 0
            || timing.inactivity_timeout_secs == 0
        {
            return Err(crate::Error::Config("timing values must be non-zero".into()));
        }

        if timing.heartbeat_timeout_ms >= timing.heartbeat_interval_ms {
            return Err(crate::Error::Config(
                "timing.heartbeat_timeout_ms must be shorter than heartbeat_interval_ms".into(),
            ));
        }

        if timing.max_consecutive_heartbeat_failures == 0 {
            return Err(crate::Error::Config(
                "timing.max_consecutive_heartbeat_failures must be at least 1".into(),
            ));
        }

        if self.limits.max_message_length == 0 {
            return Err(crate::Error::Config("limits.max_message_length must be non-zero".into()));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[node]
id = "node-a"
bind_address = "0.0.0.0:7700"

[[cluster.peers]]
id = "node-b"
address = "10.0.0.2:7700"

[[cluster.peers]]
id = "node-c"
address = "10.0.0.3:7700"

[timing]
heartbeat_interval_ms = 10000
inactivity_timeout_secs = 600
"#;

    #[test]
    fn test_parse_config() {
        let config = ChatConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.node.id, "node-a");
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.timing.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.timing.inactivity_timeout(), Duration::from_secs(600));
        // Untouched values keep their defaults
        assert_eq!(config.timing.heartbeat_timeout(), Duration::from_secs(2));
        assert_eq!(config.timing.max_consecutive_heartbeat_failures, 3);
        assert_eq!(config.limits.max_message_length, 5000);
        assert_eq!(config.advertise_address(), "0.0.0.0:7700");
    }

    #[test]
    fn test_rejects_self_as_peer() {
        let toml = r#"
[node]
id = "node-a"
bind_address = "0.0.0.0:7700"

[[cluster.peers]]
id = "node-a"
address = "10.0.0.1:7700"
"#;
        assert!(matches!(ChatConfig::from_str(toml), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_rejects_heartbeat_timeout_longer_than_interval() {
        let mut config = ChatConfig::for_node("node-a", "127.0.0.1:7700");
        config.timing.heartbeat_timeout_ms = config.timing.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ChatConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cluster.peers[0].id, "node-b");
    }
}
