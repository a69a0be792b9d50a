//! Peer Health Monitoring
//!
//! Tracks the liveness of every known peer through periodic heartbeats.
//! Each peer moves through `healthy -> degraded -> failed` on consecutive
//! misses and returns to `healthy` on the first successful heartbeat.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::events::{self, EventSender, NodeEvent};
use crate::network::{Message, PeerTransport};

/// Health status of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Last heartbeat succeeded
    Healthy,
    /// At least one missed heartbeat, below the failure threshold
    Degraded,
    /// Missed the threshold of consecutive heartbeats
    Failed,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Health of a single peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Peer node identifier
    pub node_id: String,
    /// Time of the last successful heartbeat
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Current status
    pub status: HealthStatus,
    /// Heartbeats missed in a row
    pub consecutive_failures: u32,
}

impl NodeHealth {
    /// A newly known peer starts healthy
    pub fn new(node_id: String) -> Self {
        Self {
            node_id,
            last_heartbeat_at: None,
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
        }
    }
}

/// Health summary for status reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total_peers: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
}

/// Peer health monitor
pub struct PeerHealthMonitor {
    /// This node's ID
    node_id: String,
    /// This node's advertised peer RPC address
    address: String,
    /// Known peers
    peers: RwLock<HashMap<String, NodeHealth>>,
    /// Transport used to send heartbeats
    transport: Arc<dyn PeerTransport>,
    /// Timeout of a single heartbeat
    heartbeat_timeout: Duration,
    /// Consecutive misses before a peer is failed
    max_failures: u32,
    /// Node event channel
    events: EventSender,
}

impl PeerHealthMonitor {
    /// Create a new monitor
    pub fn new(
        node_id: String,
        address: String,
        transport: Arc<dyn PeerTransport>,
        heartbeat_timeout: Duration,
        max_failures: u32,
        events: EventSender,
    ) -> Self {
        Self {
            node_id,
            address,
            peers: RwLock::new(HashMap::new()),
            transport,
            heartbeat_timeout,
            max_failures: max_failures.max(1),
            events,
        }
    }

    /// Start tracking a peer; known peers are left untouched
    pub async fn add_peer(&self, node_id: &str) {
        if node_id == self.node_id {
            return;
        }
        let mut peers = self.peers.write().await;
        if !peers.contains_key(node_id) {
            tracing::debug!("Tracking health of peer {}", node_id);
            peers.insert(node_id.to_string(), NodeHealth::new(node_id.to_string()));
        }
    }

    /// Get a peer's health
    pub async fn get(&self, node_id: &str) -> Option<NodeHealth> {
        self.peers.read().await.get(node_id).cloned()
    }

    /// Get a peer's status
    pub async fn status(&self, node_id: &str) -> Option<HealthStatus> {
        self.peers.read().await.get(node_id).map(|h| h.status)
    }

    /// Check if a peer is marked failed
    pub async fn is_failed(&self, node_id: &str) -> bool {
        self.status(node_id).await == Some(HealthStatus::Failed)
    }

    /// Health of every known peer, sorted by node id
    pub async fn all(&self) -> Vec<NodeHealth> {
        let peers = self.peers.read().await;
        let mut all: Vec<NodeHealth> = peers.values().cloned().collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    /// IDs of every known peer
    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// Record a successful heartbeat
    pub async fn record_success(&self, node_id: &str) -> Option<NodeEvent> {
        let mut peers = self.peers.write().await;
        let health = peers
            .entry(node_id.to_string())
            .or_insert_with(|| NodeHealth::new(node_id.to_string()));

        let previous = health.status;
        health.status = HealthStatus::Healthy;
        health.consecutive_failures = 0;
        health.last_heartbeat_at = Some(Utc::now());

        match previous {
            HealthStatus::Failed => {
                tracing::info!("Peer {} recovered", node_id);
                let event = NodeEvent::PeerRecovered {
                    node_id: node_id.to_string(),
                };
                events::publish(&self.events, event.clone());
                Some(event)
            }
            HealthStatus::Degraded => {
                tracing::info!("Peer {} is healthy again", node_id);
                None
            }
            HealthStatus::Healthy => None,
        }
    }

    /// Record a missed heartbeat
    pub async fn record_failure(&self, node_id: &str, reason: &str) -> Option<NodeEvent> {
        let mut peers = self.peers.write().await;
        let health = peers
            .entry(node_id.to_string())
            .or_insert_with(|| NodeHealth::new(node_id.to_string()));

        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        let previous = health.status;
        health.status = if health.consecutive_failures >= self.max_failures {
            HealthStatus::Failed
        } else {
            HealthStatus::Degraded
        };

        match (previous, health.status) {
            (HealthStatus::Failed, _) => None,
            (_, HealthStatus::Failed) => {
                tracing::warn!(
                    "Peer {} marked FAILED after {} missed heartbeats ({})",
                    node_id,
                    health.consecutive_failures,
                    reason
                );
                let event = NodeEvent::PeerFailed {
                    node_id: node_id.to_string(),
                };
                events::publish(&self.events, event.clone());
                Some(event)
            }
            (HealthStatus::Healthy, HealthStatus::Degraded) => {
                tracing::warn!("Peer {} degraded: {}", node_id, reason);
                None
            }
            _ => {
                tracing::debug!(
                    "Peer {} missed heartbeat {} ({})",
                    node_id,
                    health.consecutive_failures,
                    reason
                );
                None
            }
        }
    }

    /// Send one heartbeat to a peer
    async fn probe(&self, node_id: &str) -> Result<()> {
        let request = Message::Heartbeat {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
        };
        match tokio::time::timeout(self.heartbeat_timeout, self.transport.call(node_id, request))
            .await
        {
            Ok(Ok(Message::HeartbeatAck { .. })) => Ok(()),
            Ok(Ok(other)) => Err(Error::PeerRpcFailure {
                node_id: node_id.to_string(),
                reason: format!("unexpected heartbeat response {}", other.type_name()),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::PeerRpcTimeout {
                node_id: node_id.to_string(),
                timeout_ms: self.heartbeat_timeout.as_millis() as u64,
            }),
        }
    }

    /// Probe every known peer concurrently and apply the outcomes.
    ///
    /// Failed peers are probed too so that recovery is detected. Returns the
    /// failure and recovery transitions that happened in this cycle.
    pub async fn run_heartbeat_cycle(&self) -> Vec<NodeEvent> {
        let peer_ids = self.peer_ids().await;
        let probes = peer_ids.iter().map(|id| async move {
            let outcome = self.probe(id).await;
            (id.clone(), outcome)
        });
        let outcomes = futures::future::join_all(probes).await;

        let mut transitions = Vec::new();
        for (node_id, outcome) in outcomes {
            let transition = match outcome {
                Ok(()) => self.record_success(&node_id).await,
                Err(e) => self.record_failure(&node_id, &e.to_string()).await,
            };
            transitions.extend(transition);
        }
        transitions
    }

    /// Get health summary
    pub async fn summary(&self) -> HealthSummary {
        let peers = self.peers.read().await;
        let mut summary = HealthSummary {
            total_peers: peers.len(),
            ..Default::default()
        };
        for health in peers.values() {
            match health.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::LocalNetwork;

    fn monitor(network: &LocalNetwork, events: EventSender) -> PeerHealthMonitor {
        PeerHealthMonitor::new(
            "node-a".to_string(),
            "127.0.0.1:7701".to_string(),
            network.transport(),
            Duration::from_millis(50),
            3,
            events,
        )
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let network = LocalNetwork::new();
        let health = monitor(&network, events::channel());
        health.add_peer("node-b").await;

        assert_eq!(health.status("node-b").await, Some(HealthStatus::Healthy));

        assert!(health.record_failure("node-b", "timeout").await.is_none());
        assert_eq!(health.status("node-b").await, Some(HealthStatus::Degraded));
        assert!(health.record_failure("node-b", "timeout").await.is_none());
        assert_eq!(health.status("node-b").await, Some(HealthStatus::Degraded));

        let event = health.record_failure("node-b", "timeout").await;
        assert!(matches!(event, Some(NodeEvent::PeerFailed { .. })));
        assert!(health.is_failed("node-b").await);

        // Further misses do not re-emit
        assert!(health.record_failure("node-b", "timeout").await.is_none());

        let event = health.record_success("node-b").await;
        assert!(matches!(event, Some(NodeEvent::PeerRecovered { .. })));
        let state = health.get("node-b").await.unwrap();
        assert_eq!(state.status, HealthStatus::Healthy);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_degraded_recovers_without_event() {
        let network = LocalNetwork::new();
        let health = monitor(&network, events::channel());
        health.add_peer("node-b").await;

        health.record_failure("node-b", "timeout").await;
        assert!(health.record_success("node-b").await.is_none());
        assert_eq!(health.status("node-b").await, Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_heartbeat_cycle_marks_down_peer_failed() {
        let network = LocalNetwork::new();
        let health = monitor(&network, events::channel());
        // node-b is known but has no node registered on the network
        health.add_peer("node-b").await;

        for _ in 0..2 {
            assert!(health.run_heartbeat_cycle().await.is_empty());
        }
        let transitions = health.run_heartbeat_cycle().await;
        assert_eq!(
            transitions,
            vec![NodeEvent::PeerFailed {
                node_id: "node-b".into()
            }]
        );
        assert_eq!(health.summary().await.failed, 1);
    }

    #[tokio::test]
    async fn test_self_is_never_tracked() {
        let network = LocalNetwork::new();
        let health = monitor(&network, events::channel());
        health.add_peer("node-a").await;
        assert!(health.all().await.is_empty());
    }
}
