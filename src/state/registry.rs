//! Peer Registry
//!
//! Resolves peer node ids to their RPC addresses.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::PeerConfig;
use crate::error::{Error, Result};

/// A known peer and its address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub node_id: String,
    pub address: String,
}

/// Registry of peer addresses
pub struct PeerRegistry {
    /// node_id -> address
    peers: RwLock<HashMap<String, String>>,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Build a registry from the static peer list
    pub fn from_config(peers: &[PeerConfig]) -> Self {
        let map = peers
            .iter()
            .map(|p| (p.id.clone(), p.address.clone()))
            .collect();
        Self {
            peers: RwLock::new(map),
        }
    }

    /// Register or update a peer. Returns true if the peer was unknown.
    pub async fn register(&self, node_id: &str, address: &str) -> bool {
        let mut peers = self.peers.write().await;
        match peers.insert(node_id.to_string(), address.to_string()) {
            None => {
                tracing::info!("Registered peer {} at {}", node_id, address);
                true
            }
            Some(old) if old != address => {
                tracing::info!("Peer {} moved from {} to {}", node_id, old, address);
                false
            }
            Some(_) => false,
        }
    }

    /// Resolve a peer address
    pub async fn resolve(&self, node_id: &str) -> Result<String> {
        self.peers
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound(node_id.to_string()))
    }

    /// Address of a peer, if known
    pub async fn address_of(&self, node_id: &str) -> Option<String> {
        self.peers.read().await.get(node_id).cloned()
    }

    /// All known peers, sorted by node id
    pub async fn all(&self) -> Vec<PeerEntry> {
        let peers = self.peers.read().await;
        let mut all: Vec<PeerEntry> = peers
            .iter()
            .map(|(node_id, address)| PeerEntry {
                node_id: node_id.clone(),
                address: address.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    /// IDs of all known peers
    pub async fn ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
