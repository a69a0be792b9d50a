//! Node Context
//!
//! Everything a node shares between its client sessions, peer handler and
//! background loops. Built once at startup and passed around by `Arc`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::ChatConfig;
use crate::coordinator::{PeerOutboxes, PendingJoins};
use crate::events::{self, EventSender};
use crate::network::{PeerGateway, PeerTransport};
use crate::room::{MembershipTracker, RoomStore};
use crate::session::SessionRegistry;
use crate::state::{PeerHealthMonitor, PeerRegistry};

/// Shared state of one node
pub struct NodeContext {
    pub config: ChatConfig,
    pub store: Arc<RoomStore>,
    pub membership: MembershipTracker,
    pub health: Arc<PeerHealthMonitor>,
    pub registry: Arc<PeerRegistry>,
    pub gateway: Arc<PeerGateway>,
    pub outboxes: PeerOutboxes,
    pub sessions: SessionRegistry,
    pub pending_joins: PendingJoins,
    pub events: EventSender,
    pub started_at: DateTime<Utc>,
}

impl NodeContext {
    /// Wire up the node's components over `transport`
    pub fn new(config: ChatConfig, transport: Arc<dyn PeerTransport>, registry: Arc<PeerRegistry>) -> Self {
        let node_id = config.node.id.clone();
        let events = events::channel();
        let store = Arc::new(RoomStore::new(node_id.clone()));
        let membership = MembershipTracker::new(
            store.clone(),
            events.clone(),
            config.timing.inactivity_timeout(),
        );
        let health = Arc::new(PeerHealthMonitor::new(
            node_id.clone(),
            config.advertise_address().to_string(),
            transport.clone(),
            config.timing.heartbeat_timeout(),
            config.timing.max_consecutive_heartbeat_failures,
            events.clone(),
        ));
        let gateway = Arc::new(PeerGateway::new(
            node_id,
            transport,
            health.clone(),
            &config.timing,
        ));
        let outboxes = PeerOutboxes::new(gateway.clone());

        Self {
            config,
            store,
            membership,
            health,
            registry,
            gateway,
            outboxes,
            sessions: SessionRegistry::new(),
            pending_joins: PendingJoins::new(),
            events,
            started_at: Utc::now(),
        }
    }

    /// This node's ID
    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }

    /// Address peers use to reach this node
    pub fn advertise_address(&self) -> &str {
        self.config.advertise_address()
    }
}
