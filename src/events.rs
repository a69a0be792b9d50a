//! Node Events
//!
//! Membership and peer-health changes observed by this node, published on a
//! broadcast channel held by the node context.

use serde::Serialize;

use crate::room::{LeaveReason, Member};

/// Capacity of the node event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A state change worth telling observers about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    /// A member was admitted by this node as administrator
    MemberJoined { room_id: String, member: Member },
    /// A member was removed by this node as administrator
    MemberLeft {
        room_id: String,
        member: Member,
        reason: LeaveReason,
    },
    /// A peer transitioned into `failed`
    PeerFailed { node_id: String },
    /// A peer transitioned out of `failed`
    PeerRecovered { node_id: String },
    /// A committed deletion removed a room from this node
    RoomDeleted {
        room_id: String,
        transaction_id: String,
    },
}

impl NodeEvent {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            NodeEvent::MemberJoined { .. } => "member_joined",
            NodeEvent::MemberLeft { .. } => "member_left",
            NodeEvent::PeerFailed { .. } => "peer_failed",
            NodeEvent::PeerRecovered { .. } => "peer_recovered",
            NodeEvent::RoomDeleted { .. } => "room_deleted",
        }
    }
}

/// Sender half of the node event channel
pub type EventSender = tokio::sync::broadcast::Sender<NodeEvent>;

/// Create the node event channel
pub fn channel() -> EventSender {
    let (tx, _) = tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

/// Publish an event; having no subscribers is not an error
pub fn publish(events: &EventSender, event: NodeEvent) {
    tracing::debug!("Node event: {}", event.name());
    let _ = events.send(event);
}
