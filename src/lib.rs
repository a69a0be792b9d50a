//! WolfChat - Peer-to-peer group chat
//!
//! A cluster of equal nodes serving chat rooms to WebSocket clients. Each
//! room is administered by the node that created it: the administrator
//! assigns message sequence numbers, admits and removes members, and pushes
//! every change to the nodes whose clients have joined. Those nodes keep
//! replicas that apply the administrator's updates in revision order.
//!
//! # Features
//!
//! - Per-room total message order with client-side retry deduplication
//! - Remote joins with snapshot transfer and in-order replica catch-up
//! - Heartbeat-based peer failure detection and member eviction
//! - Inactive member cleanup
//! - Unanimous two-phase-commit room deletion
//! - Local and cluster-wide room listings

pub mod api;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod network;
pub mod node;
pub mod room;
pub mod session;
pub mod state;
pub mod validation;

#[cfg(test)]
mod test_utils;

pub use config::ChatConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ChatConfig;
    pub use crate::coordinator::{DeletionOutcome, DeletionReport};
    pub use crate::error::{Error, Result};
    pub use crate::network::{Message, PeerHandler, PeerTransport};
    pub use crate::node::ChatNode;
    pub use crate::room::{ChatMessage, Member, RoomSnapshot, RoomSummary};
    pub use crate::session::{ClientEvent, ClientRequest, RoomScope};
}
