//! Peer Gateway
//!
//! Typed peer RPCs on top of a [`PeerTransport`]. Every call is bounded by a
//! timeout, and calls to a peer the health monitor has marked failed are
//! refused without touching the network. Timed-out calls are not retried.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Message, PeerTransport};
use crate::config::TimingConfig;
use crate::coordinator::{DeletionOutcome, Vote};
use crate::error::{Error, Result};
use crate::room::{ChatMessage, LeaveReason, Member, RoomSnapshot, RoomSummary};
use crate::state::PeerHealthMonitor;

/// A peer that did not acknowledge a broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub node_id: String,
    pub reason: String,
}

/// Typed peer RPC client
pub struct PeerGateway {
    /// This node's ID
    node_id: String,
    transport: Arc<dyn PeerTransport>,
    health: Arc<PeerHealthMonitor>,
    /// Timeout for forwarding and broadcast RPCs
    rpc_timeout: Duration,
    /// Timeout for each 2PC phase RPC
    phase_timeout: Duration,
}

impl PeerGateway {
    /// Create a new gateway
    pub fn new(
        node_id: String,
        transport: Arc<dyn PeerTransport>,
        health: Arc<PeerHealthMonitor>,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            node_id,
            transport,
            health,
            rpc_timeout: timing.peer_rpc_timeout(),
            phase_timeout: timing.deletion_phase_timeout(),
        }
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether the health monitor currently considers `node_id` failed
    pub async fn is_failed(&self, node_id: &str) -> bool {
        self.health.is_failed(node_id).await
    }

    /// Send a request, refusing failed peers and bounding the wait
    async fn call(&self, node_id: &str, message: Message, limit: Duration) -> Result<Message> {
        if self.health.is_failed(node_id).await {
            return Err(Error::PeerRpcFailure {
                node_id: node_id.to_string(),
                reason: "peer is marked failed".into(),
            });
        }

        let kind = message.type_name();
        match tokio::time::timeout(limit, self.transport.call(node_id, message)).await {
            Ok(Ok(Message::Error(remote))) => Err(Error::from_remote(node_id, remote)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                tracing::debug!("{} to {} failed: {}", kind, node_id, e);
                Err(e)
            }
            Err(_) => {
                tracing::debug!("{} to {} timed out", kind, node_id);
                Err(Error::PeerRpcTimeout {
                    node_id: node_id.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    /// Call a room's administrator, failing fast with `AdminUnreachable`
    async fn call_admin(&self, room_id: &str, administrator: &str, message: Message) -> Result<Message> {
        if self.health.is_failed(administrator).await {
            return Err(Error::AdminUnreachable {
                room_id: room_id.to_string(),
                node_id: administrator.to_string(),
            });
        }
        self.call(administrator, message, self.rpc_timeout).await
    }

    /// Forward a message to the room's administrator for sequencing.
    ///
    /// Returns the sequenced message and the peers that missed its broadcast.
    pub async fn forward_message(
        &self,
        administrator: &str,
        room_id: &str,
        sender: &str,
        content: &str,
        client_message_id: &str,
    ) -> Result<(ChatMessage, Vec<DeliveryFailure>)> {
        let request = Message::ForwardMessage {
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            client_message_id: client_message_id.to_string(),
            origin_node_id: self.node_id.clone(),
        };
        match self.call_admin(room_id, administrator, request).await? {
            Message::MessageAccepted { message, warnings } => Ok((message, warnings)),
            other => Err(unexpected(administrator, &other)),
        }
    }

    /// Ask the administrator to admit a member
    pub async fn join_room(
        &self,
        administrator: &str,
        room_id: &str,
        username: &str,
    ) -> Result<(Member, RoomSnapshot)> {
        let request = Message::JoinRoom {
            room_id: room_id.to_string(),
            username: username.to_string(),
            connected_node_id: self.node_id.clone(),
        };
        match self.call_admin(room_id, administrator, request).await? {
            Message::JoinAccepted { member, snapshot } => Ok((member, snapshot)),
            other => Err(unexpected(administrator, &other)),
        }
    }

    /// Ask the administrator to remove a member
    pub async fn leave_room(
        &self,
        administrator: &str,
        room_id: &str,
        username: &str,
        reason: LeaveReason,
    ) -> Result<Member> {
        let request = Message::LeaveRoom {
            room_id: room_id.to_string(),
            username: username.to_string(),
            reason,
        };
        match self.call_admin(room_id, administrator, request).await? {
            Message::LeaveAccepted { member } => Ok(member),
            other => Err(unexpected(administrator, &other)),
        }
    }

    /// Relay a client heartbeat to the administrator
    pub async fn touch_member(&self, administrator: &str, room_id: &str, username: &str) -> Result<()> {
        let request = Message::TouchMember {
            room_id: room_id.to_string(),
            username: username.to_string(),
        };
        match self.call_admin(room_id, administrator, request).await? {
            Message::Ack => Ok(()),
            other => Err(unexpected(administrator, &other)),
        }
    }

    /// Fetch the administrator's current state of a room
    pub async fn sync_room(&self, administrator: &str, room_id: &str) -> Result<RoomSnapshot> {
        let request = Message::SyncRoom {
            room_id: room_id.to_string(),
        };
        match self.call_admin(room_id, administrator, request).await? {
            Message::RoomState { snapshot } if snapshot.info.room_id == room_id => Ok(snapshot),
            other => Err(unexpected(administrator, &other)),
        }
    }

    /// Rooms administered by a peer
    pub async fn get_hosted_rooms(&self, node_id: &str) -> Result<Vec<RoomSummary>> {
        match self.call(node_id, Message::GetHostedRooms, self.rpc_timeout).await? {
            Message::HostedRooms { rooms, .. } => Ok(rooms),
            other => Err(unexpected(node_id, &other)),
        }
    }

    /// Deliver a broadcast (message or member event) and wait for the ack
    pub async fn deliver(&self, node_id: &str, message: Message) -> Result<()> {
        match self.call(node_id, message, self.rpc_timeout).await? {
            Message::Ack => Ok(()),
            other => Err(unexpected(node_id, &other)),
        }
    }

    /// Phase 1: collect a participant's vote. Any failure is an abort vote.
    pub async fn prepare_delete(&self, node_id: &str, transaction_id: &str, room_id: &str) -> Vote {
        let request = Message::PrepareDelete {
            transaction_id: transaction_id.to_string(),
            room_id: room_id.to_string(),
            coordinator_node_id: self.node_id.clone(),
        };
        match self.call(node_id, request, self.phase_timeout).await {
            Ok(Message::VoteResponse {
                transaction_id: voted,
                vote,
            }) if voted == transaction_id => vote,
            Ok(other) => Vote::Abort {
                reason: unexpected(node_id, &other).to_string(),
            },
            Err(e) => Vote::Abort {
                reason: e.to_string(),
            },
        }
    }

    /// Phase 2: tell a participant to commit
    pub async fn commit_delete(
        &self,
        node_id: &str,
        transaction_id: &str,
        room_id: &str,
    ) -> Result<DeletionOutcome> {
        let request = Message::CommitDelete {
            transaction_id: transaction_id.to_string(),
            room_id: room_id.to_string(),
        };
        self.decision(node_id, transaction_id, request).await
    }

    /// Phase 2: tell a participant to roll back
    pub async fn rollback_delete(
        &self,
        node_id: &str,
        transaction_id: &str,
        room_id: &str,
    ) -> Result<DeletionOutcome> {
        let request = Message::RollbackDelete {
            transaction_id: transaction_id.to_string(),
            room_id: room_id.to_string(),
        };
        self.decision(node_id, transaction_id, request).await
    }

    async fn decision(&self, node_id: &str, transaction_id: &str, request: Message) -> Result<DeletionOutcome> {
        match self.call(node_id, request, self.phase_timeout).await? {
            Message::DeletionAck {
                transaction_id: acked,
                outcome,
            } if acked == transaction_id => Ok(outcome),
            other => Err(unexpected(node_id, &other)),
        }
    }
}

fn unexpected(node_id: &str, response: &Message) -> Error {
    let reason = match response {
        Message::VoteResponse { transaction_id, .. } | Message::DeletionAck { transaction_id, .. } => {
            format!("{} for another transaction {}", response.type_name(), transaction_id)
        }
        other => format!("unexpected response {}", other.type_name()),
    };
    Error::PeerRpcFailure {
        node_id: node_id.to_string(),
        reason,
    }
}
