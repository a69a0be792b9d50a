//! Peer Protocol
//!
//! Defines the wire protocol for request/response RPC between nodes.

use serde::{Deserialize, Serialize};

use super::DeliveryFailure;
use crate::coordinator::{DeletionOutcome, Vote};
use crate::error::Error;
use crate::room::{
    ChatMessage, LeaveReason, Member, MemberEvent, ReplicaUpdate, Revision, RoomSnapshot, RoomSummary,
};

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Health ==========
    /// Liveness probe
    Heartbeat { node_id: String, address: String },

    /// Heartbeat response
    HeartbeatAck { node_id: String },

    // ========== Messages ==========
    /// Send a message through the room's administrator
    ForwardMessage {
        room_id: String,
        sender: String,
        content: String,
        client_message_id: String,
        origin_node_id: String,
    },

    /// Message sequenced by the administrator, with the peers that did not
    /// acknowledge its broadcast in time
    MessageAccepted {
        message: ChatMessage,
        warnings: Vec<DeliveryFailure>,
    },

    /// Sequenced message pushed from the administrator to a replica
    MessageBroadcast { message: ChatMessage, revision: Revision },

    /// Membership change pushed from the administrator to a replica
    MemberEvent { event: MemberEvent, revision: Revision },

    /// Generic acknowledgement
    Ack,

    // ========== Membership ==========
    /// Join request forwarded to the administrator
    JoinRoom {
        room_id: String,
        username: String,
        connected_node_id: String,
    },

    /// Join accepted, with the room as it was right after the join
    JoinAccepted {
        member: Member,
        snapshot: RoomSnapshot,
    },

    /// Leave request forwarded to the administrator
    LeaveRoom {
        room_id: String,
        username: String,
        reason: LeaveReason,
    },

    /// Leave accepted
    LeaveAccepted { member: Member },

    /// Client heartbeat relayed to the administrator
    TouchMember { room_id: String, username: String },

    /// Replica asks the administrator for the current room state
    SyncRoom { room_id: String },

    /// Authoritative room state
    RoomState { snapshot: RoomSnapshot },

    // ========== Discovery ==========
    /// Ask a peer for the rooms it administers
    GetHostedRooms,

    /// Rooms administered by the responding node
    HostedRooms {
        node_id: String,
        rooms: Vec<RoomSummary>,
    },

    // ========== Deletion (2PC) ==========
    /// Phase 1 request
    PrepareDelete {
        transaction_id: String,
        room_id: String,
        coordinator_node_id: String,
    },

    /// Phase 1 vote
    VoteResponse { transaction_id: String, vote: Vote },

    /// Phase 2 commit
    CommitDelete {
        transaction_id: String,
        room_id: String,
    },

    /// Phase 2 rollback
    RollbackDelete {
        transaction_id: String,
        room_id: String,
    },

    /// Phase 2 acknowledgement
    DeletionAck {
        transaction_id: String,
        outcome: DeletionOutcome,
    },

    // ========== Errors ==========
    /// Request failed on the remote node
    Error(RemoteError),
}

impl Message {
    /// Wrap a replica update for broadcast
    pub fn broadcast(revision: Revision, update: ReplicaUpdate) -> Self {
        match update {
            ReplicaUpdate::Message(message) => Message::MessageBroadcast { message, revision },
            ReplicaUpdate::Member(event) => Message::MemberEvent { event, revision },
        }
    }

    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatAck { .. } => "HeartbeatAck",
            Message::ForwardMessage { .. } => "ForwardMessage",
            Message::MessageAccepted { .. } => "MessageAccepted",
            Message::MessageBroadcast { .. } => "MessageBroadcast",
            Message::MemberEvent { .. } => "MemberEvent",
            Message::Ack => "Ack",
            Message::JoinRoom { .. } => "JoinRoom",
            Message::JoinAccepted { .. } => "JoinAccepted",
            Message::LeaveRoom { .. } => "LeaveRoom",
            Message::LeaveAccepted { .. } => "LeaveAccepted",
            Message::TouchMember { .. } => "TouchMember",
            Message::SyncRoom { .. } => "SyncRoom",
            Message::RoomState { .. } => "RoomState",
            Message::GetHostedRooms => "GetHostedRooms",
            Message::HostedRooms { .. } => "HostedRooms",
            Message::PrepareDelete { .. } => "PrepareDelete",
            Message::VoteResponse { .. } => "VoteResponse",
            Message::CommitDelete { .. } => "CommitDelete",
            Message::RollbackDelete { .. } => "RollbackDelete",
            Message::DeletionAck { .. } => "DeletionAck",
            Message::Error(_) => "Error",
        }
    }
}

/// Error reported by a remote node in place of a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    RoomNotFound { room_id: String },
    MemberNotFound { room_id: String, username: String },
    DuplicateMember { room_id: String, username: String },
    RoomBusy { room_id: String, reason: String },
    NotAdministrator { room_id: String, administrator: String },
    InvalidInput { field: String, reason: String },
    TransactionNotFound { transaction_id: String },
    Other { code: String, message: String },
}

impl From<&Error> for RemoteError {
    fn from(err: &Error) -> Self {
        match err {
            Error::RoomNotFound(room_id) => RemoteError::RoomNotFound {
                room_id: room_id.clone(),
            },
            Error::MemberNotFound { room_id, username } => RemoteError::MemberNotFound {
                room_id: room_id.clone(),
                username: username.clone(),
            },
            Error::DuplicateMember { room_id, username } => RemoteError::DuplicateMember {
                room_id: room_id.clone(),
                username: username.clone(),
            },
            Error::RoomBusy { room_id, reason } => RemoteError::RoomBusy {
                room_id: room_id.clone(),
                reason: reason.clone(),
            },
            Error::NotAdministrator {
                room_id,
                administrator,
            } => RemoteError::NotAdministrator {
                room_id: room_id.clone(),
                administrator: administrator.clone(),
            },
            Error::InvalidInput { field, reason } => RemoteError::InvalidInput {
                field: field.to_string(),
                reason: reason.clone(),
            },
            Error::TransactionNotFound(transaction_id) => RemoteError::TransactionNotFound {
                transaction_id: transaction_id.clone(),
            },
            other => RemoteError::Other {
                code: other.code().to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest accepted frame body
    pub const MAX_LENGTH: u32 = 64 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_message_serialization() {
        let msg = Message::broadcast(
            9,
            ReplicaUpdate::Message(ChatMessage {
                message_id: "c-1".into(),
                room_id: "room-1".into(),
                sender: "alice".into(),
                content: "hi".into(),
                sequence_number: Some(7),
                timestamp: Some(Utc::now()),
            }),
        );

        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();

        match restored {
            Message::MessageBroadcast { message, revision } => {
                assert_eq!(revision, 9);
                assert_eq!(message.sequence_number, Some(7));
                assert_eq!(message.content, "hi");
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[test]
    fn test_remote_error_restores_typed_error() {
        let original = Error::MemberNotFound {
            room_id: "room-1".into(),
            username: "bob".into(),
        };
        let remote = RemoteError::from(&original);
        let restored = Error::from_remote("node-a", remote);
        assert!(matches!(
            restored,
            Error::MemberNotFound { ref room_id, ref username } if room_id == "room-1" && username == "bob"
        ));

        let remote = RemoteError::from(&Error::Internal("boom".into()));
        assert!(matches!(
            Error::from_remote("node-a", remote),
            Error::PeerRpcFailure { .. }
        ));
    }
}
