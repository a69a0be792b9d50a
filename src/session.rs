//! Client Sessions
//!
//! Connected clients, the rooms each one is bound to, and the JSON messages
//! exchanged with them. Every session has an unbounded event channel drained
//! by its transport task, so fan-out never waits on a slow client.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::coordinator::{DeletionOutcome, DeletionReport};
use crate::error::Error;
use crate::network::DeliveryFailure;
use crate::room::{
    ChatMessage, LeaveReason, Member, MemberEvent, ReplicaUpdate, RoomInfo, RoomSnapshot, RoomSummary,
};

/// Identifier of a connected client session
pub type SessionId = u64;

/// Which rooms a listing covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomScope {
    /// Rooms administered by the node the client is connected to
    #[default]
    Local,
    /// Rooms administered by any reachable node
    Global,
}

/// Request sent by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    CreateRoom {
        name: String,
        #[serde(default)]
        description: Option<String>,
        creator: String,
    },
    ListRooms {
        #[serde(default)]
        scope: RoomScope,
    },
    JoinRoom {
        room_id: String,
        username: String,
        /// Administrator of the room, as shown in a global listing
        #[serde(default)]
        node_id: Option<String>,
    },
    LeaveRoom {
        room_id: String,
        username: String,
    },
    SendMessage {
        room_id: String,
        username: String,
        content: String,
        client_message_id: String,
    },
    Heartbeat,
    DeleteRoom {
        room_id: String,
        transaction_id: String,
    },
}

/// Event sent to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    RoomCreated {
        room: RoomSummary,
    },
    RoomsList {
        scope: RoomScope,
        rooms: Vec<RoomSummary>,
        nodes_available: Vec<String>,
        nodes_unavailable: Vec<String>,
    },
    JoinSucceeded {
        room: RoomInfo,
        member: Member,
        members: Vec<Member>,
        messages: Vec<ChatMessage>,
    },
    JoinFailed {
        room_id: String,
        code: String,
        message: String,
        retryable: bool,
    },
    MessageSentAck {
        client_message_id: String,
        message: ChatMessage,
        #[serde(default)]
        delivery_warnings: Vec<DeliveryFailure>,
    },
    NewMessage {
        message: ChatMessage,
    },
    MemberJoined {
        room_id: String,
        member: Member,
    },
    MemberLeft {
        room_id: String,
        username: String,
        reason: LeaveReason,
    },
    RoomDeleted {
        room_id: String,
        transaction_id: String,
    },
    DeleteRoomInitiated {
        room_id: String,
        transaction_id: String,
    },
    DeleteRoomResult {
        room_id: String,
        transaction_id: String,
        outcome: DeletionOutcome,
        participants: Vec<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    Error {
        code: String,
        message: String,
        room_id: Option<String>,
        retryable: bool,
    },
}

impl ClientEvent {
    /// Error event for a failed request
    pub fn error(err: &Error) -> Self {
        ClientEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            room_id: err.room_id().map(str::to_string),
            retryable: err.is_retryable(),
        }
    }

    /// Join failure for `room_id`
    pub fn join_failed(room_id: &str, err: &Error) -> Self {
        ClientEvent::JoinFailed {
            room_id: room_id.to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }

    /// Successful join, built from the room as it was right after admission
    pub fn join_succeeded(member: Member, snapshot: RoomSnapshot) -> Self {
        ClientEvent::JoinSucceeded {
            room: snapshot.info,
            member,
            members: snapshot.members,
            messages: snapshot.messages,
        }
    }

    /// Client-facing form of a replicated room update
    pub fn from_update(update: &ReplicaUpdate) -> Self {
        match update {
            ReplicaUpdate::Message(message) => ClientEvent::NewMessage {
                message: message.clone(),
            },
            ReplicaUpdate::Member(MemberEvent::Joined { room_id, member }) => ClientEvent::MemberJoined {
                room_id: room_id.clone(),
                member: member.clone(),
            },
            ReplicaUpdate::Member(MemberEvent::Left {
                room_id,
                username,
                reason,
            }) => ClientEvent::MemberLeft {
                room_id: room_id.clone(),
                username: username.clone(),
                reason: *reason,
            },
        }
    }

    /// Result of a deletion transaction
    pub fn deletion_result(report: &DeletionReport) -> Self {
        ClientEvent::DeleteRoomResult {
            room_id: report.room_id.clone(),
            transaction_id: report.transaction_id.clone(),
            outcome: report.outcome,
            participants: report.participants.clone(),
            reason: report.reason.clone(),
        }
    }
}

struct Session {
    sender: mpsc::UnboundedSender<ClientEvent>,
    /// (room_id, username) pairs joined through this session
    bindings: BTreeSet<(String, String)>,
}

/// Registry of connected client sessions
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new session
    pub fn open(&self, sender: mpsc::UnboundedSender<ClientEvent>) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write().insert(
            id,
            Session {
                sender,
                bindings: BTreeSet::new(),
            },
        );
        tracing::debug!("Client session {} opened", id);
        id
    }

    /// Remove a session, returning the room bindings it held
    pub fn close(&self, id: SessionId) -> Vec<(String, String)> {
        let removed = self.write().remove(&id);
        tracing::debug!("Client session {} closed", id);
        removed
            .map(|s| s.bindings.into_iter().collect())
            .unwrap_or_default()
    }

    /// Record that `id` joined `room_id` as `username`
    pub fn bind(&self, id: SessionId, room_id: &str, username: &str) {
        if let Some(session) = self.write().get_mut(&id) {
            session
                .bindings
                .insert((room_id.to_string(), username.to_string()));
        }
    }

    /// Drop the binding of `username` in `room_id`, whichever session holds it
    pub fn unbind(&self, room_id: &str, username: &str) {
        let key = (room_id.to_string(), username.to_string());
        for session in self.write().values_mut() {
            session.bindings.remove(&key);
        }
    }

    /// Drop every binding to `room_id`
    pub fn unbind_room(&self, room_id: &str) {
        for session in self.write().values_mut() {
            session.bindings.retain(|(room, _)| room != room_id);
        }
    }

    /// Room bindings held by a session
    pub fn bindings(&self, id: SessionId) -> Vec<(String, String)> {
        self.read()
            .get(&id)
            .map(|s| s.bindings.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any session is bound to `room_id`
    pub fn is_bound(&self, room_id: &str) -> bool {
        self.read()
            .values()
            .any(|s| s.bindings.iter().any(|(room, _)| room == room_id))
    }

    /// Send an event to one session
    pub fn send(&self, id: SessionId, event: ClientEvent) -> bool {
        match self.read().get(&id) {
            Some(session) => session.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Send an event to every session bound to `room_id`; returns the number reached
    pub fn fan_out(&self, room_id: &str, event: &ClientEvent) -> usize {
        let sessions = self.read();
        let mut reached = 0;
        for session in sessions.values() {
            if session.bindings.iter().any(|(room, _)| room == room_id)
                && session.sender.send(event.clone()).is_ok()
            {
                reached += 1;
            }
        }
        reached
    }

    /// Number of connected sessions
    pub fn count(&self) -> usize {
        self.read().len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_shape() {
        let request: ClientRequest = serde_json::from_str(
            r#"{"type":"send_message","data":{"room_id":"r1","username":"bob","content":"hi","client_message_id":"c-1"}}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            ClientRequest::SendMessage {
                room_id: "r1".into(),
                username: "bob".into(),
                content: "hi".into(),
                client_message_id: "c-1".into(),
            }
        );

        let heartbeat: ClientRequest = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(heartbeat, ClientRequest::Heartbeat);

        let listing: ClientRequest =
            serde_json::from_str(r#"{"type":"list_rooms","data":{}}"#).unwrap();
        assert_eq!(listing, ClientRequest::ListRooms { scope: RoomScope::Local });
    }

    #[test]
    fn test_error_event_json_shape() {
        let err = Error::AdminUnreachable {
            room_id: "r1".into(),
            node_id: "node-a".into(),
        };
        let json = serde_json::to_value(ClientEvent::error(&err)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["code"], "ADMIN_UNREACHABLE");
        assert_eq!(json["data"]["room_id"], "r1");
        assert_eq!(json["data"]["retryable"], true);
    }

    #[test]
    fn test_fan_out_reaches_bound_sessions_only() {
        let registry = SessionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let s1 = registry.open(tx1);
        let _s2 = registry.open(tx2);

        registry.bind(s1, "r1", "alice");
        let event = ClientEvent::RoomDeleted {
            room_id: "r1".into(),
            transaction_id: "tx".into(),
        };
        assert_eq!(registry.fan_out("r1", &event), 1);
        assert_eq!(rx1.try_recv().unwrap(), event);
        assert!(rx2.try_recv().is_err());

        registry.unbind("r1", "alice");
        assert_eq!(registry.fan_out("r1", &event), 0);
    }

    #[test]
    fn test_close_returns_bindings() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.open(tx);
        registry.bind(id, "r1", "alice");
        registry.bind(id, "r2", "alice");

        let bindings = registry.close(id);
        assert_eq!(bindings.len(), 2);
        assert_eq!(registry.count(), 0);
        assert!(!registry.send(id, ClientEvent::Error {
            code: "X".into(),
            message: "gone".into(),
            room_id: None,
            retryable: false,
        }));
    }
}
