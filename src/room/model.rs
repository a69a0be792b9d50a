//! Room Data Model
//!
//! Rooms, members and messages as held by the Room Store. A room on its
//! administrator is authoritative; on any other node it is a replica that
//! only changes through administrator broadcasts.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sequence number assigned by a room's administrator
pub type SequenceNumber = u64;

/// Count of replicated updates applied to a room
pub type Revision = u64;

/// Most updates a replica holds ahead of a gap; later ones are dropped
/// and recovered by the next snapshot
pub const MAX_HELD_UPDATES: usize = 256;

/// Why a member left a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Explicit leave request
    Left,
    /// Client session closed
    Disconnected,
    /// Inactivity exceeded the timeout
    Stale,
    /// The member's node was marked failed
    NodeFailure,
    /// The room was deleted
    RoomDeleted,
}

impl std::fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaveReason::Left => write!(f, "left"),
            LeaveReason::Disconnected => write!(f, "disconnected"),
            LeaveReason::Stale => write!(f, "stale"),
            LeaveReason::NodeFailure => write!(f, "node_failure"),
            LeaveReason::RoomDeleted => write!(f, "room_deleted"),
        }
    }
}

/// Lifecycle phase of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    /// Normal operation
    Active,
    /// A deletion transaction has prepared this room
    DeletionPending { transaction_id: String },
}

/// A member of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Username, unique within the room
    pub username: String,
    /// Node the member's client session is attached to
    pub connected_node_id: String,
    /// When the member joined
    pub joined_at: DateTime<Utc>,
    /// Last message send or heartbeat
    pub last_activity_at: DateTime<Utc>,
}

/// Member information returned to callers
pub type MemberInfo = Member;

impl Member {
    /// Create a member that joined at `now`
    pub fn new(username: String, connected_node_id: String, now: DateTime<Utc>) -> Self {
        Self {
            username,
            connected_node_id,
            joined_at: now,
            last_activity_at: now,
        }
    }

    /// Whether the member has been inactive for longer than `timeout`
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_activity_at > timeout
    }
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Client-generated id used for deduplication
    pub message_id: String,
    /// Room the message belongs to
    pub room_id: String,
    /// Sending username
    pub sender: String,
    /// Message body
    pub content: String,
    /// Assigned by the administrator; `None` while in flight
    pub sequence_number: Option<SequenceNumber>,
    /// Administrator wall clock at assignment
    pub timestamp: Option<DateTime<Utc>>,
}

/// Immutable room metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub name: String,
    pub description: Option<String>,
    pub creator: String,
    pub administrator_node_id: String,
    pub created_at: DateTime<Utc>,
}

/// Summary used for room listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: String,
    pub name: String,
    pub description: Option<String>,
    pub member_count: usize,
    pub administrator_node_id: String,
    /// Peer RPC address of the administrator
    pub node_address: Option<String>,
}

/// Point-in-time copy of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub info: RoomInfo,
    pub phase: RoomPhase,
    /// Number of replicated updates reflected in this snapshot
    pub revision: Revision,
    pub members: Vec<Member>,
    pub messages: Vec<ChatMessage>,
}

impl RoomSnapshot {
    /// Find a member by username
    pub fn member(&self, username: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.username == username)
    }

    /// Sequence numbers of the message log, in log order
    pub fn sequence_numbers(&self) -> Vec<SequenceNumber> {
        self.messages.iter().filter_map(|m| m.sequence_number).collect()
    }
}

/// Membership change broadcast by a room's administrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberEvent {
    Joined { room_id: String, member: Member },
    Left {
        room_id: String,
        username: String,
        reason: LeaveReason,
    },
}

impl MemberEvent {
    pub fn room_id(&self) -> &str {
        match self {
            MemberEvent::Joined { room_id, .. } | MemberEvent::Left { room_id, .. } => room_id,
        }
    }
}

/// Administrator broadcast that a replica applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaUpdate {
    Message(ChatMessage),
    Member(MemberEvent),
}

impl ReplicaUpdate {
    pub fn room_id(&self) -> &str {
        match self {
            ReplicaUpdate::Message(message) => &message.room_id,
            ReplicaUpdate::Member(event) => event.room_id(),
        }
    }
}

/// Result of appending a message on the administrator
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// A new sequence number was assigned
    Appended(ChatMessage),
    /// The client message id was seen before; the original message is returned
    Duplicate(ChatMessage),
}

/// In-memory state of one room.
///
/// Every authoritative change on the administrator (a message append, a
/// member admitted or removed) advances the room revision by one and is
/// broadcast with it. Replicas apply updates strictly in revision order, which
/// keeps their message log a prefix of the administrator's.
#[derive(Debug)]
pub struct Room {
    info: RoomInfo,
    phase: RoomPhase,
    revision: Revision,
    members: HashMap<String, Member>,
    /// Sequenced message log; index `i` holds sequence number `i + 1`
    messages: Vec<ChatMessage>,
    /// client message id -> index into `messages`
    by_message_id: HashMap<String, usize>,
    /// Replica only: updates that arrived ahead of a gap
    held: BTreeMap<Revision, ReplicaUpdate>,
}

impl Room {
    /// Create an empty room
    pub fn new(info: RoomInfo) -> Self {
        Self {
            info,
            phase: RoomPhase::Active,
            revision: 0,
            members: HashMap::new(),
            messages: Vec::new(),
            by_message_id: HashMap::new(),
            held: BTreeMap::new(),
        }
    }

    /// Build a replica from an administrator snapshot
    pub fn from_snapshot(snapshot: RoomSnapshot) -> Self {
        let mut room = Room::new(snapshot.info.clone());
        room.replace_with(snapshot);
        room
    }

    pub fn info(&self) -> &RoomInfo {
        &self.info
    }

    pub fn room_id(&self) -> &str {
        &self.info.room_id
    }

    pub fn administrator(&self) -> &str {
        &self.info.administrator_node_id
    }

    pub fn phase(&self) -> &RoomPhase {
        &self.phase
    }

    pub fn set_phase(&mut self, phase: RoomPhase) {
        self.phase = phase;
    }

    /// Whether joins and sends are currently accepted
    pub fn is_active(&self) -> bool {
        self.phase == RoomPhase::Active
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Advance the revision after an authoritative change (administrator only)
    pub fn advance_revision(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }

    /// Highest sequence number in the contiguous log
    pub fn last_sequence(&self) -> SequenceNumber {
        self.messages.len() as SequenceNumber
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of replicated updates waiting for a gap to fill
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Whether updates are waiting behind a missing revision
    pub fn has_gap(&self) -> bool {
        !self.held.is_empty()
    }

    /// Assign the next sequence number and append (administrator only).
    ///
    /// A repeated client message id returns the message recorded the first
    /// time and leaves the revision untouched.
    pub fn append_sequenced(
        &mut self,
        message_id: String,
        sender: String,
        content: String,
        now: DateTime<Utc>,
    ) -> AppendOutcome {
        if let Some(index) = self.by_message_id.get(&message_id) {
            return AppendOutcome::Duplicate(self.messages[*index].clone());
        }

        let message = ChatMessage {
            message_id: message_id.clone(),
            room_id: self.info.room_id.clone(),
            sender,
            content,
            sequence_number: Some(self.last_sequence() + 1),
            timestamp: Some(now),
        };
        self.push_message(message.clone());
        self.advance_revision();
        AppendOutcome::Appended(message)
    }

    /// Apply an administrator broadcast carrying `revision`.
    ///
    /// Returns the updates that took effect, in order. Updates at or below the
    /// current revision are duplicates and are dropped; updates beyond a gap
    /// are held until the gap is filled by an earlier update or a snapshot.
    pub fn apply_update(&mut self, revision: Revision, update: ReplicaUpdate) -> Vec<ReplicaUpdate> {
        if revision <= self.revision {
            return Vec::new();
        }
        if revision > self.revision + 1 {
            if self.held.len() >= MAX_HELD_UPDATES {
                tracing::warn!(
                    "Room {} replica dropped r{}: {} updates already held",
                    self.info.room_id,
                    revision,
                    self.held.len()
                );
                return Vec::new();
            }
            tracing::debug!(
                "Holding update r{} for room {} (at r{})",
                revision,
                self.info.room_id,
                self.revision
            );
            self.held.insert(revision, update);
            return Vec::new();
        }

        let mut applied = Vec::new();
        self.apply_in_order(update, &mut applied);
        self.release_held(&mut applied);
        applied
    }

    /// Replace replica state with a newer administrator snapshot.
    ///
    /// A snapshot that is not newer than the replica is ignored. Returns what
    /// the replica's clients have not seen yet: members and messages new in
    /// the snapshot, then the held updates that became applicable.
    pub fn install_snapshot(&mut self, snapshot: RoomSnapshot) -> Vec<ReplicaUpdate> {
        if snapshot.revision <= self.revision {
            return Vec::new();
        }

        let known = self.last_sequence();
        let mut applied: Vec<ReplicaUpdate> = snapshot
            .members
            .iter()
            .filter(|m| !self.members.contains_key(&m.username))
            .map(|m| {
                ReplicaUpdate::Member(MemberEvent::Joined {
                    room_id: self.info.room_id.clone(),
                    member: m.clone(),
                })
            })
            .collect();
        applied.extend(
            snapshot
                .messages
                .iter()
                .filter(|m| m.sequence_number.is_some_and(|seq| seq > known))
                .cloned()
                .map(ReplicaUpdate::Message),
        );

        self.replace_with(snapshot);
        self.release_held(&mut applied);
        applied
    }

    fn replace_with(&mut self, snapshot: RoomSnapshot) {
        self.phase = snapshot.phase;
        self.revision = snapshot.revision;
        self.members = snapshot
            .members
            .into_iter()
            .map(|m| (m.username.clone(), m))
            .collect();
        self.messages.clear();
        self.by_message_id.clear();
        for message in snapshot.messages {
            self.push_message(message);
        }
    }

    fn apply_in_order(&mut self, update: ReplicaUpdate, applied: &mut Vec<ReplicaUpdate>) {
        self.revision += 1;
        match &update {
            ReplicaUpdate::Message(message) => {
                if message.sequence_number != Some(self.last_sequence() + 1) {
                    tracing::warn!(
                        "Room {} replica expected message #{} but got {:?}",
                        self.info.room_id,
                        self.last_sequence() + 1,
                        message.sequence_number
                    );
                    return;
                }
                self.push_message(message.clone());
            }
            ReplicaUpdate::Member(MemberEvent::Joined { member, .. }) => {
                self.members.insert(member.username.clone(), member.clone());
            }
            ReplicaUpdate::Member(MemberEvent::Left { username, .. }) => {
                self.members.remove(username);
            }
        }
        applied.push(update);
    }

    fn release_held(&mut self, applied: &mut Vec<ReplicaUpdate>) {
        while let Some(next) = self.held.remove(&(self.revision + 1)) {
            self.apply_in_order(next, applied);
        }
        // Anything left at or below the current revision is a stale duplicate
        let revision = self.revision;
        self.held.retain(|r, _| *r > revision);
    }

    fn push_message(&mut self, message: ChatMessage) {
        self.by_message_id
            .insert(message.message_id.clone(), self.messages.len());
        self.messages.push(message);
    }

    pub fn member(&self, username: &str) -> Option<&Member> {
        self.members.get(username)
    }

    pub fn member_mut(&mut self, username: &str) -> Option<&mut Member> {
        self.members.get_mut(username)
    }

    pub fn has_member(&self, username: &str) -> bool {
        self.members.contains_key(username)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Insert a member; returns false if the username is already present
    pub fn insert_member(&mut self, member: Member) -> bool {
        if self.members.contains_key(&member.username) {
            return false;
        }
        self.members.insert(member.username.clone(), member);
        true
    }

    pub fn remove_member(&mut self, username: &str) -> Option<Member> {
        self.members.remove(username)
    }

    /// Distinct nodes that have at least one member in this room
    pub fn member_nodes(&self) -> BTreeSet<String> {
        self.members
            .values()
            .map(|m| m.connected_node_id.clone())
            .collect()
    }

    /// Usernames of members attached to `node_id`
    pub fn members_on_node(&self, node_id: &str) -> Vec<String> {
        self.members
            .values()
            .filter(|m| m.connected_node_id == node_id)
            .map(|m| m.username.clone())
            .collect()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let mut members: Vec<Member> = self.members.values().cloned().collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.username.cmp(&b.username)));
        RoomSnapshot {
            info: self.info.clone(),
            phase: self.phase.clone(),
            revision: self.revision,
            members,
            messages: self.messages.clone(),
        }
    }

    pub fn summary(&self, node_address: Option<String>) -> RoomSummary {
        RoomSummary {
            room_id: self.info.room_id.clone(),
            name: self.info.name.clone(),
            description: self.info.description.clone(),
            member_count: self.members.len(),
            administrator_node_id: self.info.administrator_node_id.clone(),
            node_address,
        }
    }
}
