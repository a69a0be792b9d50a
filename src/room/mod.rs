//! Room Module
//!
//! In-memory rooms, their members and message logs.

pub mod membership;
pub mod model;
pub mod store;

pub use membership::MembershipTracker;
pub use model::{
    AppendOutcome, ChatMessage, LeaveReason, Member, MemberEvent, MemberInfo, ReplicaUpdate, Revision, Room,
    RoomInfo, RoomPhase, RoomSnapshot, RoomSummary, SequenceNumber,
};
pub use store::{RoomHandle, RoomStore};
