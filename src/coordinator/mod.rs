//! Coordination Module
//!
//! Per-room ordering authority, replica maintenance and room deletion.

mod admin;
mod deletion;
mod outbox;
mod pending;

pub use admin::{AdminCoordinator, DeliveryReport, RoomListing};
pub use deletion::{
    DeletionCoordinator, DeletionOutcome, DeletionReport, DeletionTransaction, TransactionPhase, Vote,
};
pub use outbox::{collect_failures, DeliveryAck, PeerOutboxes};
pub use pending::PendingJoins;
