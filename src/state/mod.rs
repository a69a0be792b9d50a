//! State Management Module
//!
//! Peer liveness and peer address resolution. Shares no lock with the Room
//! Store.

mod health;
mod registry;

pub use health::{HealthStatus, HealthSummary, NodeHealth, PeerHealthMonitor};
pub use registry::{PeerEntry, PeerRegistry};
