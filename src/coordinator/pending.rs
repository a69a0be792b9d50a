//! Pending Joins
//!
//! Joins this node has forwarded to a remote administrator and not yet seen
//! answered. While one is in flight, broadcasts for that room are buffered
//! so they can be applied on top of the snapshot the join returns.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::room::{ReplicaUpdate, Revision};

#[derive(Default)]
struct PendingRoom {
    in_flight: usize,
    buffered: Vec<(Revision, ReplicaUpdate)>,
}

/// In-flight remote joins, per room
#[derive(Default)]
pub struct PendingJoins {
    rooms: Mutex<HashMap<String, PendingRoom>>,
}

impl PendingJoins {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRoom>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a join for `room_id` as in flight
    pub fn begin(&self, room_id: &str) {
        self.lock().entry(room_id.to_string()).or_default().in_flight += 1;
    }

    /// Buffer an update if a join for its room is in flight
    pub fn buffer_if_pending(&self, revision: Revision, update: ReplicaUpdate) -> Option<ReplicaUpdate> {
        let mut rooms = self.lock();
        match rooms.get_mut(update.room_id()) {
            Some(pending) => {
                pending.buffered.push((revision, update));
                None
            }
            None => Some(update),
        }
    }

    /// Mark a join as answered and take everything buffered for the room
    pub fn finish(&self, room_id: &str) -> Vec<(Revision, ReplicaUpdate)> {
        let mut rooms = self.lock();
        let Some(pending) = rooms.get_mut(room_id) else {
            return Vec::new();
        };
        pending.in_flight = pending.in_flight.saturating_sub(1);
        let buffered = std::mem::take(&mut pending.buffered);
        if pending.in_flight == 0 {
            rooms.remove(room_id);
        }
        buffered
    }

    /// Whether a join for `room_id` is in flight
    pub fn is_pending(&self, room_id: &str) -> bool {
        self.lock().contains_key(room_id)
    }
}
