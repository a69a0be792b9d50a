//! Room Store
//!
//! Owns every room this node administers or replicates. The map lock is only
//! held to look up, insert or remove entries; each room carries its own mutex
//! so operations on distinct rooms never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use super::model::{ReplicaUpdate, Room, RoomInfo, RoomSnapshot, RoomSummary};
use crate::error::{Error, Result};
use crate::validation::validate_room_name;

/// Shared handle to a single room
pub type RoomHandle = Arc<Mutex<Room>>;

/// Map entry with the immutable metadata needed without taking the room lock
struct RoomEntry {
    name: String,
    administrator_node_id: String,
    handle: RoomHandle,
}

/// In-memory store of rooms
pub struct RoomStore {
    /// This node's ID
    node_id: String,
    /// room_id -> entry
    rooms: RwLock<HashMap<String, RoomEntry>>,
}

impl RoomStore {
    /// Create an empty store for `node_id`
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Create a room administered by `administrator_node_id`
    pub async fn create_room(
        &self,
        name: &str,
        description: Option<String>,
        creator: &str,
        administrator_node_id: &str,
    ) -> Result<RoomSnapshot> {
        validate_room_name(name)?;
        let name = name.trim().to_string();

        let mut rooms = self.rooms.write().await;
        let taken = rooms
            .values()
            .any(|e| e.administrator_node_id == administrator_node_id && e.name == name);
        if taken {
            return Err(Error::DuplicateRoomName(name));
        }

        let info = RoomInfo {
            room_id: uuid::Uuid::new_v4().to_string(),
            name: name.clone(),
            description: description.filter(|d| !d.trim().is_empty()),
            creator: creator.to_string(),
            administrator_node_id: administrator_node_id.to_string(),
            created_at: Utc::now(),
        };
        let room = Room::new(info.clone());
        let snapshot = room.snapshot();

        rooms.insert(
            info.room_id.clone(),
            RoomEntry {
                name,
                administrator_node_id: info.administrator_node_id.clone(),
                handle: Arc::new(Mutex::new(room)),
            },
        );

        tracing::info!(
            "Created room '{}' ({}) administered by {}",
            info.name,
            info.room_id,
            info.administrator_node_id
        );
        Ok(snapshot)
    }

    /// Get the lock handle of a room
    pub async fn handle(&self, room_id: &str) -> Result<RoomHandle> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))
    }

    /// Check whether a room is present locally
    pub async fn contains(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    /// Administrator of a room known to this node
    pub async fn administrator_of(&self, room_id: &str) -> Result<String> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|e| e.administrator_node_id.clone())
            .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))
    }

    /// Snapshot of a room
    pub async fn get_room(&self, room_id: &str) -> Result<RoomSnapshot> {
        let handle = self.handle(room_id).await?;
        let room = handle.lock().await;
        Ok(room.snapshot())
    }

    /// Rooms this node administers
    pub async fn list_local_rooms(&self, node_address: Option<&str>) -> Vec<RoomSummary> {
        let handles = self.administered_handles().await;
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let room = handle.lock().await;
            summaries.push(room.summary(node_address.map(str::to_string)));
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Handles of the rooms this node administers
    pub async fn administered_handles(&self) -> Vec<RoomHandle> {
        let rooms = self.rooms.read().await;
        rooms
            .values()
            .filter(|e| e.administrator_node_id == self.node_id)
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Number of rooms held (administered and replicas)
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Remove a room and all of its state. Never touches the network.
    pub async fn delete_room_local(&self, room_id: &str) -> Result<RoomSnapshot> {
        let entry = {
            let mut rooms = self.rooms.write().await;
            rooms
                .remove(room_id)
                .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))?
        };
        let room = entry.handle.lock().await;
        tracing::info!("Removed room '{}' ({}) from local store", entry.name, room_id);
        Ok(room.snapshot())
    }

    /// Create or refresh a replica from an administrator snapshot.
    ///
    /// A missing replica is created from the snapshot. An existing replica
    /// takes the snapshot only if it is newer, then applies any held updates
    /// that follow it. Returns what local clients have not seen yet.
    pub async fn install_replica(&self, snapshot: RoomSnapshot) -> Result<Vec<ReplicaUpdate>> {
        if snapshot.info.administrator_node_id == self.node_id {
            return Err(Error::Internal(format!(
                "refusing to install a replica of room {} administered by this node",
                snapshot.info.room_id
            )));
        }

        let mut rooms = self.rooms.write().await;
        let existing = rooms.get(&snapshot.info.room_id).map(|e| e.handle.clone());
        if let Some(handle) = existing {
            drop(rooms);
            let mut room = handle.lock().await;
            return Ok(room.install_snapshot(snapshot));
        }

        let room_id = snapshot.info.room_id.clone();
        let entry = RoomEntry {
            name: snapshot.info.name.clone(),
            administrator_node_id: snapshot.info.administrator_node_id.clone(),
            handle: Arc::new(Mutex::new(Room::from_snapshot(snapshot))),
        };
        rooms.insert(room_id.clone(), entry);
        tracing::debug!("Installed replica of room {}", room_id);
        Ok(Vec::new())
    }
}
