//! Membership Tracker
//!
//! Joins, leaves and per-member activity for the rooms in the Room Store,
//! plus the periodic stale-member eviction. Authoritative changes are only
//! made on the administrator; each one is published as a [`NodeEvent`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::model::{LeaveReason, Member, MemberInfo, Room};
use super::store::RoomStore;
use crate::error::{Error, Result};
use crate::events::{self, EventSender, NodeEvent};
use crate::validation::validate_username;

/// Tracks room membership and member activity
pub struct MembershipTracker {
    store: Arc<RoomStore>,
    events: EventSender,
    inactivity_timeout: chrono::Duration,
}

impl MembershipTracker {
    /// Create a tracker over `store`
    pub fn new(store: Arc<RoomStore>, events: EventSender, inactivity_timeout: Duration) -> Self {
        let inactivity_timeout = chrono::Duration::from_std(inactivity_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(900));
        Self {
            store,
            events,
            inactivity_timeout,
        }
    }

    /// Inactivity after which a member is stale
    pub fn inactivity_timeout(&self) -> chrono::Duration {
        self.inactivity_timeout
    }

    /// Add a member to a locked room, advancing its revision
    pub fn admit(
        &self,
        room: &mut Room,
        username: &str,
        connected_node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MemberInfo> {
        validate_username(username)?;
        if !room.is_active() {
            return Err(Error::RoomBusy {
                room_id: room.room_id().to_string(),
                reason: "deletion pending".into(),
            });
        }

        let member = Member::new(username.to_string(), connected_node_id.to_string(), now);
        if !room.insert_member(member.clone()) {
            return Err(Error::DuplicateMember {
                room_id: room.room_id().to_string(),
                username: username.to_string(),
            });
        }
        room.advance_revision();

        tracing::info!(
            "{} joined room {} via {}",
            username,
            room.room_id(),
            connected_node_id
        );
        events::publish(
            &self.events,
            NodeEvent::MemberJoined {
                room_id: room.room_id().to_string(),
                member: member.clone(),
            },
        );
        Ok(member)
    }

    /// Remove a member from a locked room, advancing its revision
    pub fn remove(&self, room: &mut Room, username: &str, reason: LeaveReason) -> Result<MemberInfo> {
        let member = room
            .remove_member(username)
            .ok_or_else(|| Error::MemberNotFound {
                room_id: room.room_id().to_string(),
                username: username.to_string(),
            })?;
        room.advance_revision();

        tracing::info!("{} left room {} ({})", username, room.room_id(), reason);
        events::publish(
            &self.events,
            NodeEvent::MemberLeft {
                room_id: room.room_id().to_string(),
                member: member.clone(),
                reason,
            },
        );
        Ok(member)
    }

    /// Join a room present in the local store
    pub async fn join(
        &self,
        room_id: &str,
        username: &str,
        connected_node_id: &str,
    ) -> Result<MemberInfo> {
        let handle = self.store.handle(room_id).await?;
        let mut room = handle.lock().await;
        self.admit(&mut room, username, connected_node_id, Utc::now())
    }

    /// Leave a room present in the local store
    pub async fn leave(&self, room_id: &str, username: &str, reason: LeaveReason) -> Result<MemberInfo> {
        let handle = self.store.handle(room_id).await?;
        let mut room = handle.lock().await;
        self.remove(&mut room, username, reason)
    }

    /// Refresh a member's last activity time
    pub async fn touch_activity(&self, room_id: &str, username: &str) -> Result<()> {
        let handle = self.store.handle(room_id).await?;
        let mut room = handle.lock().await;
        touch(&mut room, username, Utc::now())
    }

    /// Evict every stale member of the rooms this node administers.
    ///
    /// Candidates are collected per room and then removed one at a time,
    /// re-checking staleness under the room lock so a member that became
    /// active in between is kept. `on_removed` runs with the room still
    /// locked and receives the nodes that held members before the removal.
    pub async fn run_cleanup_cycle<F>(&self, now: DateTime<Utc>, mut on_removed: F) -> Vec<(String, MemberInfo)>
    where
        F: FnMut(&Room, &MemberInfo, &BTreeSet<String>),
    {
        let mut removed = Vec::new();

        for handle in self.store.administered_handles().await {
            let (room_id, candidates) = {
                let room = handle.lock().await;
                let candidates: Vec<String> = room
                    .members()
                    .filter(|m| m.is_stale(now, self.inactivity_timeout))
                    .map(|m| m.username.clone())
                    .collect();
                (room.room_id().to_string(), candidates)
            };

            for username in candidates {
                let mut room = handle.lock().await;
                let still_stale = room
                    .member(&username)
                    .map(|m| m.is_stale(now, self.inactivity_timeout))
                    .unwrap_or(false);
                if !still_stale {
                    continue;
                }
                let notify = room.member_nodes();
                if let Ok(member) = self.remove(&mut room, &username, LeaveReason::Stale) {
                    on_removed(&room, &member, &notify);
                    removed.push((room_id.clone(), member));
                }
            }
        }

        if !removed.is_empty() {
            tracing::info!("Cleanup cycle evicted {} stale member(s)", removed.len());
        }
        removed
    }

    /// Remove the members attached to `node_id` from administered rooms.
    ///
    /// `on_removed` behaves as in [`run_cleanup_cycle`](Self::run_cleanup_cycle).
    pub async fn evict_node_members<F>(&self, node_id: &str, mut on_removed: F) -> Vec<(String, MemberInfo)>
    where
        F: FnMut(&Room, &MemberInfo, &BTreeSet<String>),
    {
        let mut removed = Vec::new();

        for handle in self.store.administered_handles().await {
            let mut room = handle.lock().await;
            let room_id = room.room_id().to_string();
            for username in room.members_on_node(node_id) {
                let notify = room.member_nodes();
                if let Ok(member) = self.remove(&mut room, &username, LeaveReason::NodeFailure) {
                    on_removed(&room, &member, &notify);
                    removed.push((room_id.clone(), member));
                }
            }
        }

        if !removed.is_empty() {
            tracing::warn!(
                "Evicted {} member(s) attached to failed node {}",
                removed.len(),
                node_id
            );
        }
        removed
    }
}

/// Refresh activity on a locked room
pub fn touch(room: &mut Room, username: &str, now: DateTime<Utc>) -> Result<()> {
    let room_id = room.room_id().to_string();
    let member = room
        .member_mut(username)
        .ok_or_else(|| Error::MemberNotFound {
            room_id,
            username: username.to_string(),
        })?;
    member.last_activity_at = now;
    Ok(())
}
