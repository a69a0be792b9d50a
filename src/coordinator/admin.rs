//! Administrator Coordinator
//!
//! Message ordering and membership decisions for rooms this node administers,
//! forwarding for rooms it does not, and application of administrator
//! broadcasts to local replicas.
//!
//! Every authoritative change is published while its room is still locked:
//! local sessions get the event immediately and each peer holding members gets
//! the broadcast queued on its FIFO outbox. Acks are awaited only after the
//! lock is released, and for at most the broadcast ack timeout.
//!
//! A replica that sees a missing revision asks the administrator for the
//! current room state and catches its clients up from it.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::outbox::{collect_failures, DeliveryAck};
use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::network::{DeliveryFailure, Message};
use crate::room::{
    AppendOutcome, ChatMessage, LeaveReason, MemberEvent, MemberInfo, ReplicaUpdate, Revision, Room,
    RoomSnapshot, RoomSummary,
};
use crate::session::{ClientEvent, RoomScope, SessionId};
use crate::validation::{validate_client_id, validate_message_content, validate_username};

/// Outcome of sending a message
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// The sequenced message
    pub message: ChatMessage,
    /// The client message id had been seen before
    pub duplicate: bool,
    /// Peers that did not acknowledge the broadcast
    pub warnings: Vec<DeliveryFailure>,
}

/// Rooms visible from this node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomListing {
    pub rooms: Vec<RoomSummary>,
    pub nodes_available: Vec<String>,
    pub nodes_unavailable: Vec<String>,
}

/// Per-room ordering authority and replica maintenance
pub struct AdminCoordinator {
    ctx: Arc<NodeContext>,
}

impl AdminCoordinator {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    fn node_id(&self) -> &str {
        self.ctx.node_id()
    }

    fn require_administrator(&self, room: &Room) -> Result<()> {
        if room.administrator() != self.node_id() {
            return Err(Error::NotAdministrator {
                room_id: room.room_id().to_string(),
                administrator: room.administrator().to_string(),
            });
        }
        Ok(())
    }

    /// Create a room administered by this node
    pub async fn create_room(
        &self,
        name: &str,
        description: Option<String>,
        creator: &str,
    ) -> Result<RoomSummary> {
        validate_username(creator)?;
        let snapshot = self
            .ctx
            .store
            .create_room(name, description, creator, self.node_id())
            .await?;
        let info = snapshot.info;
        Ok(RoomSummary {
            room_id: info.room_id,
            name: info.name,
            description: info.description,
            member_count: snapshot.members.len(),
            administrator_node_id: info.administrator_node_id,
            node_address: Some(self.ctx.advertise_address().to_string()),
        })
    }

    // ========== Publishing ==========

    /// Hand an applied update to the local sessions of its room
    fn deliver_locally(&self, update: &ReplicaUpdate) {
        let event = ClientEvent::from_update(update);
        let reached = self.ctx.sessions.fan_out(update.room_id(), &event);
        tracing::trace!("Fanned out update for room {} to {} session(s)", update.room_id(), reached);
        if let ReplicaUpdate::Member(MemberEvent::Left { room_id, username, .. }) = update {
            self.ctx.sessions.unbind(room_id, username);
        }
    }

    /// Publish an authoritative update. The caller holds the room lock.
    fn publish_locked(&self, room: &Room, update: ReplicaUpdate, notify: &BTreeSet<String>) -> Vec<DeliveryAck> {
        self.deliver_locally(&update);
        let message = Message::broadcast(room.revision(), update);
        notify
            .iter()
            .filter(|node_id| node_id.as_str() != self.node_id())
            .map(|node_id| self.ctx.outboxes.enqueue(node_id, message.clone()))
            .collect()
    }

    /// Wait for broadcast acks, bounded by the broadcast ack timeout
    async fn await_acks(&self, acks: Vec<DeliveryAck>) -> Vec<DeliveryFailure> {
        if acks.is_empty() {
            return Vec::new();
        }
        collect_failures(acks, self.ctx.config.timing.broadcast_ack_timeout()).await
    }

    fn log_failures(&self, room_id: &str, failures: &[DeliveryFailure]) {
        for failure in failures {
            tracing::warn!(
                "Broadcast for room {} not acknowledged by {}: {}",
                room_id,
                failure.node_id,
                failure.reason
            );
        }
    }

    // ========== Messages ==========

    /// Send a client message, sequencing it here or on the administrator
    pub async fn send_message(
        &self,
        room_id: &str,
        username: &str,
        content: &str,
        client_message_id: &str,
    ) -> Result<DeliveryReport> {
        validate_message_content(content, self.ctx.config.limits.max_message_length)?;
        validate_client_id("client_message_id", client_message_id)?;

        let administrator = self.ctx.store.administrator_of(room_id).await?;
        if administrator == self.node_id() {
            return self
                .accept_message(room_id, username, content, client_message_id)
                .await;
        }

        match self
            .ctx
            .gateway
            .forward_message(&administrator, room_id, username, content, client_message_id)
            .await
        {
            Ok((message, warnings)) => Ok(DeliveryReport {
                message,
                duplicate: false,
                warnings,
            }),
            Err(e @ Error::MemberNotFound { .. }) => {
                // The administrator no longer lists this member
                self.ctx.sessions.unbind(room_id, username);
                self.drop_replica_if_unused(room_id).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Sequence a message on the administrator and broadcast it
    pub async fn accept_message(
        &self,
        room_id: &str,
        sender: &str,
        content: &str,
        client_message_id: &str,
    ) -> Result<DeliveryReport> {
        validate_message_content(content, self.ctx.config.limits.max_message_length)?;
        validate_client_id("client_message_id", client_message_id)?;

        let handle = self.ctx.store.handle(room_id).await?;
        let (message, duplicate, acks) = {
            let mut room = handle.lock().await;
            self.require_administrator(&room)?;
            if !room.has_member(sender) {
                return Err(Error::MemberNotFound {
                    room_id: room_id.to_string(),
                    username: sender.to_string(),
                });
            }
            if !room.is_active() {
                return Err(Error::RoomBusy {
                    room_id: room_id.to_string(),
                    reason: "deletion pending".into(),
                });
            }

            let now = Utc::now();
            crate::room::membership::touch(&mut room, sender, now)?;
            match room.append_sequenced(
                client_message_id.to_string(),
                sender.to_string(),
                content.to_string(),
                now,
            ) {
                AppendOutcome::Appended(message) => {
                    tracing::debug!(
                        "Room {} sequenced message #{} from {}",
                        room_id,
                        message.sequence_number.unwrap_or_default(),
                        sender
                    );
                    let notify = room.member_nodes();
                    let acks = self.publish_locked(&room, ReplicaUpdate::Message(message.clone()), &notify);
                    (message, false, acks)
                }
                AppendOutcome::Duplicate(message) => {
                    tracing::debug!("Room {} ignored repeated message {}", room_id, client_message_id);
                    (message, true, Vec::new())
                }
            }
        };

        let warnings = self.await_acks(acks).await;
        self.log_failures(room_id, &warnings);
        Ok(DeliveryReport {
            message,
            duplicate,
            warnings,
        })
    }

    // ========== Replicas ==========

    /// Apply an administrator broadcast to the local replica
    pub async fn receive_update(&self, revision: Revision, update: ReplicaUpdate) -> Result<()> {
        let Some(update) = self.ctx.pending_joins.buffer_if_pending(revision, update) else {
            tracing::trace!("Buffered r{} until a pending join completes", revision);
            return Ok(());
        };

        let room_id = update.room_id().to_string();
        let is_leave = matches!(update, ReplicaUpdate::Member(MemberEvent::Left { .. }));
        if let Some(administrator) = self.apply_to_replica(revision, update).await? {
            self.resync_replica(&room_id, &administrator).await;
        }
        if is_leave {
            self.drop_replica_if_unused(&room_id).await;
        }
        Ok(())
    }

    /// Apply one update; returns the administrator when the replica is left
    /// waiting behind a missing revision
    async fn apply_to_replica(&self, revision: Revision, update: ReplicaUpdate) -> Result<Option<String>> {
        let handle = self.ctx.store.handle(update.room_id()).await?;
        let mut room = handle.lock().await;
        if room.administrator() == self.node_id() {
            return Err(Error::Internal(format!(
                "broadcast received for room {} administered by this node",
                room.room_id()
            )));
        }
        for applied in room.apply_update(revision, update) {
            self.deliver_locally(&applied);
        }
        Ok(room.has_gap().then(|| room.administrator().to_string()))
    }

    /// Replace a replica that fell behind with the administrator's state
    async fn resync_replica(&self, room_id: &str, administrator: &str) {
        tracing::info!("Replica of room {} missed an update; syncing from {}", room_id, administrator);
        let synced = match self.ctx.gateway.sync_room(administrator, room_id).await {
            Ok(snapshot) => self.install_snapshot(snapshot).await,
            Err(e) => Err(e),
        };
        if let Err(e) = synced {
            // The next broadcast finds the gap again and retries
            tracing::warn!("Sync of room {} from {} failed: {}", room_id, administrator, e);
        }
    }

    /// Current state of a room this node administers, for a lagging replica
    pub async fn authoritative_snapshot(&self, room_id: &str) -> Result<RoomSnapshot> {
        let handle = self.ctx.store.handle(room_id).await?;
        let room = handle.lock().await;
        self.require_administrator(&room)?;
        Ok(room.snapshot())
    }

    async fn install_snapshot(&self, snapshot: RoomSnapshot) -> Result<()> {
        for applied in self.ctx.store.install_replica(snapshot).await? {
            self.deliver_locally(&applied);
        }
        Ok(())
    }

    /// Forget a replica once no local session uses it
    async fn drop_replica_if_unused(&self, room_id: &str) {
        if self.ctx.pending_joins.is_pending(room_id) || self.ctx.sessions.is_bound(room_id) {
            return;
        }
        match self.ctx.store.administrator_of(room_id).await {
            Ok(administrator) if administrator != self.node_id() => {
                if self.ctx.store.delete_room_local(room_id).await.is_ok() {
                    tracing::debug!("Dropped replica of room {} with no local members", room_id);
                }
            }
            _ => {}
        }
    }

    // ========== Membership ==========

    /// Join a room for a client session.
    ///
    /// The administrator is taken from the local store, then from `node_hint`
    /// (as shown in a global listing), then from global discovery.
    pub async fn join_room(
        &self,
        session: SessionId,
        room_id: &str,
        username: &str,
        node_hint: Option<&str>,
    ) -> Result<(MemberInfo, RoomSnapshot)> {
        validate_username(username)?;
        let administrator = self.resolve_administrator(room_id, node_hint).await?;
        if administrator == self.node_id() {
            let node_id = self.node_id().to_string();
            return self
                .admit_member(room_id, username, &node_id, Some(session))
                .await;
        }

        self.ctx.pending_joins.begin(room_id);
        let joined = match self.ctx.gateway.join_room(&administrator, room_id, username).await {
            Ok((member, snapshot)) => match self.install_snapshot(snapshot.clone()).await {
                Ok(()) => {
                    self.ctx.sessions.bind(session, room_id, username);
                    Ok((member, snapshot))
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let mut lagging = None;
        for (revision, update) in self.ctx.pending_joins.finish(room_id) {
            match self.apply_to_replica(revision, update).await {
                Ok(gap) => lagging = gap,
                Err(e) => {
                    tracing::debug!("Discarded update buffered during join of room {}: {}", room_id, e)
                }
            }
        }
        if let Some(administrator) = lagging {
            self.resync_replica(room_id, &administrator).await;
        }
        if joined.is_err() {
            self.drop_replica_if_unused(room_id).await;
        }
        joined
    }

    async fn resolve_administrator(&self, room_id: &str, node_hint: Option<&str>) -> Result<String> {
        if let Ok(administrator) = self.ctx.store.administrator_of(room_id).await {
            return Ok(administrator);
        }
        if let Some(node_id) = node_hint.filter(|n| *n != self.node_id()) {
            return Ok(node_id.to_string());
        }
        let (rooms, _, _) = self.discover_remote_rooms().await;
        rooms
            .into_iter()
            .find(|r| r.room_id == room_id)
            .map(|r| r.administrator_node_id)
            .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))
    }

    /// Admit a member on the administrator and broadcast the join
    pub async fn admit_member(
        &self,
        room_id: &str,
        username: &str,
        connected_node_id: &str,
        session: Option<SessionId>,
    ) -> Result<(MemberInfo, RoomSnapshot)> {
        validate_username(username)?;
        let handle = self.ctx.store.handle(room_id).await?;
        let (member, snapshot, acks) = {
            let mut room = handle.lock().await;
            self.require_administrator(&room)?;
            let member = self
                .ctx
                .membership
                .admit(&mut room, username, connected_node_id, Utc::now())?;
            let notify = room.member_nodes();
            let update = ReplicaUpdate::Member(MemberEvent::Joined {
                room_id: room_id.to_string(),
                member: member.clone(),
            });
            let acks = self.publish_locked(&room, update, &notify);
            if let Some(session) = session {
                self.ctx.sessions.bind(session, room_id, username);
            }
            (member, room.snapshot(), acks)
        };

        self.log_failures(room_id, &self.await_acks(acks).await);
        Ok((member, snapshot))
    }

    /// Leave a room, here or through the administrator
    pub async fn leave_room(&self, room_id: &str, username: &str, reason: LeaveReason) -> Result<MemberInfo> {
        let administrator = self.ctx.store.administrator_of(room_id).await?;
        let result = if administrator == self.node_id() {
            self.remove_member(room_id, username, reason).await
        } else {
            self.ctx
                .gateway
                .leave_room(&administrator, room_id, username, reason)
                .await
        };

        // The client is gone from the room whatever the administrator said
        self.ctx.sessions.unbind(room_id, username);
        if administrator != self.node_id() {
            self.drop_replica_if_unused(room_id).await;
        }
        result
    }

    /// Remove a member on the administrator and broadcast the leave
    pub async fn remove_member(&self, room_id: &str, username: &str, reason: LeaveReason) -> Result<MemberInfo> {
        let handle = self.ctx.store.handle(room_id).await?;
        let (member, acks) = {
            let mut room = handle.lock().await;
            self.require_administrator(&room)?;
            let notify = room.member_nodes();
            let member = self.ctx.membership.remove(&mut room, username, reason)?;
            let acks = self.publish_locked(&room, left(room_id, username, reason), &notify);
            (member, acks)
        };

        self.log_failures(room_id, &self.await_acks(acks).await);
        Ok(member)
    }

    /// Refresh activity for every room a session is bound to
    pub async fn touch_session(&self, session: SessionId) {
        for (room_id, username) in self.ctx.sessions.bindings(session) {
            if let Err(e) = self.touch(&room_id, &username).await {
                tracing::debug!("Heartbeat for {} in room {} failed: {}", username, room_id, e);
            }
        }
    }

    /// Refresh a member's activity, here or through the administrator
    pub async fn touch(&self, room_id: &str, username: &str) -> Result<()> {
        let administrator = self.ctx.store.administrator_of(room_id).await?;
        if administrator == self.node_id() {
            self.touch_member(room_id, username).await
        } else {
            self.ctx
                .gateway
                .touch_member(&administrator, room_id, username)
                .await
        }
    }

    /// Refresh a member's activity on the administrator
    pub async fn touch_member(&self, room_id: &str, username: &str) -> Result<()> {
        let administrator = self.ctx.store.administrator_of(room_id).await?;
        if administrator != self.node_id() {
            return Err(Error::NotAdministrator {
                room_id: room_id.to_string(),
                administrator,
            });
        }
        self.ctx.membership.touch_activity(room_id, username).await
    }

    // ========== Discovery ==========

    /// Rooms administered by this node
    pub async fn hosted_rooms(&self) -> Vec<RoomSummary> {
        self.ctx
            .store
            .list_local_rooms(Some(self.ctx.advertise_address()))
            .await
    }

    /// Rooms administered here, or by any reachable node for a global listing
    pub async fn list_rooms(&self, scope: RoomScope) -> RoomListing {
        let mut listing = RoomListing {
            rooms: self.hosted_rooms().await,
            nodes_available: vec![self.node_id().to_string()],
            nodes_unavailable: Vec::new(),
        };
        if scope == RoomScope::Global {
            let (rooms, available, unavailable) = self.discover_remote_rooms().await;
            listing.rooms.extend(rooms);
            listing.nodes_available.extend(available);
            listing.nodes_unavailable.extend(unavailable);
            listing.rooms.sort_by(|a, b| {
                a.name
                    .cmp(&b.name)
                    .then_with(|| a.administrator_node_id.cmp(&b.administrator_node_id))
            });
        }
        listing
    }

    /// Query every peer's hosted rooms concurrently
    async fn discover_remote_rooms(&self) -> (Vec<RoomSummary>, Vec<String>, Vec<String>) {
        let mut peers = self.ctx.registry.ids().await;
        peers.sort();
        let queries = peers.into_iter().map(|node_id| async move {
            let result = self.ctx.gateway.get_hosted_rooms(&node_id).await;
            (node_id, result)
        });

        let mut rooms = Vec::new();
        let mut available = Vec::new();
        let mut unavailable = Vec::new();
        for (node_id, result) in futures::future::join_all(queries).await {
            match result {
                Ok(hosted) => {
                    rooms.extend(hosted);
                    available.push(node_id);
                }
                Err(e) => {
                    tracing::debug!("Room discovery skipped {}: {}", node_id, e);
                    unavailable.push(node_id);
                }
            }
        }
        (rooms, available, unavailable)
    }

    // ========== Maintenance ==========

    /// Remove the members attached to a failed peer from administered rooms
    pub async fn evict_failed_node(&self, node_id: &str) -> usize {
        let mut acks = Vec::new();
        let removed = self
            .ctx
            .membership
            .evict_node_members(node_id, |room, member, notify| {
                let mut targets = notify.clone();
                targets.remove(node_id);
                let update = left(room.room_id(), &member.username, LeaveReason::NodeFailure);
                acks.extend(self.publish_locked(room, update, &targets));
            })
            .await;

        for failure in self.await_acks(acks).await {
            tracing::warn!(
                "Eviction notice not acknowledged by {}: {}",
                failure.node_id,
                failure.reason
            );
        }
        removed.len()
    }

    /// Evict stale members from administered rooms
    pub async fn run_cleanup(&self, now: DateTime<Utc>) -> usize {
        let mut acks = Vec::new();
        let removed = self
            .ctx
            .membership
            .run_cleanup_cycle(now, |room, member, notify| {
                let update = left(room.room_id(), &member.username, LeaveReason::Stale);
                acks.extend(self.publish_locked(room, update, notify));
            })
            .await;

        for failure in self.await_acks(acks).await {
            tracing::warn!(
                "Stale-member notice not acknowledged by {}: {}",
                failure.node_id,
                failure.reason
            );
        }
        removed.len()
    }
}

fn left(room_id: &str, username: &str, reason: LeaveReason) -> ReplicaUpdate {
    ReplicaUpdate::Member(MemberEvent::Left {
        room_id: room_id.to_string(),
        username: username.to_string(),
        reason,
    })
}
