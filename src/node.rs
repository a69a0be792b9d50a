//! Chat Node
//!
//! Ties the coordinators to the outside world: client requests come in
//! through [`ChatNode::on_client_request`], peer requests through the
//! [`PeerHandler`] implementation, and the periodic loops run from
//! [`ChatNode::spawn_background_tasks`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ChatConfig;
use crate::context::NodeContext;
use crate::coordinator::{AdminCoordinator, DeletionCoordinator};
use crate::events::NodeEvent;
use crate::network::{Message, PeerHandler, PeerTransport, RemoteError};
use crate::room::{LeaveReason, ReplicaUpdate};
use crate::session::{ClientEvent, ClientRequest, SessionId};
use crate::state::PeerRegistry;

/// A chat node
pub struct ChatNode {
    ctx: Arc<NodeContext>,
    admin: AdminCoordinator,
    deletion: DeletionCoordinator,
}

impl ChatNode {
    /// Build a node; every peer in `registry` starts out tracked as healthy
    pub async fn new(
        config: ChatConfig,
        transport: Arc<dyn PeerTransport>,
        registry: Arc<PeerRegistry>,
    ) -> Arc<Self> {
        let ctx = Arc::new(NodeContext::new(config, transport, registry.clone()));
        for node_id in registry.ids().await {
            ctx.health.add_peer(&node_id).await;
        }

        tracing::info!(
            "Node {} ready ({} known peer(s))",
            ctx.node_id(),
            ctx.health.peer_ids().await.len()
        );
        Arc::new(Self {
            admin: AdminCoordinator::new(ctx.clone()),
            deletion: DeletionCoordinator::new(ctx.clone()),
            ctx,
        })
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn node_id(&self) -> &str {
        self.ctx.node_id()
    }

    pub fn admin(&self) -> &AdminCoordinator {
        &self.admin
    }

    pub fn deletion(&self) -> &DeletionCoordinator {
        &self.deletion
    }

    // ========== Client side ==========

    /// Register a client session whose events go to `sender`
    pub fn on_client_connected(&self, sender: mpsc::UnboundedSender<ClientEvent>) -> SessionId {
        self.ctx.sessions.open(sender)
    }

    /// Handle one client request; results go back on the session's channel
    pub async fn on_client_request(&self, session: SessionId, request: ClientRequest) {
        let reply = match request {
            ClientRequest::CreateRoom {
                name,
                description,
                creator,
            } => match self.admin.create_room(&name, description, &creator).await {
                Ok(room) => ClientEvent::RoomCreated { room },
                Err(e) => ClientEvent::error(&e),
            },

            ClientRequest::ListRooms { scope } => {
                let listing = self.admin.list_rooms(scope).await;
                ClientEvent::RoomsList {
                    scope,
                    rooms: listing.rooms,
                    nodes_available: listing.nodes_available,
                    nodes_unavailable: listing.nodes_unavailable,
                }
            }

            ClientRequest::JoinRoom {
                room_id,
                username,
                node_id,
            } => match self
                .admin
                .join_room(session, &room_id, &username, node_id.as_deref())
                .await
            {
                Ok((member, snapshot)) => ClientEvent::join_succeeded(member, snapshot),
                Err(e) => ClientEvent::join_failed(&room_id, &e),
            },

            ClientRequest::LeaveRoom { room_id, username } => {
                match self.admin.leave_room(&room_id, &username, LeaveReason::Left).await {
                    // The member_left fan-out already told this session
                    Ok(_) => return,
                    Err(e) => ClientEvent::error(&e),
                }
            }

            ClientRequest::SendMessage {
                room_id,
                username,
                content,
                client_message_id,
            } => match self
                .admin
                .send_message(&room_id, &username, &content, &client_message_id)
                .await
            {
                Ok(report) => ClientEvent::MessageSentAck {
                    client_message_id,
                    message: report.message,
                    delivery_warnings: report.warnings,
                },
                Err(e) => ClientEvent::error(&e),
            },

            ClientRequest::Heartbeat => {
                self.admin.touch_session(session).await;
                return;
            }

            ClientRequest::DeleteRoom {
                room_id,
                transaction_id,
            } => {
                self.ctx.sessions.send(
                    session,
                    ClientEvent::DeleteRoomInitiated {
                        room_id: room_id.clone(),
                        transaction_id: transaction_id.clone(),
                    },
                );
                match self.deletion.delete_room(&room_id, &transaction_id).await {
                    Ok(report) => ClientEvent::deletion_result(&report),
                    Err(e) => ClientEvent::error(&e),
                }
            }
        };

        self.ctx.sessions.send(session, reply);
    }

    /// Close a session and leave every room it had joined
    pub async fn on_client_disconnected(&self, session: SessionId) {
        for (room_id, username) in self.ctx.sessions.close(session) {
            if let Err(e) = self
                .admin
                .leave_room(&room_id, &username, LeaveReason::Disconnected)
                .await
            {
                tracing::debug!("Disconnect of {} from room {}: {}", username, room_id, e);
            }
        }
    }

    // ========== Periodic work ==========

    /// One heartbeat cycle; members on peers that just failed are evicted
    pub async fn heartbeat_tick(&self) -> Vec<NodeEvent> {
        let transitions = self.ctx.health.run_heartbeat_cycle().await;
        for transition in &transitions {
            if let NodeEvent::PeerFailed { node_id } = transition {
                let evicted = self.admin.evict_failed_node(node_id).await;
                tracing::info!("Evicted {} member(s) of failed peer {}", evicted, node_id);
            }
        }
        transitions
    }

    /// One stale-member cleanup cycle
    pub async fn cleanup_tick(&self) -> usize {
        self.admin.run_cleanup(Utc::now()).await
    }

    /// Abort prepared deletions that outlived the grace period and forget
    /// old deletion outcomes
    pub async fn expiry_tick(&self) -> Vec<String> {
        let now = Utc::now();
        let expired = self.deletion.expire_prepared(now).await;
        self.deletion.expire_finalized(now).await;
        expired
    }

    /// Start the heartbeat, cleanup, prepared-deletion expiry and event log loops
    pub fn spawn_background_tasks(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let timing = &self.ctx.config.timing;
        let expiry_period = (timing.prepare_grace_period() / 2).max(Duration::from_secs(1));

        let node = self.clone();
        let heartbeat = spawn_periodic("heartbeat", timing.heartbeat_interval(), shutdown.clone(), move || {
            let node = node.clone();
            async move {
                node.heartbeat_tick().await;
            }
        });

        let node = self.clone();
        let cleanup = spawn_periodic(
            "membership cleanup",
            timing.membership_cleanup_interval(),
            shutdown.clone(),
            move || {
                let node = node.clone();
                async move {
                    node.cleanup_tick().await;
                }
            },
        );

        let node = self.clone();
        let expiry = spawn_periodic("deletion expiry", expiry_period, shutdown.clone(), move || {
            let node = node.clone();
            async move {
                node.expiry_tick().await;
            }
        });

        let event_log = spawn_event_log(self.ctx.events.subscribe(), shutdown);

        vec![heartbeat, cleanup, expiry, event_log]
    }

    async fn dispatch(&self, message: Message) -> crate::Result<Message> {
        match message {
            Message::Heartbeat { node_id, address } => {
                self.ctx.registry.register(&node_id, &address).await;
                self.ctx.health.add_peer(&node_id).await;
                Ok(Message::HeartbeatAck {
                    node_id: self.node_id().to_string(),
                })
            }

            Message::ForwardMessage {
                room_id,
                sender,
                content,
                client_message_id,
                origin_node_id,
            } => {
                tracing::trace!("Message for room {} forwarded by {}", room_id, origin_node_id);
                let report = self
                    .admin
                    .accept_message(&room_id, &sender, &content, &client_message_id)
                    .await?;
                Ok(Message::MessageAccepted {
                    message: report.message,
                    warnings: report.warnings,
                })
            }

            Message::MessageBroadcast { message, revision } => {
                self.admin
                    .receive_update(revision, ReplicaUpdate::Message(message))
                    .await?;
                Ok(Message::Ack)
            }

            Message::MemberEvent { event, revision } => {
                self.admin
                    .receive_update(revision, ReplicaUpdate::Member(event))
                    .await?;
                Ok(Message::Ack)
            }

            Message::JoinRoom {
                room_id,
                username,
                connected_node_id,
            } => {
                let (member, snapshot) = self
                    .admin
                    .admit_member(&room_id, &username, &connected_node_id, None)
                    .await?;
                Ok(Message::JoinAccepted { member, snapshot })
            }

            Message::LeaveRoom {
                room_id,
                username,
                reason,
            } => {
                let member = self.admin.remove_member(&room_id, &username, reason).await?;
                Ok(Message::LeaveAccepted { member })
            }

            Message::TouchMember { room_id, username } => {
                self.admin.touch_member(&room_id, &username).await?;
                Ok(Message::Ack)
            }

            Message::SyncRoom { room_id } => Ok(Message::RoomState {
                snapshot: self.admin.authoritative_snapshot(&room_id).await?,
            }),

            Message::GetHostedRooms => Ok(Message::HostedRooms {
                node_id: self.node_id().to_string(),
                rooms: self.admin.hosted_rooms().await,
            }),

            Message::PrepareDelete {
                transaction_id,
                room_id,
                coordinator_node_id,
            } => {
                let vote = self
                    .deletion
                    .handle_prepare(&transaction_id, &room_id, &coordinator_node_id)
                    .await;
                Ok(Message::VoteResponse { transaction_id, vote })
            }

            Message::CommitDelete { transaction_id, .. } => {
                let outcome = self.deletion.handle_commit(&transaction_id).await?;
                Ok(Message::DeletionAck {
                    transaction_id,
                    outcome,
                })
            }

            Message::RollbackDelete {
                transaction_id,
                room_id,
            } => {
                let outcome = self.deletion.handle_rollback(&transaction_id, &room_id).await?;
                Ok(Message::DeletionAck {
                    transaction_id,
                    outcome,
                })
            }

            other => Ok(Message::Error(RemoteError::Other {
                code: "UNEXPECTED_REQUEST".into(),
                message: format!("{} is not a request", other.type_name()),
            })),
        }
    }
}

#[async_trait]
impl PeerHandler for ChatNode {
    async fn handle(&self, message: Message) -> Message {
        let kind = message.type_name();
        match self.dispatch(message).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("{} failed: {}", kind, e);
                Message::Error(RemoteError::from(&e))
            }
        }
    }
}

/// Log node events until shutdown is signalled
fn spawn_event_log(
    mut events: broadcast::Receiver<NodeEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Event log fell behind; {} event(s) not logged", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("event log stopped");
    })
}

fn log_event(event: &NodeEvent) {
    match event {
        NodeEvent::MemberJoined { room_id, member } => tracing::info!(
            "{} joined room {} via {}",
            member.username,
            room_id,
            member.connected_node_id
        ),
        NodeEvent::MemberLeft {
            room_id,
            member,
            reason,
        } => tracing::info!("{} left room {} ({})", member.username, room_id, reason),
        NodeEvent::PeerFailed { node_id } => tracing::warn!("Peer {} marked failed", node_id),
        NodeEvent::PeerRecovered { node_id } => tracing::info!("Peer {} recovered", node_id),
        NodeEvent::RoomDeleted {
            room_id,
            transaction_id,
        } => tracing::info!("Room {} deleted by transaction {}", room_id, transaction_id),
    }
}

/// Run `tick` every `period` until shutdown is signalled
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("{} loop stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::coordinator::DeletionOutcome;
    use crate::room::RoomPhase;
    use crate::session::RoomScope;
    use crate::test_utils::LocalNetwork;

    struct TestClient {
        session: SessionId,
        events: mpsc::UnboundedReceiver<ClientEvent>,
    }

    impl TestClient {
        fn connect(node: &ChatNode) -> Self {
            let (tx, events) = mpsc::unbounded_channel();
            Self {
                session: node.on_client_connected(tx),
                events,
            }
        }

        async fn request(&mut self, node: &ChatNode, request: ClientRequest) -> Vec<ClientEvent> {
            node.on_client_request(self.session, request).await;
            self.drain()
        }

        fn drain(&mut self) -> Vec<ClientEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    async fn cluster(ids: &[&str]) -> (LocalNetwork, Vec<Arc<ChatNode>>) {
        let network = LocalNetwork::new();
        let peers: Vec<PeerConfig> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| PeerConfig {
                id: id.to_string(),
                address: format!("127.0.0.1:{}", 7701 + i),
            })
            .collect();

        let mut nodes = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let mut config = ChatConfig::for_node(*id, format!("127.0.0.1:{}", 7701 + i));
            config.cluster.peers = peers.iter().filter(|p| p.id != *id).cloned().collect();
            config.timing.peer_rpc_timeout_ms = 200;
            config.timing.deletion_phase_timeout_ms = 200;
            config.timing.heartbeat_timeout_ms = 100;

            let registry = Arc::new(PeerRegistry::from_config(&config.cluster.peers));
            let node = ChatNode::new(config, network.transport(), registry).await;
            network.register(id, node.clone());
            nodes.push(node);
        }
        (network, nodes)
    }

    async fn create_room(node: &ChatNode, name: &str) -> String {
        let mut client = TestClient::connect(node);
        let events = client
            .request(
                node,
                ClientRequest::CreateRoom {
                    name: name.into(),
                    description: None,
                    creator: "alice".into(),
                },
            )
            .await;
        match events.as_slice() {
            [ClientEvent::RoomCreated { room }] => room.room_id.clone(),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    fn join(room_id: &str, username: &str) -> ClientRequest {
        ClientRequest::JoinRoom {
            room_id: room_id.into(),
            username: username.into(),
            node_id: None,
        }
    }

    fn send(room_id: &str, username: &str, content: &str, id: &str) -> ClientRequest {
        ClientRequest::SendMessage {
            room_id: room_id.into(),
            username: username.into(),
            content: content.into(),
            client_message_id: id.into(),
        }
    }

    #[tokio::test]
    async fn test_remote_join_and_send() {
        let (_network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;

        let mut bob = TestClient::connect(b);
        let events = bob.request(b, join(&room_id, "bob")).await;
        match events.as_slice() {
            [ClientEvent::JoinSucceeded { member, members, .. }] => {
                assert_eq!(member.connected_node_id, "node-b");
                assert_eq!(members.len(), 1);
            }
            other => panic!("unexpected events: {:?}", other),
        }

        let replica = b.context().store.get_room(&room_id).await.unwrap();
        assert_eq!(replica.members.len(), 1);
        assert_eq!(replica.info.administrator_node_id, "node-a");

        let events = bob.request(b, send(&room_id, "bob", "hi", "c-1")).await;
        let delivered = events.iter().find_map(|e| match e {
            ClientEvent::NewMessage { message } => Some(message.clone()),
            _ => None,
        });
        let delivered = delivered.expect("new_message not delivered");
        assert_eq!(delivered.sequence_number, Some(1));
        assert_eq!(delivered.content, "hi");
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::MessageSentAck { delivery_warnings, .. } if delivery_warnings.is_empty())));

        let authoritative = a.context().store.get_room(&room_id).await.unwrap();
        assert_eq!(authoritative.sequence_numbers(), vec![1]);
        assert_eq!(
            b.context().store.get_room(&room_id).await.unwrap().sequence_numbers(),
            vec![1]
        );
    }

    #[tokio::test]
    async fn test_replica_order_follows_administrator() {
        let (_network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;

        let mut alice = TestClient::connect(a);
        alice.request(a, join(&room_id, "alice")).await;
        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;

        for i in 0..5 {
            alice.request(a, send(&room_id, "alice", "from a", &format!("a-{}", i))).await;
            bob.request(b, send(&room_id, "bob", "from b", &format!("b-{}", i))).await;
        }

        let admin_log = a.context().store.get_room(&room_id).await.unwrap();
        let replica_log = b.context().store.get_room(&room_id).await.unwrap();
        assert_eq!(admin_log.sequence_numbers(), (1..=10).collect::<Vec<u64>>());
        assert_eq!(replica_log.messages, admin_log.messages);
    }

    fn new_message_seqs(events: &[ClientEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::NewMessage { message } => message.sequence_number,
                _ => None,
            })
            .collect()
    }

    fn warned_nodes(events: &[ClientEvent]) -> Option<Vec<String>> {
        events.iter().find_map(|e| match e {
            ClientEvent::MessageSentAck { delivery_warnings, .. } => {
                Some(delivery_warnings.iter().map(|w| w.node_id.clone()).collect())
            }
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_replica_catches_up_after_missed_broadcast() {
        let (network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;

        let mut alice = TestClient::connect(a);
        alice.request(a, join(&room_id, "alice")).await;
        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;
        bob.drain();

        network.set_down("node-b", true);
        let events = alice.request(a, send(&room_id, "alice", "m1", "m-1")).await;
        assert_eq!(warned_nodes(&events), Some(vec!["node-b".to_string()]));
        network.set_down("node-b", false);

        for i in 2..=4 {
            alice
                .request(a, send(&room_id, "alice", "more", &format!("m-{}", i)))
                .await;
        }

        let admin_log = a.context().store.get_room(&room_id).await.unwrap();
        let replica_log = b.context().store.get_room(&room_id).await.unwrap();
        assert_eq!(admin_log.sequence_numbers(), vec![1, 2, 3, 4]);
        assert_eq!(replica_log.messages, admin_log.messages);
        assert_eq!(replica_log.revision, admin_log.revision);
        assert_eq!(new_message_seqs(&bob.drain()), vec![1, 2, 3, 4]);

        let handle = b.context().store.handle(&room_id).await.unwrap();
        assert_eq!(handle.lock().await.held_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_failure_is_reported_not_rolled_back() {
        let (network, nodes) = cluster(&["node-a", "node-b", "node-c"]).await;
        let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
        let room_id = create_room(a, "general").await;

        let mut alice = TestClient::connect(a);
        alice.request(a, join(&room_id, "alice")).await;
        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;
        let mut carol = TestClient::connect(c);
        carol.request(c, join(&room_id, "carol")).await;
        bob.drain();

        network.set_down("node-c", true);
        let events = alice.request(a, send(&room_id, "alice", "hi", "c-1")).await;
        assert_eq!(warned_nodes(&events), Some(vec!["node-c".to_string()]));
        assert!(!events.iter().any(|e| matches!(e, ClientEvent::Error { .. })));

        let admin_log = a.context().store.get_room(&room_id).await.unwrap();
        assert_eq!(admin_log.sequence_numbers(), vec![1]);
        assert_eq!(new_message_seqs(&bob.drain()), vec![1]);
        assert_eq!(
            b.context().store.get_room(&room_id).await.unwrap().sequence_numbers(),
            vec![1]
        );
    }

    #[tokio::test]
    async fn test_forwarded_send_survives_unresponsive_member_node() {
        let (network, nodes) = cluster(&["node-a", "node-b", "node-c"]).await;
        let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
        let room_id = create_room(a, "general").await;

        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;
        let mut carol = TestClient::connect(c);
        carol.request(c, join(&room_id, "carol")).await;
        bob.drain();

        network.set_unresponsive("node-c", true);
        let started = std::time::Instant::now();
        let events = bob.request(b, send(&room_id, "bob", "hi", "c-1")).await;
        let elapsed = started.elapsed();
        network.set_unresponsive("node-c", false);

        // Answered before the 200 ms forwarding timeout
        assert!(elapsed < Duration::from_millis(200), "took {:?}", elapsed);
        assert!(!events.iter().any(|e| matches!(e, ClientEvent::Error { .. })));
        assert_eq!(warned_nodes(&events), Some(vec!["node-c".to_string()]));
        assert_eq!(new_message_seqs(&events), vec![1]);
        assert_eq!(
            a.context().store.get_room(&room_id).await.unwrap().sequence_numbers(),
            vec![1]
        );
    }

    #[tokio::test]
    async fn test_concurrent_sends_bounded_by_one_ack_timeout() {
        let (network, nodes) = cluster(&["node-a", "node-b", "node-c"]).await;
        let (a, c) = (&nodes[0], &nodes[2]);
        let room_id = create_room(a, "general").await;

        let mut alice = TestClient::connect(a);
        alice.request(a, join(&room_id, "alice")).await;
        let mut carol = TestClient::connect(c);
        carol.request(c, join(&room_id, "carol")).await;

        network.set_unresponsive("node-c", true);
        let started = std::time::Instant::now();
        let sends = (0..5).map(|i| {
            let room_id = room_id.clone();
            async move {
                a.admin()
                    .send_message(&room_id, "alice", "hi", &format!("c-{}", i))
                    .await
            }
        });
        let reports = futures::future::join_all(sends).await;
        let elapsed = started.elapsed();
        network.set_unresponsive("node-c", false);

        assert!(elapsed < Duration::from_millis(400), "took {:?}", elapsed);
        for report in reports {
            let report = report.unwrap();
            assert_eq!(report.warnings.len(), 1);
            assert_eq!(report.warnings[0].node_id, "node-c");
        }
        assert_eq!(
            a.context().store.get_room(&room_id).await.unwrap().sequence_numbers(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[tokio::test]
    async fn test_background_tasks_log_events_and_stop() {
        let (_network, nodes) = cluster(&["node-a"]).await;
        let (tx, rx) = watch::channel(false);
        let tasks = nodes[0].spawn_background_tasks(rx);
        assert_eq!(tasks.len(), 4);
        assert_eq!(nodes[0].context().events.receiver_count(), 1);

        tx.send(true).unwrap();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(nodes[0].context().events.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_with_same_client_message_id() {
        let (_network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;
        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;

        bob.request(b, send(&room_id, "bob", "hi", "c-1")).await;
        let retry = bob.request(b, send(&room_id, "bob", "hi", "c-1")).await;
        assert!(retry.iter().any(|e| matches!(
            e,
            ClientEvent::MessageSentAck { message, .. } if message.sequence_number == Some(1)
        )));
        assert!(!retry.iter().any(|e| matches!(e, ClientEvent::NewMessage { .. })));
        assert_eq!(
            a.context().store.get_room(&room_id).await.unwrap().messages.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_member_rejected_across_nodes() {
        let (_network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;

        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;

        let mut impostor = TestClient::connect(a);
        let events = impostor.request(a, join(&room_id, "bob")).await;
        assert!(matches!(
            events.as_slice(),
            [ClientEvent::JoinFailed { code, .. }] if code == "DUPLICATE_MEMBER"
        ));
    }

    #[tokio::test]
    async fn test_leave_drops_unused_replica() {
        let (_network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;

        let mut alice = TestClient::connect(a);
        alice.request(a, join(&room_id, "alice")).await;
        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;

        let events = bob
            .request(
                b,
                ClientRequest::LeaveRoom {
                    room_id: room_id.clone(),
                    username: "bob".into(),
                },
            )
            .await;
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::MemberLeft { username, .. } if username == "bob")));
        assert!(!b.context().store.contains(&room_id).await);

        let seen_by_alice = alice.drain();
        assert!(seen_by_alice.iter().any(|e| matches!(
            e,
            ClientEvent::MemberLeft { username, reason: LeaveReason::Left, .. } if username == "bob"
        )));
        assert_eq!(a.context().store.get_room(&room_id).await.unwrap().members.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_rooms() {
        let (_network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;

        let bob = {
            let mut bob = TestClient::connect(b);
            bob.request(b, join(&room_id, "bob")).await;
            bob
        };
        b.on_client_disconnected(bob.session).await;

        assert!(a.context().store.get_room(&room_id).await.unwrap().members.is_empty());
        assert_eq!(b.context().sessions.count(), 0);
    }

    #[tokio::test]
    async fn test_deletion_commits_everywhere() {
        let (_network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;

        let mut alice = TestClient::connect(a);
        alice.request(a, join(&room_id, "alice")).await;
        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;

        let delete = ClientRequest::DeleteRoom {
            room_id: room_id.clone(),
            transaction_id: "tx-1".into(),
        };
        let events = alice.request(a, delete.clone()).await;
        assert!(matches!(events.first(), Some(ClientEvent::DeleteRoomInitiated { .. })));
        assert!(events.iter().any(|e| matches!(e, ClientEvent::RoomDeleted { .. })));
        match events.last() {
            Some(ClientEvent::DeleteRoomResult {
                outcome,
                participants,
                ..
            }) => {
                assert_eq!(*outcome, DeletionOutcome::Committed);
                assert_eq!(participants, &vec!["node-a".to_string(), "node-b".to_string()]);
            }
            other => panic!("unexpected final event: {:?}", other),
        }

        assert!(!a.context().store.contains(&room_id).await);
        assert!(!b.context().store.contains(&room_id).await);
        assert!(bob
            .drain()
            .iter()
            .any(|e| matches!(e, ClientEvent::RoomDeleted { transaction_id, .. } if transaction_id == "tx-1")));
        assert!(b.context().sessions.bindings(bob.session).is_empty());

        // Re-running the finished transaction returns its outcome
        let report = a.deletion().delete_room(&room_id, "tx-1").await.unwrap();
        assert_eq!(report.outcome, DeletionOutcome::Committed);
    }

    #[tokio::test]
    async fn test_deletion_rolls_back_when_participant_unresponsive() {
        let (network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;

        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;
        let before = a.context().store.get_room(&room_id).await.unwrap();

        network.set_unresponsive("node-b", true);
        let report = a.deletion().delete_room(&room_id, "tx-1").await.unwrap();
        network.set_unresponsive("node-b", false);

        assert_eq!(report.outcome, DeletionOutcome::RolledBack);
        assert!(report.reason.is_some());

        let after = a.context().store.get_room(&room_id).await.unwrap();
        assert_eq!(after, before);
        let replica = b.context().store.get_room(&room_id).await.unwrap();
        assert_eq!(replica.phase, RoomPhase::Active);
        assert_eq!(replica.members.len(), 1);
    }

    #[tokio::test]
    async fn test_deletion_requires_administrator() {
        let (_network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;
        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;

        let events = bob
            .request(
                b,
                ClientRequest::DeleteRoom {
                    room_id: room_id.clone(),
                    transaction_id: "tx-1".into(),
                },
            )
            .await;
        assert!(matches!(
            events.last(),
            Some(ClientEvent::Error { code, .. }) if code == "NOT_ADMINISTRATOR"
        ));
        assert!(a.context().store.contains(&room_id).await);
    }

    #[tokio::test]
    async fn test_failed_peer_members_are_evicted() {
        let (network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;

        let mut alice = TestClient::connect(a);
        alice.request(a, join(&room_id, "alice")).await;
        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;
        alice.drain();

        network.set_down("node-b", true);
        for _ in 0..2 {
            assert!(a.heartbeat_tick().await.is_empty());
        }
        let transitions = a.heartbeat_tick().await;
        assert_eq!(
            transitions,
            vec![NodeEvent::PeerFailed {
                node_id: "node-b".into()
            }]
        );

        let room = a.context().store.get_room(&room_id).await.unwrap();
        assert!(room.member("bob").is_none());
        assert!(alice.drain().iter().any(|e| matches!(
            e,
            ClientEvent::MemberLeft { reason: LeaveReason::NodeFailure, .. }
        )));

        // Recovery on the first successful heartbeat
        network.set_down("node-b", false);
        let transitions = a.heartbeat_tick().await;
        assert!(matches!(transitions.as_slice(), [NodeEvent::PeerRecovered { .. }]));
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_administrator_failed() {
        let (network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;
        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;

        for _ in 0..3 {
            b.context().health.record_failure("node-a", "timeout").await;
        }
        let calls = network.calls_to("node-a");

        let events = bob.request(b, send(&room_id, "bob", "hi", "c-1")).await;
        assert!(matches!(
            events.as_slice(),
            [ClientEvent::Error { code, retryable: true, .. }] if code == "ADMIN_UNREACHABLE"
        ));
        assert_eq!(network.calls_to("node-a"), calls);
    }

    #[tokio::test]
    async fn test_global_listing_reports_unavailable_nodes() {
        let (network, nodes) = cluster(&["node-a", "node-b", "node-c"]).await;
        create_room(&nodes[0], "general").await;
        create_room(&nodes[1], "random").await;
        network.set_down("node-c", true);

        let mut client = TestClient::connect(&nodes[0]);
        let events = client
            .request(
                &nodes[0],
                ClientRequest::ListRooms {
                    scope: RoomScope::Global,
                },
            )
            .await;
        match events.as_slice() {
            [ClientEvent::RoomsList {
                rooms,
                nodes_available,
                nodes_unavailable,
                ..
            }] => {
                let names: Vec<_> = rooms.iter().map(|r| r.name.as_str()).collect();
                assert_eq!(names, vec!["general", "random"]);
                assert_eq!(nodes_available, &vec!["node-a".to_string(), "node-b".to_string()]);
                assert_eq!(nodes_unavailable, &vec!["node-c".to_string()]);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_member_cleanup_notifies_replicas() {
        let (_network, nodes) = cluster(&["node-a", "node-b"]).await;
        let (a, b) = (&nodes[0], &nodes[1]);
        let room_id = create_room(a, "general").await;

        let mut alice = TestClient::connect(a);
        alice.request(a, join(&room_id, "alice")).await;
        let mut bob = TestClient::connect(b);
        bob.request(b, join(&room_id, "bob")).await;
        {
            let handle = a.context().store.handle(&room_id).await.unwrap();
            let mut room = handle.lock().await;
            room.member_mut("bob").unwrap().last_activity_at = Utc::now() - chrono::Duration::hours(1);
        }

        assert_eq!(a.cleanup_tick().await, 1);
        assert!(bob.drain().iter().any(|e| matches!(
            e,
            ClientEvent::MemberLeft { username, reason: LeaveReason::Stale, .. } if username == "bob"
        )));
        assert!(!b.context().store.contains(&room_id).await);
    }

    #[tokio::test]
    async fn test_heartbeat_registers_unknown_peer() {
        let (_network, nodes) = cluster(&["node-a"]).await;
        let response = nodes[0]
            .handle(Message::Heartbeat {
                node_id: "node-z".into(),
                address: "10.0.0.9:7700".into(),
            })
            .await;
        assert!(matches!(response, Message::HeartbeatAck { ref node_id } if node_id == "node-a"));
        assert_eq!(
            nodes[0].context().registry.resolve("node-z").await.unwrap(),
            "10.0.0.9:7700"
        );
        assert!(nodes[0].context().health.get("node-z").await.is_some());
    }
}
