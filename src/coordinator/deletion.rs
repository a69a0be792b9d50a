//! Deletion Coordinator
//!
//! Deletes a room on every node holding members of it with a two-phase
//! commit. The administrator coordinates; every node with a member in the
//! room at the start of phase 1 participates, the administrator included.
//!
//! The decision is unanimous and fails closed: any abort vote, RPC error,
//! timeout or failed peer rolls the transaction back. A participant that
//! hears nothing within the grace period after preparing aborts locally. A
//! coordinator that crashes between the phases leaves its participants to
//! that timeout; nothing repairs the gap.
//!
//! Finished outcomes are remembered for [`FINALIZED_RETENTION_SECS`] so that
//! repeated requests for the same transaction return the recorded outcome.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::events::{self, NodeEvent};
use crate::room::RoomPhase;
use crate::session::ClientEvent;
use crate::validation::validate_client_id;

/// How long the outcome of a finished transaction is kept
pub const FINALIZED_RETENTION_SECS: i64 = 3600;

/// A participant's phase 1 vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Ready,
    Abort { reason: String },
}

impl Vote {
    pub fn is_ready(&self) -> bool {
        matches!(self, Vote::Ready)
    }
}

/// Final outcome of a deletion transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionOutcome {
    Committed,
    RolledBack,
}

impl std::fmt::Display for DeletionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeletionOutcome::Committed => write!(f, "committed"),
            DeletionOutcome::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Coordinator-side transaction phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPhase {
    Preparing,
    Committing,
    RollingBack,
    Done,
}

/// A deletion driven by this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionTransaction {
    pub transaction_id: String,
    pub room_id: String,
    pub initiator_node_id: String,
    /// Nodes with members in the room when phase 1 started, the administrator included
    pub participant_node_ids: BTreeSet<String>,
    pub votes: BTreeMap<String, Vote>,
    pub phase: TransactionPhase,
}

/// Result of a deletion request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionReport {
    pub room_id: String,
    pub transaction_id: String,
    pub outcome: DeletionOutcome,
    pub participants: Vec<String>,
    /// Why the transaction rolled back
    pub reason: Option<String>,
}

/// A participant's record of a transaction it voted ready on
#[derive(Debug, Clone)]
struct PreparedDeletion {
    room_id: String,
    coordinator_node_id: String,
    prepared_at: DateTime<Utc>,
}

/// Outcome of a finished transaction and when it finished
#[derive(Debug, Clone)]
struct FinalizedDeletion {
    report: DeletionReport,
    finished_at: DateTime<Utc>,
}

/// Coordinator and participant sides of room deletion
pub struct DeletionCoordinator {
    ctx: Arc<NodeContext>,
    /// Transactions this node is coordinating
    active: Mutex<HashMap<String, DeletionTransaction>>,
    /// Outcomes of every transaction this node has finished, either side
    finalized: Mutex<HashMap<String, FinalizedDeletion>>,
    /// Transactions this node has voted ready on
    prepared: Mutex<HashMap<String, PreparedDeletion>>,
    grace_period: chrono::Duration,
}

impl DeletionCoordinator {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let grace_period = chrono::Duration::from_std(ctx.config.timing.prepare_grace_period())
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Self {
            ctx,
            active: Mutex::new(HashMap::new()),
            finalized: Mutex::new(HashMap::new()),
            prepared: Mutex::new(HashMap::new()),
            grace_period,
        }
    }

    fn node_id(&self) -> &str {
        self.ctx.node_id()
    }

    // ========== Coordinator ==========

    /// Delete a room administered by this node.
    ///
    /// Re-running a finished transaction id returns its recorded outcome.
    pub async fn delete_room(&self, room_id: &str, transaction_id: &str) -> Result<DeletionReport> {
        validate_client_id("transaction_id", transaction_id)?;

        if let Some(prior) = self.finalized.lock().await.get(transaction_id) {
            tracing::debug!("Deletion {} already finalized ({})", transaction_id, prior.report.outcome);
            return Ok(prior.report.clone());
        }
        if self.active.lock().await.contains_key(transaction_id) {
            return Err(Error::RoomBusy {
                room_id: room_id.to_string(),
                reason: format!("deletion {} in progress", transaction_id),
            });
        }

        // Phase 1 starts: snapshot participants and close the room
        let handle = self.ctx.store.handle(room_id).await?;
        let participants = {
            let mut room = handle.lock().await;
            if room.administrator() != self.node_id() {
                return Err(Error::NotAdministrator {
                    room_id: room_id.to_string(),
                    administrator: room.administrator().to_string(),
                });
            }
            if !room.is_active() {
                return Err(Error::RoomBusy {
                    room_id: room_id.to_string(),
                    reason: "deletion already pending".into(),
                });
            }
            room.set_phase(RoomPhase::DeletionPending {
                transaction_id: transaction_id.to_string(),
            });
            let mut participants = room.member_nodes();
            participants.insert(self.node_id().to_string());
            participants
        };

        let mut transaction = DeletionTransaction {
            transaction_id: transaction_id.to_string(),
            room_id: room_id.to_string(),
            initiator_node_id: self.node_id().to_string(),
            participant_node_ids: participants.clone(),
            votes: BTreeMap::new(),
            phase: TransactionPhase::Preparing,
        };
        transaction.votes.insert(self.node_id().to_string(), Vote::Ready);
        self.active
            .lock()
            .await
            .insert(transaction_id.to_string(), transaction.clone());

        tracing::info!(
            "Deletion {} of room {} preparing with {} participant(s)",
            transaction_id,
            room_id,
            participants.len()
        );

        let remotes: Vec<String> = participants
            .iter()
            .filter(|n| n.as_str() != self.node_id())
            .cloned()
            .collect();

        let prepares = remotes.iter().map(|node_id| async move {
            let vote = self
                .ctx
                .gateway
                .prepare_delete(node_id, transaction_id, room_id)
                .await;
            (node_id.clone(), vote)
        });
        for (node_id, vote) in futures::future::join_all(prepares).await {
            if let Vote::Abort { reason } = &vote {
                tracing::warn!("Deletion {}: {} voted abort ({})", transaction_id, node_id, reason);
            }
            transaction.votes.insert(node_id, vote);
        }

        let abort_reason = transaction.votes.iter().find_map(|(node_id, vote)| match vote {
            Vote::Ready => None,
            Vote::Abort { reason } => Some(format!("{}: {}", node_id, reason)),
        });
        transaction.phase = if abort_reason.is_none() {
            TransactionPhase::Committing
        } else {
            TransactionPhase::RollingBack
        };
        self.active
            .lock()
            .await
            .insert(transaction_id.to_string(), transaction.clone());

        // Phase 2
        let outcome = match transaction.phase {
            TransactionPhase::Committing => {
                let commits = remotes.iter().map(|node_id| async move {
                    let result = self
                        .ctx
                        .gateway
                        .commit_delete(node_id, transaction_id, room_id)
                        .await;
                    (node_id, result)
                });
                for (node_id, result) in futures::future::join_all(commits).await {
                    match result {
                        Ok(DeletionOutcome::Committed) => {}
                        Ok(DeletionOutcome::RolledBack) => tracing::warn!(
                            "Deletion {}: {} had already rolled back",
                            transaction_id,
                            node_id
                        ),
                        Err(e) => tracing::warn!(
                            "Deletion {}: commit not acknowledged by {}: {}",
                            transaction_id,
                            node_id,
                            e
                        ),
                    }
                }
                self.remove_room(room_id, transaction_id).await;
                DeletionOutcome::Committed
            }
            _ => {
                let rollbacks = remotes.iter().map(|node_id| async move {
                    let result = self
                        .ctx
                        .gateway
                        .rollback_delete(node_id, transaction_id, room_id)
                        .await;
                    (node_id, result)
                });
                for (node_id, result) in futures::future::join_all(rollbacks).await {
                    if let Err(e) = result {
                        tracing::warn!(
                            "Deletion {}: rollback not acknowledged by {}: {}",
                            transaction_id,
                            node_id,
                            e
                        );
                    }
                }
                self.restore_room(room_id, transaction_id).await;
                DeletionOutcome::RolledBack
            }
        };

        let report = DeletionReport {
            room_id: room_id.to_string(),
            transaction_id: transaction_id.to_string(),
            outcome,
            participants: participants.into_iter().collect(),
            reason: abort_reason,
        };
        transaction.phase = TransactionPhase::Done;
        tracing::debug!("Deletion {} votes: {:?}", transaction_id, transaction.votes);
        self.active.lock().await.remove(transaction_id);
        self.record_outcome(report.clone()).await;

        tracing::info!("Deletion {} of room {} {}", transaction_id, room_id, outcome);
        Ok(report)
    }

    /// Transactions this node is currently coordinating
    pub async fn active_transactions(&self) -> Vec<DeletionTransaction> {
        self.active.lock().await.values().cloned().collect()
    }

    // ========== Participant ==========

    /// Phase 1 on a participant
    pub async fn handle_prepare(&self, transaction_id: &str, room_id: &str, coordinator_node_id: &str) -> Vote {
        if self.finalized.lock().await.contains_key(transaction_id) {
            return Vote::Abort {
                reason: format!("transaction {} already finalized", transaction_id),
            };
        }
        if self.prepared.lock().await.contains_key(transaction_id) {
            return Vote::Ready;
        }
        if self.ctx.pending_joins.is_pending(room_id) {
            return Vote::Abort {
                reason: format!("join in flight for room {}", room_id),
            };
        }

        if let Ok(handle) = self.ctx.store.handle(room_id).await {
            let mut room = handle.lock().await;
            let conflicting = match room.phase() {
                RoomPhase::DeletionPending { transaction_id: other } if other != transaction_id => {
                    Some(other.clone())
                }
                _ => None,
            };
            if let Some(other) = conflicting {
                return Vote::Abort {
                    reason: format!("room {} is pending deletion {}", room_id, other),
                };
            }
            room.set_phase(RoomPhase::DeletionPending {
                transaction_id: transaction_id.to_string(),
            });
        }

        self.prepared.lock().await.insert(
            transaction_id.to_string(),
            PreparedDeletion {
                room_id: room_id.to_string(),
                coordinator_node_id: coordinator_node_id.to_string(),
                prepared_at: Utc::now(),
            },
        );
        tracing::info!(
            "Prepared deletion {} of room {} for {}",
            transaction_id,
            room_id,
            coordinator_node_id
        );
        Vote::Ready
    }

    /// Phase 2 commit on a participant
    pub async fn handle_commit(&self, transaction_id: &str) -> Result<DeletionOutcome> {
        if let Some(prior) = self.finalized.lock().await.get(transaction_id) {
            return Ok(prior.report.outcome);
        }
        let prepared = self
            .prepared
            .lock()
            .await
            .remove(transaction_id)
            .ok_or_else(|| Error::TransactionNotFound(transaction_id.to_string()))?;

        self.remove_room(&prepared.room_id, transaction_id).await;
        self.finish_participant(transaction_id, &prepared.room_id, DeletionOutcome::Committed)
            .await;
        Ok(DeletionOutcome::Committed)
    }

    /// Phase 2 rollback on a participant
    pub async fn handle_rollback(&self, transaction_id: &str, room_id: &str) -> Result<DeletionOutcome> {
        if let Some(prior) = self.finalized.lock().await.get(transaction_id) {
            return Ok(prior.report.outcome);
        }
        let prepared = self.prepared.lock().await.remove(transaction_id);
        let room_id = prepared.map(|p| p.room_id).unwrap_or_else(|| room_id.to_string());

        self.restore_room(&room_id, transaction_id).await;
        self.finish_participant(transaction_id, &room_id, DeletionOutcome::RolledBack)
            .await;
        Ok(DeletionOutcome::RolledBack)
    }

    /// Abort prepared transactions older than the grace period
    pub async fn expire_prepared(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<(String, PreparedDeletion)> = {
            let mut prepared = self.prepared.lock().await;
            let ids: Vec<String> = prepared
                .iter()
                .filter(|(_, p)| now - p.prepared_at > self.grace_period)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| prepared.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let mut ids = Vec::with_capacity(expired.len());
        for (transaction_id, prepared) in expired {
            tracing::warn!(
                "Deletion {} of room {} expired without a decision from {}; rolling back locally",
                transaction_id,
                prepared.room_id,
                prepared.coordinator_node_id
            );
            self.restore_room(&prepared.room_id, &transaction_id).await;
            self.finish_participant(&transaction_id, &prepared.room_id, DeletionOutcome::RolledBack)
                .await;
            ids.push(transaction_id);
        }
        ids
    }

    /// Number of transactions this node has voted ready on and not finished
    pub async fn prepared_count(&self) -> usize {
        self.prepared.lock().await.len()
    }

    /// Forget outcomes older than the retention window
    pub async fn expire_finalized(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::seconds(FINALIZED_RETENTION_SECS);
        let mut finalized = self.finalized.lock().await;
        let before = finalized.len();
        finalized.retain(|_, f| now - f.finished_at <= retention);
        let removed = before - finalized.len();
        if removed > 0 {
            tracing::debug!("Forgot {} finished deletion(s)", removed);
        }
        removed
    }

    async fn record_outcome(&self, report: DeletionReport) {
        self.finalized.lock().await.insert(
            report.transaction_id.clone(),
            FinalizedDeletion {
                report,
                finished_at: Utc::now(),
            },
        );
    }

    async fn finish_participant(&self, transaction_id: &str, room_id: &str, outcome: DeletionOutcome) {
        self.record_outcome(DeletionReport {
            room_id: room_id.to_string(),
            transaction_id: transaction_id.to_string(),
            outcome,
            participants: vec![self.node_id().to_string()],
            reason: None,
        })
        .await;
        tracing::info!("Deletion {} of room {} {} locally", transaction_id, room_id, outcome);
    }

    // ========== Local effects ==========

    /// Remove the room, tell its local sessions and drop their bindings
    async fn remove_room(&self, room_id: &str, transaction_id: &str) {
        if let Err(e) = self.ctx.store.delete_room_local(room_id).await {
            tracing::debug!("Deletion {}: {}", transaction_id, e);
            return;
        }
        let event = ClientEvent::RoomDeleted {
            room_id: room_id.to_string(),
            transaction_id: transaction_id.to_string(),
        };
        self.ctx.sessions.fan_out(room_id, &event);
        self.ctx.sessions.unbind_room(room_id);
        events::publish(
            &self.ctx.events,
            NodeEvent::RoomDeleted {
                room_id: room_id.to_string(),
                transaction_id: transaction_id.to_string(),
            },
        );
    }

    /// Reopen a room closed by `transaction_id`
    async fn restore_room(&self, room_id: &str, transaction_id: &str) {
        let Ok(handle) = self.ctx.store.handle(room_id).await else {
            return;
        };
        let mut room = handle.lock().await;
        let reopen = matches!(
            room.phase(),
            RoomPhase::DeletionPending { transaction_id: pending } if pending == transaction_id
        );
        if reopen {
            room.set_phase(RoomPhase::Active);
        }
    }
}
