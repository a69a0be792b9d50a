//! Per-Peer Outboxes
//!
//! Administrator broadcasts are queued on one FIFO channel per peer and sent
//! by a dedicated task, so every peer sees a room's updates in the order the
//! administrator produced them. Queueing never blocks, which lets callers
//! enqueue while holding a room lock and wait for the acks after releasing it.
//!
//! When a delivery fails, everything already queued behind it for that peer
//! is failed at once instead of waiting out one timeout each. The replica
//! notices the missing revisions and resyncs from the administrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::network::{DeliveryFailure, Message, PeerGateway};

/// Pending acknowledgement of one queued delivery
pub type DeliveryAck = (String, oneshot::Receiver<Result<()>>);

struct OutboxItem {
    message: Message,
    ack: oneshot::Sender<Result<()>>,
}

/// One FIFO outbox per peer
pub struct PeerOutboxes {
    gateway: Arc<PeerGateway>,
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<OutboxItem>>>,
}

impl PeerOutboxes {
    pub fn new(gateway: Arc<PeerGateway>) -> Self {
        Self {
            gateway,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Queue `message` for `node_id`. Must be called inside a Tokio runtime.
    pub fn enqueue(&self, node_id: &str, message: Message) -> DeliveryAck {
        let (ack_tx, ack_rx) = oneshot::channel();
        let mut item = OutboxItem {
            message,
            ack: ack_tx,
        };

        let mut senders = self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sender) = senders.get(node_id) {
            match sender.send(item) {
                Ok(()) => return (node_id.to_string(), ack_rx),
                // The sender task is gone; start a new one below
                Err(mpsc::error::SendError(returned)) => item = returned,
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_outbox(node_id.to_string(), self.gateway.clone(), rx));
        // A fresh channel with a live receiver accepts the item
        let _ = tx.send(item);
        senders.insert(node_id.to_string(), tx);
        (node_id.to_string(), ack_rx)
    }

    /// Number of peers with an outbox
    pub fn len(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drain one peer's outbox in order
async fn run_outbox(node_id: String, gateway: Arc<PeerGateway>, mut rx: mpsc::UnboundedReceiver<OutboxItem>) {
    tracing::debug!("Outbox for {} started", node_id);
    while let Some(item) = rx.recv().await {
        let kind = item.message.type_name();
        let result = gateway.deliver(&node_id, item.message).await;
        let failure = match &result {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("Delivery of {} to {} failed: {}", kind, node_id, e);
                Some(e.to_string())
            }
        };
        let _ = item.ack.send(result);

        if let Some(reason) = failure {
            let mut skipped = 0;
            while let Ok(queued) = rx.try_recv() {
                let _ = queued.ack.send(Err(Error::PeerRpcFailure {
                    node_id: node_id.clone(),
                    reason: format!("skipped after failed delivery: {}", reason),
                }));
                skipped += 1;
            }
            if skipped > 0 {
                tracing::debug!("Skipped {} queued broadcast(s) to {}", skipped, node_id);
            }
        }
    }
    tracing::debug!("Outbox for {} stopped", node_id);
}

/// Wait up to `limit` for queued deliveries and collect the failures.
///
/// Deliveries not acknowledged in time are reported as failures; they may
/// still complete later.
pub async fn collect_failures(acks: Vec<DeliveryAck>, limit: Duration) -> Vec<DeliveryFailure> {
    let deadline = Instant::now() + limit;
    let waits = acks.into_iter().map(|(node_id, ack)| async move {
        match tokio::time::timeout_at(deadline, ack).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(DeliveryFailure {
                node_id,
                reason: e.to_string(),
            }),
            Ok(Err(_)) => Some(DeliveryFailure {
                node_id,
                reason: "outbox closed before delivery".into(),
            }),
            Err(_) => Some(DeliveryFailure {
                node_id,
                reason: format!("no acknowledgement within {} ms", limit.as_millis()),
            }),
        }
    });
    futures::future::join_all(waits)
        .await
        .into_iter()
        .flatten()
        .collect()
}
