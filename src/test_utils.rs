//! In-process peer network for tests.
//!
//! Routes peer RPCs straight to the registered handlers. A node can be made
//! unresponsive (calls never complete) or down (calls fail immediately).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::network::{Message, PeerHandler, PeerTransport};

#[derive(Default)]
struct NodeSlot {
    handler: Option<Weak<dyn PeerHandler>>,
    unresponsive: bool,
    down: bool,
    calls: usize,
}

#[derive(Default)]
struct Inner {
    nodes: Mutex<HashMap<String, NodeSlot>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, NodeSlot>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Inner>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that sends through this network
    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::new(LocalTransport {
            inner: self.inner.clone(),
        })
    }

    /// Route calls for `node_id` to `handler`
    pub fn register(&self, node_id: &str, handler: Arc<dyn PeerHandler>) {
        self.inner.lock().entry(node_id.to_string()).or_default().handler = Some(Arc::downgrade(&handler));
    }

    /// Make calls to `node_id` hang forever
    pub fn set_unresponsive(&self, node_id: &str, unresponsive: bool) {
        self.inner.lock().entry(node_id.to_string()).or_default().unresponsive = unresponsive;
    }

    /// Make calls to `node_id` fail immediately
    pub fn set_down(&self, node_id: &str, down: bool) {
        self.inner.lock().entry(node_id.to_string()).or_default().down = down;
    }

    /// Number of calls attempted to `node_id`
    pub fn calls_to(&self, node_id: &str) -> usize {
        self.inner.lock().get(node_id).map(|slot| slot.calls).unwrap_or(0)
    }
}

struct LocalTransport {
    inner: Arc<Inner>,
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn call(&self, node_id: &str, message: Message) -> Result<Message> {
        let (handler, unresponsive) = {
            let mut nodes = self.inner.lock();
            let slot = nodes.entry(node_id.to_string()).or_default();
            slot.calls += 1;
            if slot.down {
                return Err(Error::ConnectionFailed {
                    address: node_id.to_string(),
                    reason: "node is down".into(),
                });
            }
            (slot.handler.as_ref().and_then(Weak::upgrade), slot.unresponsive)
        };

        if unresponsive {
            std::future::pending::<()>().await;
        }

        match handler {
            Some(handler) => Ok(handler.handle(message).await),
            None => Err(Error::ConnectionFailed {
                address: node_id.to_string(),
                reason: "no node registered".into(),
            }),
        }
    }
}
