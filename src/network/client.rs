//! Network Client
//!
//! TCP client for connecting to other nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{read_message, write_message, Message, PeerTransport};
use crate::error::{Error, Result};
use crate::state::PeerRegistry;

/// Idle connections kept per address
const MAX_IDLE_PER_ADDRESS: usize = 4;

/// Idle pooled connection
struct PoolEntry {
    stream: TcpStream,
    last_used: std::time::Instant,
}

/// Network client for connecting to peer nodes.
///
/// A connection is taken out of the pool for the whole request/response
/// exchange and only returned after the response has been read. A call that
/// is cancelled mid-exchange drops its connection with it, so no later call
/// can read a stale response.
pub struct NetworkClient {
    /// Idle connections: address -> connections
    pool: Mutex<HashMap<String, Vec<PoolEntry>>>,
    /// Connection timeout
    connect_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Send a message to a peer and wait for response.
    ///
    /// A pooled connection that turns out to be dead before the request is
    /// written is replaced once. A request that was written is never resent.
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        if let Some(mut entry) = self.checkout(address).await {
            let (mut reader, mut writer) = entry.stream.split();
            if write_message(&mut writer, &message).await.is_ok() {
                let response = read_message(&mut reader).await?;
                self.checkin(address, entry.stream).await;
                return Ok(response);
            }
            tracing::debug!("Pooled connection to {} was closed; reconnecting", address);
        }

        let mut stream = self.connect(address).await?;
        let response = {
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, &message).await?;
            read_message(&mut reader).await?
        };

        self.checkin(address, stream).await;
        Ok(response)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Take an idle connection out of the pool
    async fn checkout(&self, address: &str) -> Option<PoolEntry> {
        let mut pool = self.pool.lock().await;
        pool.get_mut(address).and_then(Vec::pop)
    }

    /// Return a connection after a completed exchange
    async fn checkin(&self, address: &str, stream: TcpStream) {
        let mut pool = self.pool.lock().await;
        let idle = pool.entry(address.to_string()).or_default();
        if idle.len() < MAX_IDLE_PER_ADDRESS {
            idle.push(PoolEntry {
                stream,
                last_used: std::time::Instant::now(),
            });
        }
    }

    /// Clean up idle connections
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut pool = self.pool.lock().await;
        let now = std::time::Instant::now();

        pool.retain(|addr, idle| {
            idle.retain(|e| {
                let keep = now.duration_since(e.last_used) <= max_idle;
                if !keep {
                    tracing::debug!("Removing idle connection to {}", addr);
                }
                keep
            });
            !idle.is_empty()
        });
    }

    /// Number of idle pooled connections
    pub async fn connection_count(&self) -> usize {
        self.pool.lock().await.values().map(Vec::len).sum()
    }
}

/// Peer transport over TCP, resolving node ids through the registry
pub struct TcpPeerTransport {
    registry: Arc<PeerRegistry>,
    client: NetworkClient,
}

impl TcpPeerTransport {
    /// Create a new TCP transport
    pub fn new(registry: Arc<PeerRegistry>, connect_timeout: Duration) -> Self {
        Self {
            registry,
            client: NetworkClient::new(connect_timeout),
        }
    }

    /// Drop pooled connections idle for longer than `max_idle`
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        self.client.cleanup_stale(max_idle).await;
    }
}

#[async_trait]
impl PeerTransport for TcpPeerTransport {
    async fn call(&self, node_id: &str, message: Message) -> Result<Message> {
        let address = self.registry.resolve(node_id).await?;
        tracing::trace!("Sending {} to {} at {}", message.type_name(), node_id, address);
        self.client
            .send(&address, message)
            .await
            .map_err(|e| match e {
                Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) => e,
                other => Error::PeerRpcFailure {
                    node_id: node_id.to_string(),
                    reason: other.to_string(),
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_creation() {
        let client = NetworkClient::new(Duration::from_secs(5));
        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let client = NetworkClient::new(Duration::from_millis(100));

        // Port 1 on localhost is not listening
        let result = client.send("127.0.0.1:1", Message::GetHostedRooms).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let transport = TcpPeerTransport::new(Arc::new(PeerRegistry::new()), Duration::from_millis(100));
        let result = transport.call("node-z", Message::GetHostedRooms).await;
        assert!(matches!(result, Err(Error::PeerNotFound(_))));
    }
}
