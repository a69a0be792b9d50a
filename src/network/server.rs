//! Network Server
//!
//! TCP server for accepting connections from other nodes. Every inbound
//! request is answered with exactly one response frame.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{read_message, write_message, Message};
use crate::error::{Error, Result};

/// Handles one inbound peer request
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Message;
}

/// Network server for peer communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Request handler
    handler: Arc<dyn PeerHandler>,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, handler: Arc<dyn PeerHandler>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Peer RPC server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = self.handler.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), handler).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Peer RPC server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection; requests on one connection are answered in order
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    handler: Arc<dyn PeerHandler>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let response = handler.handle(message).await;
                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkClient;
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl PeerHandler for EchoHandler {
        async fn handle(&self, message: Message) -> Message {
            match message {
                Message::Heartbeat { node_id, .. } => Message::HeartbeatAck { node_id },
                _ => Message::Ack,
            }
        }
    }

    /// Answers room queries slowly and heartbeats at once
    struct SlowRoomsHandler;

    #[async_trait]
    impl PeerHandler for SlowRoomsHandler {
        async fn handle(&self, message: Message) -> Message {
            match message {
                Message::GetHostedRooms => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Message::HostedRooms {
                        node_id: "slow".into(),
                        rooms: Vec::new(),
                    }
                }
                Message::Heartbeat { node_id, .. } => Message::HeartbeatAck { node_id },
                _ => Message::Ack,
            }
        }
    }

    #[tokio::test]
    async fn test_cancelled_call_does_not_leave_reply_behind() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(NetworkServer::new(address.clone(), Arc::new(SlowRoomsHandler)));
        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve(listener).await });

        let client = NetworkClient::new(Duration::from_secs(1));
        let heartbeat = || Message::Heartbeat {
            node_id: "node-b".into(),
            address: "127.0.0.1:0".into(),
        };
        client.send(&address, heartbeat()).await.unwrap();
        assert_eq!(client.connection_count().await, 1);

        // Cancelled after the request went out on the pooled connection
        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            client.send(&address, Message::GetHostedRooms),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(client.connection_count().await, 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let response = client.send(&address, heartbeat()).await.unwrap();
        assert!(matches!(response, Message::HeartbeatAck { ref node_id } if node_id == "node-b"));

        server.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_request_response_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(NetworkServer::new(address.clone(), Arc::new(EchoHandler)));

        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve(listener).await });

        let client = NetworkClient::new(Duration::from_secs(1));
        for _ in 0..2 {
            let response = client
                .send(
                    &address,
                    Message::Heartbeat {
                        node_id: "node-b".into(),
                        address: "127.0.0.1:0".into(),
                    },
                )
                .await
                .unwrap();
            assert!(matches!(response, Message::HeartbeatAck { ref node_id } if node_id == "node-b"));
        }
        // Second request reused the pooled connection
        assert_eq!(client.connection_count().await, 1);

        server.stop();
        task.await.unwrap().unwrap();
    }
}
