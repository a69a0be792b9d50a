//! Client WebSocket sessions
//!
//! Each connection is one client session. Text frames carry JSON
//! [`ClientRequest`]s in and [`ClientEvent`]s out; requests from one
//! connection are handled in arrival order.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::http::AppState;
use crate::error::Error;
use crate::node::ChatNode;
use crate::session::{ClientEvent, ClientRequest, SessionId};

pub(super) async fn handle_upgrade(State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade) -> Response {
    let node = Arc::clone(&state.node);
    upgrade.on_upgrade(move |socket| run_session(node, socket))
}

async fn run_session(node: Arc<ChatNode>, socket: WebSocket) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = node.on_client_connected(tx);
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(rx);
        while let Some(event) = events.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Dropping unserializable client event: {}", e);
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => handle_text(&node, session, &text).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Session {} socket error: {}", session, e);
                break;
            }
        }
    }

    node.on_client_disconnected(session).await;
    writer.abort();
}

async fn handle_text(node: &ChatNode, session: SessionId, text: &str) {
    match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => node.on_client_request(session, request).await,
        Err(e) => {
            let err = Error::invalid("request", e.to_string());
            node.context().sessions.send(session, ClientEvent::error(&err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use crate::state::PeerRegistry;
    use crate::test_utils::LocalNetwork;

    async fn node() -> Arc<ChatNode> {
        let network = LocalNetwork::new();
        let config = ChatConfig::for_node("node-a", "127.0.0.1:7701");
        ChatNode::new(config, network.transport(), Arc::new(PeerRegistry::new())).await
    }

    #[tokio::test]
    async fn test_malformed_request_reports_invalid_input() {
        let node = node().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = node.on_client_connected(tx);

        handle_text(&node, session, "{\"type\":\"no_such_request\"}").await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ClientEvent::Error { code, .. } if code == "INVALID_INPUT"
        ));
    }

    #[tokio::test]
    async fn test_json_request_reaches_node() {
        let node = node().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = node.on_client_connected(tx);

        let request = r#"{"type":"create_room","data":{"name":"general","creator":"alice"}}"#;
        handle_text(&node, session, request).await;
        let event = rx.try_recv().unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "room_created");
        assert_eq!(json["data"]["room"]["name"], "general");
    }
}
