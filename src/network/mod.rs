//! Network Module
//!
//! Peer-to-peer request/response RPC between nodes.

mod client;
mod gateway;
mod protocol;
mod server;

pub use client::{NetworkClient, TcpPeerTransport};
pub use gateway::{DeliveryFailure, PeerGateway};
pub use protocol::{FrameHeader, Message, RemoteError};
pub use server::{NetworkServer, PeerHandler};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Outbound peer RPC: one request, one response
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send `message` to `node_id` and wait for its response
    async fn call(&self, node_id: &str, message: Message) -> Result<Message>;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = Message::TouchMember {
            room_id: "room-1".into(),
            username: "alice".into(),
        };
        write_message(&mut a, &sent).await.unwrap();

        match read_message(&mut b).await.unwrap() {
            Message::TouchMember { room_id, username } => {
                assert_eq!(room_id, "room-1");
                assert_eq!(username, "alice");
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = Message::Ack.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::Network(_))));
    }
}
