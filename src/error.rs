//! WolfChat Error Types

use thiserror::Error;

/// Result type alias for WolfChat operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfChat error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Input validation (never propagated to peers)
    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    // Room and membership errors
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Room name already in use on this node: {0}")]
    DuplicateRoomName(String),

    #[error("Member {username} not found in room {room_id}")]
    MemberNotFound { room_id: String, username: String },

    #[error("Member {username} already has an active session in room {room_id}")]
    DuplicateMember { room_id: String, username: String },

    #[error("Room {room_id} is busy: {reason}")]
    RoomBusy { room_id: String, reason: String },

    // Authority errors
    #[error("Node is not the administrator of room {room_id} (administrator: {administrator})")]
    NotAdministrator { room_id: String, administrator: String },

    #[error("Administrator {node_id} of room {room_id} is unreachable")]
    AdminUnreachable { room_id: String, node_id: String },

    // Peer RPC errors
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Peer RPC to {node_id} timed out after {timeout_ms} ms")]
    PeerRpcTimeout { node_id: String, timeout_ms: u64 },

    #[error("Peer RPC to {node_id} failed: {reason}")]
    PeerRpcFailure { node_id: String, reason: String },

    // Deletion protocol errors
    #[error("Deletion transaction not found: {0}")]
    TransactionNotFound(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Wire serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an input validation failure
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable by the client
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::AdminUnreachable { .. }
                | Error::PeerRpcTimeout { .. }
                | Error::PeerRpcFailure { .. }
                | Error::RoomBusy { .. }
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }

    /// Stable error code surfaced to clients and peers
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG_ERROR",
            Error::InvalidInput { .. } => "INVALID_INPUT",
            Error::RoomNotFound(_) => "ROOM_NOT_FOUND",
            Error::DuplicateRoomName(_) => "DUPLICATE_ROOM",
            Error::MemberNotFound { .. } => "MEMBER_NOT_FOUND",
            Error::DuplicateMember { .. } => "DUPLICATE_MEMBER",
            Error::RoomBusy { .. } => "ROOM_BUSY",
            Error::NotAdministrator { .. } => "NOT_ADMINISTRATOR",
            Error::AdminUnreachable { .. } => "ADMIN_UNREACHABLE",
            Error::PeerNotFound(_) => "PEER_NOT_FOUND",
            Error::PeerRpcTimeout { .. } => "PEER_RPC_TIMEOUT",
            Error::PeerRpcFailure { .. } => "PEER_RPC_FAILURE",
            Error::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            Error::Network(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_) => "NETWORK_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Room the error refers to, if any
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Error::RoomNotFound(room_id)
            | Error::MemberNotFound { room_id, .. }
            | Error::DuplicateMember { room_id, .. }
            | Error::RoomBusy { room_id, .. }
            | Error::NotAdministrator { room_id, .. }
            | Error::AdminUnreachable { room_id, .. } => Some(room_id),
            _ => None,
        }
    }

    /// Rebuild an error reported by a remote peer.
    ///
    /// Errors that carry structured context on the wire are restored to their
    /// typed form; anything else becomes a failure of the peer call.
    pub fn from_remote(node_id: &str, remote: crate::network::RemoteError) -> Self {
        use crate::network::RemoteError;
        match remote {
            RemoteError::RoomNotFound { room_id } => Error::RoomNotFound(room_id),
            RemoteError::MemberNotFound { room_id, username } => {
                Error::MemberNotFound { room_id, username }
            }
            RemoteError::DuplicateMember { room_id, username } => {
                Error::DuplicateMember { room_id, username }
            }
            RemoteError::RoomBusy { room_id, reason } => Error::RoomBusy { room_id, reason },
            RemoteError::NotAdministrator {
                room_id,
                administrator,
            } => Error::NotAdministrator {
                room_id,
                administrator,
            },
            RemoteError::InvalidInput { field, reason } => Error::InvalidInput {
                field: crate::validation::field_name(&field),
                reason,
            },
            RemoteError::TransactionNotFound { transaction_id } => {
                Error::TransactionNotFound(transaction_id)
            }
            RemoteError::Other { code, message } => Error::PeerRpcFailure {
                node_id: node_id.to_string(),
                reason: format!("{}: {}", code, message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context_in_message() {
        let err = Error::MemberNotFound {
            room_id: "room-1".into(),
            username: "alice".into(),
        };
        assert_eq!(err.to_string(), "Member alice not found in room room-1");
        assert_eq!(err.room_id(), Some("room-1"));
        assert_eq!(err.code(), "MEMBER_NOT_FOUND");
    }

    #[test]
    fn test_retryable_classification() {
        let unreachable = Error::AdminUnreachable {
            room_id: "r".into(),
            node_id: "node-2".into(),
        };
        assert!(unreachable.is_retryable());
        assert!(!Error::invalid("content", "empty").is_retryable());
        assert!(!Error::RoomNotFound("r".into()).is_retryable());
    }
}
