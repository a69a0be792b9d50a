//! Input Validation
//!
//! Checks applied locally before a request touches room state or the network.

use crate::error::{Error, Result};

/// Default maximum message length in characters
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 5000;

/// Maximum room name length in characters
pub const MAX_ROOM_NAME_LENGTH: usize = 100;

/// Validate a room name
pub fn validate_room_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid("name", "room name cannot be empty"));
    }
    if name.chars().count() > MAX_ROOM_NAME_LENGTH {
        return Err(Error::invalid(
            "name",
            format!("room name too long (max {} characters)", MAX_ROOM_NAME_LENGTH),
        ));
    }
    Ok(())
}

/// Validate a username
pub fn validate_username(username: &str) -> Result<()> {
    if username.trim().is_empty() {
        return Err(Error::invalid("username", "username cannot be empty"));
    }
    Ok(())
}

/// Validate message content against the configured length limit
pub fn validate_message_content(content: &str, max_length: usize) -> Result<()> {
    if content.is_empty() {
        return Err(Error::invalid("content", "message content cannot be empty"));
    }
    // Length is measured in characters, not bytes
    let length = content.chars().count();
    if length > max_length {
        return Err(Error::invalid(
            "content",
            format!(
                "message content too long ({} characters, max {})",
                length, max_length
            ),
        ));
    }
    Ok(())
}

/// Validate a client-supplied identifier (message or transaction id)
pub fn validate_client_id(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid(field, "identifier cannot be empty"));
    }
    Ok(())
}

/// Map a field name received from a peer back to its static form
pub fn field_name(field: &str) -> &'static str {
    match field {
        "name" => "name",
        "content" => "content",
        "username" => "username",
        "room_id" => "room_id",
        "client_message_id" => "client_message_id",
        "transaction_id" => "transaction_id",
        _ => "request",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_content_limits() {
        assert!(validate_message_content("hi", DEFAULT_MAX_MESSAGE_LENGTH).is_ok());
        assert!(validate_message_content("", DEFAULT_MAX_MESSAGE_LENGTH).is_err());

        let at_limit = "a".repeat(DEFAULT_MAX_MESSAGE_LENGTH);
        assert!(validate_message_content(&at_limit, DEFAULT_MAX_MESSAGE_LENGTH).is_ok());

        let over = "a".repeat(DEFAULT_MAX_MESSAGE_LENGTH + 1);
        let err = validate_message_content(&over, DEFAULT_MAX_MESSAGE_LENGTH).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { field: "content", .. }));
    }

    #[test]
    fn test_multibyte_content_counts_characters() {
        // 5000 two-byte characters is still within the limit
        let content = "é".repeat(DEFAULT_MAX_MESSAGE_LENGTH);
        assert!(validate_message_content(&content, DEFAULT_MAX_MESSAGE_LENGTH).is_ok());
    }

    #[test]
    fn test_room_name() {
        assert!(validate_room_name("general").is_ok());
        assert!(validate_room_name("   ").is_err());
        assert!(validate_room_name("").is_err());
    }

    #[test]
    fn test_field_name_round_trip() {
        assert_eq!(field_name("content"), "content");
        assert_eq!(field_name("something-else"), "request");
    }
}
