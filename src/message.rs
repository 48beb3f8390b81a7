//! # Message Model
//!
//! [`Message`] is the on-wire unit exchanged between peers. It carries a
//! routing channel, an opaque payload, and the identity/correlation fields
//! the dispatcher needs to route replies.
//!
//! ## Wire slots
//!
//! The field declaration order below *is* the wire format: the reference
//! codec serializes the struct as a six-element array, so reordering fields
//! is a wire-breaking change.
//!
//! | Slot | Field        | Type                     |
//! |------|--------------|--------------------------|
//! | 0    | `channel`    | string                   |
//! | 1    | `data`       | self-describing value    |
//! | 2    | `reply_to`   | optional 128-bit id      |
//! | 3    | `message_id` | 128-bit id               |
//! | 4    | `sender_id`  | 128-bit id               |
//! | 5    | `target_id`  | optional 128-bit id      |
//!
//! ## Reply channels
//!
//! A reply to a request travels on the derived channel
//! `"{channel}_reply_{message_id}"`. Keying the reply channel on the request
//! id lets concurrent requests on the same channel correlate independently,
//! and lets the request/response machinery reuse the ordinary handler
//! registry instead of a dedicated reply bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved channel for the authentication handshake.
pub const AUTH_CHANNEL: &str = "_auth_";

/// Reserved channel on which the server announces the assigned client id
/// immediately after accepting a connection.
pub const CLIENT_ID_CHANNEL: &str = "_client_id_";

/// The all-zero identifier denoting server origin. Clients never generate
/// this id for themselves.
pub const SERVER_ID: Uuid = Uuid::nil();

/// The on-wire message unit.
///
/// `data` is opaque to the dispatcher: it is carried as a self-describing
/// [`Value`] and only application handlers (or the auth gate, for its own
/// reserved channel) ever look inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Routing key. Non-empty for every message the dispatcher handles.
    pub channel: String,
    /// Opaque payload; preserved structurally by the codec.
    pub data: Option<Value>,
    /// Set iff this message is a reply; equals the request's `message_id`.
    pub reply_to: Option<Uuid>,
    /// Fresh per message; unique within a connection's lifetime with
    /// overwhelming probability.
    pub message_id: Uuid,
    /// Identity of the sending peer; [`SERVER_ID`] for server origin.
    pub sender_id: Uuid,
    /// Present when a server directs a message at a specific client.
    pub target_id: Option<Uuid>,
}

impl Message {
    /// Create a message on `channel` carrying `data`.
    pub fn new(channel: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            channel: channel.into(),
            data: Some(data.into()),
            reply_to: None,
            message_id: Uuid::new_v4(),
            sender_id: SERVER_ID,
            target_id: None,
        }
    }

    /// Create a message with no payload.
    pub fn empty(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            data: None,
            reply_to: None,
            message_id: Uuid::new_v4(),
            sender_id: SERVER_ID,
            target_id: None,
        }
    }

    /// Build the reply to `request` carrying `data`.
    ///
    /// The reply travels on the request's derived reply channel, is
    /// correlated via `reply_to`, and targets the requester. The sender
    /// identity is stamped by the dispatcher when the reply is sent.
    pub fn from_reply(request: &Message, data: impl Into<Value>) -> Self {
        Self {
            channel: request.reply_channel(),
            data: Some(data.into()),
            reply_to: Some(request.message_id),
            message_id: Uuid::new_v4(),
            sender_id: SERVER_ID,
            target_id: Some(request.sender_id),
        }
    }

    /// The channel a reply to this message travels on:
    /// `"{channel}_reply_{message_id}"`.
    pub fn reply_channel(&self) -> String {
        format!("{}_reply_{}", self.channel, self.message_id)
    }

    /// Whether this message is a reply to an earlier request.
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Look up `key` in the payload, treating it as a typeless mapping.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref()?.get(key)
    }

    /// String-typed payload field access.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key)?.as_str()
    }

    /// Boolean-typed payload field access.
    pub fn field_bool(&self, key: &str) -> Option<bool> {
        self.field(key)?.as_bool()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_channel_embeds_request_id() {
        let request = Message::new("echo", json!("hi"));
        let expected = format!("echo_reply_{}", request.message_id);
        assert_eq!(request.reply_channel(), expected);
    }

    #[test]
    fn from_reply_correlates_and_targets_requester() {
        let mut request = Message::new("echo", json!("hi"));
        request.sender_id = Uuid::new_v4();

        let reply = Message::from_reply(&request, json!("hi"));
        assert_eq!(reply.channel, request.reply_channel());
        assert_eq!(reply.reply_to, Some(request.message_id));
        assert_eq!(reply.target_id, Some(request.sender_id));
        assert_ne!(reply.message_id, request.message_id);
        assert!(reply.is_reply());
    }

    #[test]
    fn fresh_ids_per_message() {
        let a = Message::empty("c");
        let b = Message::empty("c");
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.sender_id, SERVER_ID);
    }

    #[test]
    fn payload_field_access() {
        let msg = Message::new("auth", json!({"Id": "user", "Success": true}));
        assert_eq!(msg.field_str("Id"), Some("user"));
        assert_eq!(msg.field_bool("Success"), Some(true));
        assert_eq!(msg.field("Missing"), None);
        assert_eq!(Message::empty("auth").field("Id"), None);
    }
}
