//! # Codec Contract
//!
//! A [`Codec`] turns a [`Message`] into bytes and back. Transports treat the
//! result as an opaque payload: byte-stream transports wrap it in a length
//! prefix, the WebSocket transport ships it as one binary message.
//!
//! The codec must be *self-describing* so that the `data` payload survives
//! the round trip as a typeless mapping without any schema on the receiving
//! side. The reference implementation is MessagePack ([`MessagePackCodec`]),
//! which encodes the message struct as a six-element array (the stable wire
//! slots) and `data` as a structural MessagePack value.

use crate::error::{Result, SbmError};
use crate::message::Message;

/// Symmetric encode/decode contract between a transport and the message
/// model. Implementations must be cheap to share across tasks.
pub trait Codec: Send + Sync {
    /// Serialize a message to bytes. Failures are reported to the `send`
    /// caller as [`SbmError::Codec`].
    fn encode(&self, message: &Message) -> Result<Vec<u8>>;

    /// Reconstruct a message from bytes. Failures terminate the receive
    /// session they occur on.
    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

/// The reference codec: compact MessagePack via `rmp-serde`.
///
/// Field positions are stable wire slots; identifiers ride as 16-byte
/// binary. A zero-length input is rejected as a codec error, consistently.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackCodec;

impl Codec for MessagePackCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        rmp_serde::to_vec(message).map_err(|e| SbmError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        rmp_serde::from_slice(bytes).map_err(|e| SbmError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn round_trip_preserves_every_field() {
        let codec = MessagePackCodec;
        let mut message = Message::new(
            "orders",
            json!({"items": [1, 2, 3], "note": "rush", "priority": 7, "flag": true}),
        );
        message.reply_to = Some(Uuid::new_v4());
        message.sender_id = Uuid::new_v4();
        message.target_id = Some(Uuid::new_v4());

        let bytes = codec.encode(&message).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded.channel, message.channel);
        assert_eq!(decoded.message_id, message.message_id);
        assert_eq!(decoded.reply_to, message.reply_to);
        assert_eq!(decoded.sender_id, message.sender_id);
        assert_eq!(decoded.target_id, message.target_id);
        assert_eq!(decoded.data, message.data);
    }

    #[test]
    fn round_trip_with_absent_optionals() {
        let codec = MessagePackCodec;
        let message = Message::empty("ping");

        let decoded = codec.decode(&codec.encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.data, None);
        assert_eq!(decoded.reply_to, None);
        assert_eq!(decoded.target_id, None);
    }

    #[test]
    fn scalar_payloads_survive() {
        let codec = MessagePackCodec;
        for payload in [json!("hi"), json!(42), json!(true)] {
            let message = Message::new("scalar", payload.clone());
            let decoded = codec.decode(&codec.encode(&message).unwrap()).unwrap();
            assert_eq!(decoded.data, Some(payload));
        }
    }

    #[test]
    fn empty_input_is_rejected() {
        let codec = MessagePackCodec;
        assert!(matches!(codec.decode(&[]), Err(SbmError::Codec(_))));
    }

    #[test]
    fn garbage_input_is_rejected() {
        let codec = MessagePackCodec;
        assert!(matches!(
            codec.decode(&[0xc1, 0xff, 0x00]),
            Err(SbmError::Codec(_))
        ));
    }
}
