//! The small tagged union of messages exchanged once a session is running
//! heartbeats, acknowledgements and user broadcasts. Everything
//! before the session starts (advertising/info messages, challenge and
//! response bytes) is handled directly by `branch_info` and
//! `branch_connection` since those frames never go through the queued
//! `MessageTransport` path.

use crate::error::{YogiError, YogiResult};

/// Tag byte for an acknowledgement. A heartbeat carries no tag at all: its
/// entire encoded form is the empty byte vector (the size prefix alone
/// says "zero bytes follow").
pub const ACK_TAG: u8 = 0x55;
/// Tag byte for a user broadcast.
pub const BROADCAST_TAG: u8 = 0xBC;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Heartbeat,
    Acknowledge,
    Broadcast(Vec<u8>),
}

impl Message {
    /// Encodes the message body (not including the size prefix).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Message::Heartbeat => Vec::new(),
            Message::Acknowledge => vec![ACK_TAG],
            Message::Broadcast(payload) => {
                let mut buf = Vec::with_capacity(1 + payload.len());
                buf.push(BROADCAST_TAG);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Decodes a message body as handed over by `MessageTransport::receive`.
    /// An empty body is a heartbeat; any other body's first byte is the tag.
    pub fn from_bytes(body: &[u8]) -> YogiResult<Self> {
        match body.first() {
            None => Ok(Message::Heartbeat),
            Some(&ACK_TAG) if body.len() == 1 => Ok(Message::Acknowledge),
            Some(&BROADCAST_TAG) => Ok(Message::Broadcast(body[1..].to_vec())),
            _ => Err(YogiError::DeserializeMsgFailed),
        }
    }
}

/// Transcodes a broadcast payload between the wire's MessagePack encoding
/// and the JSON representation the host application deals with at the
/// public API boundary.
pub fn msgpack_to_json(payload: &[u8]) -> YogiResult<serde_json::Value> {
    rmp_serde::from_slice(payload).map_err(|_| YogiError::InvalidUserMsgpack)
}

/// Transcodes a JSON broadcast payload into the MessagePack bytes actually
/// sent on the wire.
pub fn json_to_msgpack(value: &serde_json::Value) -> YogiResult<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|_| YogiError::ParsingJsonFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_encodes_to_the_empty_body() {
        assert_eq!(Message::Heartbeat.to_bytes(), Vec::<u8>::new());
        assert_eq!(Message::from_bytes(&[]).unwrap(), Message::Heartbeat);
    }

    #[test]
    fn acknowledge_round_trips_through_its_tag_byte() {
        let bytes = Message::Acknowledge.to_bytes();
        assert_eq!(bytes, vec![ACK_TAG]);
        assert_eq!(Message::from_bytes(&bytes).unwrap(), Message::Acknowledge);
    }

    #[test]
    fn broadcast_round_trips_with_payload_after_its_tag() {
        let msg = Message::Broadcast(vec![1, 2, 3]);
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], BROADCAST_TAG);
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_tag_fails_to_deserialize() {
        assert!(Message::from_bytes(&[0x42, 0x00]).is_err());
    }

    #[test]
    fn acknowledge_tag_with_trailing_bytes_is_rejected() {
        assert!(Message::from_bytes(&[ACK_TAG, 0x00]).is_err());
    }

    #[test]
    fn json_msgpack_transcoding_round_trips() {
        let value = serde_json::json!({"a": 1, "b": [true, "x"]});
        let bytes = json_to_msgpack(&value).unwrap();
        let back = msgpack_to_json(&bytes).unwrap();
        assert_eq!(back, value);
    }
}
