use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_RELAY_PORT: u16 = 65432;
pub const DEFAULT_DISCOVERY_PORT: u16 = 65433;
pub const DEFAULT_PAIRING_PORT: u16 = 65434;
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 4096;
pub const MAX_CLIPBOARD_TEXT_BYTES: usize = 256 * 1024;
pub const MAX_MESSAGE_BYTES: usize = 300 * 1024;
/// Name used when a peer has not reported one yet.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Discovery,
    PairingRequest,
    PairingResponse,
    ClipboardData,
    Ping,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Discovery => "discovery",
            MessageKind::PairingRequest => "pairing_request",
            MessageKind::PairingResponse => "pairing_response",
            MessageKind::ClipboardData => "clipboard_data",
            MessageKind::Ping => "ping",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed body of a message, one variant per [`MessageKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Discovery,
    PairingRequest,
    PairingResponse { accepted: bool },
    ClipboardData { text: String },
    Ping,
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Discovery => MessageKind::Discovery,
            Payload::PairingRequest => MessageKind::PairingRequest,
            Payload::PairingResponse { .. } => MessageKind::PairingResponse,
            Payload::ClipboardData { .. } => MessageKind::ClipboardData,
            Payload::Ping => MessageKind::Ping,
        }
    }

    fn into_data(self) -> Map<String, Value> {
        let mut data = Map::new();
        match self {
            Payload::PairingResponse { accepted } => {
                data.insert("accepted".to_owned(), Value::Bool(accepted));
            }
            Payload::ClipboardData { text } => {
                data.insert("text".to_owned(), Value::String(text));
            }
            Payload::Discovery | Payload::PairingRequest | Payload::Ping => {}
        }
        data
    }

    fn from_data(kind: MessageKind, mut data: Map<String, Value>) -> Result<Self, CoreError> {
        match kind {
            MessageKind::Discovery => Ok(Payload::Discovery),
            MessageKind::PairingRequest => Ok(Payload::PairingRequest),
            MessageKind::Ping => Ok(Payload::Ping),
            MessageKind::PairingResponse => match data.get("accepted") {
                Some(Value::Bool(accepted)) => Ok(Payload::PairingResponse {
                    accepted: *accepted,
                }),
                _ => Err(CoreError::MalformedMessage(
                    "pairing_response requires boolean data.accepted".to_owned(),
                )),
            },
            MessageKind::ClipboardData => match data.remove("text") {
                Some(Value::String(text)) => Ok(Payload::ClipboardData { text }),
                _ => Err(CoreError::MalformedMessage(
                    "clipboard_data requires string data.text".to_owned(),
                )),
            },
        }
    }
}

/// One protocol exchange: a UDP datagram or the single message of a TCP connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub struct Message {
    pub payload: Payload,
    pub sender_ip: String,
    pub sender_name: String,
    /// Creation time in fractional unix seconds. Any JSON number is accepted
    /// on decode.
    pub timestamp: f64,
    pub id: String,
}

impl Message {
    /// Builds a message stamped with the current time and a fresh id.
    pub fn new(
        payload: Payload,
        sender_ip: impl Into<String>,
        sender_name: impl Into<String>,
    ) -> Self {
        Self {
            payload,
            sender_ip: sender_ip.into(),
            sender_name: sender_name.into(),
            timestamp: now_unix_secs(),
            id: Uuid::new_v4().to_string(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

// Wire shape. `data` stays an open map on the wire and is narrowed into
// `Payload` by the `type` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: MessageKind,
    data: Map<String, Value>,
    sender_ip: String,
    sender_name: String,
    timestamp: f64,
    id: String,
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Self {
            kind: message.payload.kind(),
            data: message.payload.into_data(),
            sender_ip: message.sender_ip,
            sender_name: message.sender_name,
            timestamp: message.timestamp,
            id: message.id,
        }
    }
}

impl TryFrom<Envelope> for Message {
    type Error = CoreError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        Ok(Self {
            payload: Payload::from_data(envelope.kind, envelope.data)?,
            sender_ip: envelope.sender_ip,
            sender_name: envelope.sender_name,
            timestamp: envelope.timestamp,
            id: envelope.id,
        })
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub fn encode_message(message: &Message) -> Result<Vec<u8>, CoreError> {
    let bytes =
        serde_json::to_vec(message).map_err(|err| CoreError::Serialization(err.to_string()))?;
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(CoreError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(bytes)
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, CoreError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(CoreError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| CoreError::MalformedMessage(err.to_string()))
}

pub fn now_unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: Payload) -> Message {
        Message {
            payload,
            sender_ip: "192.168.1.20".to_owned(),
            sender_name: "desk-a".to_owned(),
            timestamp: 1_735_000_000.25,
            id: "5a1c9e0e-8a0e-4c4e-9a43-5f1d0c9d7c11".to_owned(),
        }
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let message = sample(Payload::ClipboardData {
            text: "line one\nline two \u{1F4CB} \"quoted\"".to_owned(),
        });
        let decoded = decode_message(&encode_message(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);

        let response = sample(Payload::PairingResponse { accepted: true });
        let decoded = decode_message(&encode_message(&response).unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn wire_envelope_uses_protocol_field_names() {
        let message = sample(Payload::PairingResponse { accepted: false });
        let value: Value = serde_json::from_slice(&encode_message(&message).unwrap()).unwrap();
        assert_eq!(value["type"], "pairing_response");
        assert_eq!(value["data"]["accepted"], false);
        assert_eq!(value["sender_ip"], "192.168.1.20");
        assert_eq!(value["sender_name"], "desk-a");
        assert_eq!(value["timestamp"], 1_735_000_000.25);
        assert_eq!(value["id"], "5a1c9e0e-8a0e-4c4e-9a43-5f1d0c9d7c11");

        let discovery = sample(Payload::Discovery);
        let value: Value = serde_json::from_slice(&encode_message(&discovery).unwrap()).unwrap();
        assert_eq!(value["data"], serde_json::json!({}));
    }

    #[test]
    fn unknown_type_is_malformed() {
        let raw = br#"{"type":"teleport","data":{},"sender_ip":"10.0.0.1","sender_name":"x","timestamp":1,"id":"a"}"#;
        assert!(matches!(
            decode_message(raw),
            Err(CoreError::MalformedMessage(_))
        ));
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        let no_id = br#"{"type":"ping","data":{},"sender_ip":"10.0.0.1","sender_name":"x","timestamp":1}"#;
        assert!(matches!(
            decode_message(no_id),
            Err(CoreError::MalformedMessage(_))
        ));

        let no_text = br#"{"type":"clipboard_data","data":{},"sender_ip":"10.0.0.1","sender_name":"x","timestamp":1,"id":"a"}"#;
        assert!(matches!(
            decode_message(no_text),
            Err(CoreError::MalformedMessage(_))
        ));

        let wrong_accepted = br#"{"type":"pairing_response","data":{"accepted":"yes"},"sender_ip":"10.0.0.1","sender_name":"x","timestamp":1,"id":"a"}"#;
        assert!(matches!(
            decode_message(wrong_accepted),
            Err(CoreError::MalformedMessage(_))
        ));
    }

    #[test]
    fn truncated_and_garbage_input_never_panics() {
        let encoded = encode_message(&sample(Payload::Discovery)).unwrap();
        for cut in [0, 1, encoded.len() / 2, encoded.len() - 1] {
            assert!(decode_message(&encoded[..cut]).is_err());
        }
        assert!(decode_message(&[0xff, 0xfe, 0x00]).is_err());
        assert!(decode_message(b"[1,2,3]").is_err());
        assert!(decode_message(b"null").is_err());
    }

    #[test]
    fn extra_payload_keys_are_tolerated() {
        let raw = br#"{"type":"discovery","data":{"version":2},"sender_ip":"10.0.0.1","sender_name":"x","timestamp":7,"id":"a"}"#;
        let message = decode_message(raw).unwrap();
        assert_eq!(message.payload, Payload::Discovery);
        assert_eq!(message.timestamp, 7.0);
    }

    #[test]
    fn fractional_and_integer_timestamps_both_decode() {
        let raw = br#"{"type": "discovery", "data": {}, "sender_ip": "192.168.1.31", "sender_name": "laptop", "timestamp": 1735000000.123456, "id": "0f8fad5b-d9cb-469f-a165-70867728950e"}"#;
        let message = decode_message(raw).unwrap();
        assert_eq!(message.payload, Payload::Discovery);
        assert_eq!(message.sender_name, "laptop");
        assert_eq!(message.timestamp, 1_735_000_000.123456);

        let clip = br#"{"type": "clipboard_data", "data": {"text": "hi"}, "sender_ip": "192.168.1.31", "sender_name": "laptop", "timestamp": 1735000000, "id": "b"}"#;
        let message = decode_message(clip).unwrap();
        assert_eq!(message.timestamp, 1_735_000_000.0);
        assert_eq!(
            message.payload,
            Payload::ClipboardData {
                text: "hi".to_owned()
            }
        );

        let text_stamp = br#"{"type":"ping","data":{},"sender_ip":"10.0.0.1","sender_name":"x","timestamp":"now","id":"a"}"#;
        assert!(matches!(
            decode_message(text_stamp),
            Err(CoreError::MalformedMessage(_))
        ));
    }

    #[test]
    fn fresh_messages_are_stamped_in_seconds() {
        let before = now_unix_secs();
        let message = Message::new(Payload::Ping, "10.0.0.1", "a");
        assert!(message.timestamp >= before);
        // Seconds, not milliseconds: well below year 5000 in seconds.
        assert!(message.timestamp < 100_000_000_000.0);
        let decoded = decode_message(&encode_message(&message).unwrap()).unwrap();
        assert_eq!(decoded.timestamp, message.timestamp);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let message = sample(Payload::ClipboardData {
            text: "x".repeat(MAX_MESSAGE_BYTES),
        });
        assert!(matches!(
            encode_message(&message),
            Err(CoreError::MessageTooLarge { .. })
        ));
        assert!(matches!(
            decode_message(&vec![b' '; MAX_MESSAGE_BYTES + 1]),
            Err(CoreError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn new_messages_get_distinct_ids() {
        let a = Message::new(Payload::Ping, "10.0.0.1", "a");
        let b = Message::new(Payload::Ping, "10.0.0.1", "a");
        assert_ne!(a.id, b.id);
        assert_eq!(a.kind(), MessageKind::Ping);
    }
}
