//! Wire schema for the `/video` namespace.
//!
//! Every message travels as one JSON text frame:
//!
//! ```text
//! {"v":1,"event":"video_frame","data":{"stream_id":"demo","frame":"<b64>","nonce":"<b64>","tag":"<b64>"}}
//! ```
//!
//! Binary fields are standard base64 so no byte is reinterpreted as text.
//! [`decode`] is the only way peer input enters the system: it checks the
//! protocol version and the structural constraints of each message before
//! anything downstream sees it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version carried in the `v` field of every message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Namespace the relay serves the transport on.
pub const DEFAULT_NAMESPACE: &str = "/video";

/// AEAD nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AEAD authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Kyber768 public key length in bytes.
pub const KEM_PUBLIC_KEY_LEN: usize = 1184;

/// Kyber768 encapsulation ciphertext length in bytes.
pub const KEM_CIPHERTEXT_LEN: usize = 1088;

/// Longest accepted stream identifier, in bytes.
pub const MAX_STREAM_ID_LEN: usize = 128;

/// One encrypted frame as sent by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    pub stream_id: String,
    /// ChaCha20-Poly1305 ciphertext without the tag.
    #[serde(rename = "frame", with = "b64")]
    pub ciphertext: Bytes,
    #[serde(with = "b64")]
    pub nonce: Bytes,
    #[serde(with = "b64")]
    pub tag: Bytes,
}

/// Every message exchanged on the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Producer claims a stream id.
    RegisterStream { stream_id: String },

    /// Subscriber asks for the current directory.
    GetStreamList,

    /// Current directory, in registration order.
    StreamListUpdate { stream_ids: Vec<String> },

    /// Producer starts a handshake with its KEM public key.
    KeyExchange {
        stream_id: String,
        #[serde(with = "b64")]
        public_key: Bytes,
    },

    /// Relay answers with the KEM ciphertext.
    KeyExchangeResponse {
        stream_id: String,
        #[serde(with = "b64")]
        ciphertext: Bytes,
    },

    /// Encrypted frame from a producer.
    VideoFrame(FrameEnvelope),

    /// Re-encoded frame fanned out to subscribers.
    BroadcastFrame {
        stream_id: String,
        #[serde(with = "b64")]
        frame: Bytes,
    },

    /// Operator flips the global decryption toggle.
    ToggleDecryption,

    /// Current state of the decryption toggle.
    DecryptionStatus { enabled: bool },
}

impl RelayMessage {
    /// Wire name of the message, used in logs.
    pub fn event(&self) -> &'static str {
        match self {
            Self::RegisterStream { .. } => "register_stream",
            Self::GetStreamList => "get_stream_list",
            Self::StreamListUpdate { .. } => "stream_list_update",
            Self::KeyExchange { .. } => "key_exchange",
            Self::KeyExchangeResponse { .. } => "key_exchange_response",
            Self::VideoFrame(_) => "video_frame",
            Self::BroadcastFrame { .. } => "broadcast_frame",
            Self::ToggleDecryption => "toggle_decryption",
            Self::DecryptionStatus { .. } => "decryption_status",
        }
    }

    /// Stream the message refers to, if any.
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            Self::RegisterStream { stream_id }
            | Self::KeyExchange { stream_id, .. }
            | Self::KeyExchangeResponse { stream_id, .. }
            | Self::BroadcastFrame { stream_id, .. } => Some(stream_id),
            Self::VideoFrame(envelope) => Some(&envelope.stream_id),
            Self::GetStreamList
            | Self::StreamListUpdate { .. }
            | Self::ToggleDecryption
            | Self::DecryptionStatus { .. } => None,
        }
    }

    /// Check structural constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if let Some(stream_id) = self.stream_id() {
            validate_stream_id(stream_id)?;
        }
        match self {
            Self::KeyExchange { public_key, .. } if public_key.len() != KEM_PUBLIC_KEY_LEN => {
                Err(Error::protocol(format!(
                    "public key must be {} bytes, got {}",
                    KEM_PUBLIC_KEY_LEN,
                    public_key.len()
                )))
            }
            Self::KeyExchangeResponse { ciphertext, .. }
                if ciphertext.len() != KEM_CIPHERTEXT_LEN =>
            {
                Err(Error::protocol(format!(
                    "kem ciphertext must be {} bytes, got {}",
                    KEM_CIPHERTEXT_LEN,
                    ciphertext.len()
                )))
            }
            Self::VideoFrame(envelope) => {
                if envelope.nonce.len() != NONCE_LEN {
                    return Err(Error::protocol(format!(
                        "nonce must be {} bytes, got {}",
                        NONCE_LEN,
                        envelope.nonce.len()
                    )));
                }
                if envelope.tag.len() != TAG_LEN {
                    return Err(Error::protocol(format!(
                        "tag must be {} bytes, got {}",
                        TAG_LEN,
                        envelope.tag.len()
                    )));
                }
                Ok(())
            }
            Self::StreamListUpdate { stream_ids } => {
                stream_ids.iter().try_for_each(|id| validate_stream_id(id))
            }
            _ => Ok(()),
        }
    }
}

fn validate_stream_id(stream_id: &str) -> Result<()> {
    if stream_id.is_empty() {
        return Err(Error::protocol("empty stream_id"));
    }
    if stream_id.len() > MAX_STREAM_ID_LEN {
        return Err(Error::protocol(format!(
            "stream_id longer than {} bytes",
            MAX_STREAM_ID_LEN
        )));
    }
    Ok(())
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    v: u8,
    #[serde(flatten)]
    message: &'a RelayMessage,
}

#[derive(Deserialize)]
struct InboundFrame {
    v: u8,
    #[serde(flatten)]
    message: RelayMessage,
}

/// Serialize a message into one text frame.
pub fn encode(message: &RelayMessage) -> Result<String> {
    serde_json::to_string(&OutboundFrame {
        v: PROTOCOL_VERSION,
        message,
    })
    .map_err(Error::serialization)
}

/// Parse and validate one text frame.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for malformed JSON, unknown events, bad base64,
/// a version mismatch, or any constraint checked by [`RelayMessage::validate`].
pub fn decode(text: &str) -> Result<RelayMessage> {
    let frame: InboundFrame = serde_json::from_str(text).map_err(Error::protocol)?;
    if frame.v != PROTOCOL_VERSION {
        return Err(Error::protocol(format!(
            "unsupported protocol version {}",
            frame.v
        )));
    }
    frame.message.validate()?;
    Ok(frame.message)
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> RelayMessage {
        RelayMessage::VideoFrame(FrameEnvelope {
            stream_id: "demo".into(),
            ciphertext: Bytes::from_static(&[0, 159, 146, 150, 255]),
            nonce: Bytes::from(vec![7u8; NONCE_LEN]),
            tag: Bytes::from(vec![9u8; TAG_LEN]),
        })
    }

    #[test]
    fn test_frame_layout() {
        let text = encode(&sample_frame()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["event"], "video_frame");
        assert_eq!(value["data"]["stream_id"], "demo");
        assert_eq!(value["data"]["frame"], "AJ+Slv8=");
    }

    #[test]
    fn test_binary_fields_survive() {
        let message = sample_frame();
        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_unit_events() {
        let decoded = decode(r#"{"v":1,"event":"get_stream_list"}"#).unwrap();
        assert_eq!(decoded, RelayMessage::GetStreamList);
        let decoded = decode(r#"{"v":1,"event":"toggle_decryption"}"#).unwrap();
        assert_eq!(decoded, RelayMessage::ToggleDecryption);
    }

    #[test]
    fn test_stream_list_order_kept() {
        let message = RelayMessage::StreamListUpdate {
            stream_ids: vec!["b".into(), "a".into(), "c".into()],
        };
        match decode(&encode(&message).unwrap()).unwrap() {
            RelayMessage::StreamListUpdate { stream_ids } => {
                assert_eq!(stream_ids, vec!["b", "a", "c"]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_rejects_wrong_version() {
        let err = decode(r#"{"v":2,"event":"get_stream_list"}"#).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_rejects_unknown_event() {
        assert!(decode(r#"{"v":1,"event":"launch_missiles"}"#).is_err());
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"event":"get_stream_list"}"#).is_err());
    }

    #[test]
    fn test_rejects_bad_base64() {
        let text = r#"{"v":1,"event":"key_exchange","data":{"stream_id":"demo","public_key":"***"}}"#;
        assert!(decode(text).is_err());
    }

    #[test]
    fn test_rejects_missing_field() {
        let text = r#"{"v":1,"event":"key_exchange","data":{"stream_id":"demo"}}"#;
        assert!(decode(text).is_err());
    }

    #[test]
    fn test_rejects_bad_nonce_and_tag_lengths() {
        let mut short_nonce = sample_frame();
        if let RelayMessage::VideoFrame(envelope) = &mut short_nonce {
            envelope.nonce = Bytes::from_static(&[1, 2, 3]);
        }
        assert!(decode(&encode(&short_nonce).unwrap()).is_err());

        let mut long_tag = sample_frame();
        if let RelayMessage::VideoFrame(envelope) = &mut long_tag {
            envelope.tag = Bytes::from(vec![0u8; TAG_LEN + 1]);
        }
        assert!(decode(&encode(&long_tag).unwrap()).is_err());
    }

    #[test]
    fn test_rejects_bad_stream_ids() {
        let empty = RelayMessage::RegisterStream {
            stream_id: String::new(),
        };
        assert!(empty.validate().is_err());

        let long = RelayMessage::RegisterStream {
            stream_id: "x".repeat(MAX_STREAM_ID_LEN + 1),
        };
        assert!(long.validate().is_err());

        let ok = RelayMessage::RegisterStream {
            stream_id: "Big Buck Bunny".into(),
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_public_key() {
        let message = RelayMessage::KeyExchange {
            stream_id: "demo".into(),
            public_key: Bytes::new(),
        };
        assert!(message.validate().is_err());
    }

    #[test]
    fn test_rejects_wrong_kem_lengths() {
        let short_key = RelayMessage::KeyExchange {
            stream_id: "demo".into(),
            public_key: Bytes::from(vec![7; KEM_PUBLIC_KEY_LEN - 1]),
        };
        let err = decode(&encode(&short_key).unwrap()).unwrap_err();
        assert!(err.to_string().contains("public key must be"));

        let long_ciphertext = RelayMessage::KeyExchangeResponse {
            stream_id: "demo".into(),
            ciphertext: Bytes::from(vec![7; KEM_CIPHERTEXT_LEN + 1]),
        };
        assert!(decode(&encode(&long_ciphertext).unwrap()).is_err());

        let exact = RelayMessage::KeyExchange {
            stream_id: "demo".into(),
            public_key: Bytes::from(vec![7; KEM_PUBLIC_KEY_LEN]),
        };
        assert_eq!(decode(&encode(&exact).unwrap()).unwrap(), exact);
    }

    #[test]
    fn test_event_and_stream_id_accessors() {
        let message = sample_frame();
        assert_eq!(message.event(), "video_frame");
        assert_eq!(message.stream_id(), Some("demo"));
        assert_eq!(RelayMessage::ToggleDecryption.stream_id(), None);
    }
}
