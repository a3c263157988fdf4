//! Message payloads and their JSON envelope.
//!
//! Wire format: `{ "v": 1, "stamp": {...}, "message": { "type": "...", ... } }`
//!
//! The envelope version lets a newer peer add fields or variants without
//! breaking older ones: unknown versions and unknown message types decode to
//! `None` and are dropped by the channel.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncError;
use crate::record::Stamp;

/// Current envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Maximum accepted payload size (64 KiB). The record is two short strings.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Messages exchanged between participants of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// The shared file changed.
    Update { file: String },
    /// Sent to newly joined participants (and on local welcome edits).
    WelcomeParticipant { welcome_message: String },
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::WelcomeParticipant { .. } => "welcome_participant",
        }
    }
}

/// Wire wrapper around every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stamp: Option<Stamp>,
    pub message: SyncMessage,
}

impl Envelope {
    pub fn new(message: SyncMessage) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            stamp: None,
            message,
        }
    }

    pub fn stamped(message: SyncMessage, stamp: Stamp) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            stamp: Some(stamp),
            message,
        }
    }
}

impl From<SyncMessage> for Envelope {
    fn from(message: SyncMessage) -> Self {
        Envelope::new(message)
    }
}

/// Loose view used to check the version before committing to a message type.
#[derive(Deserialize)]
struct RawEnvelope {
    v: u32,
    #[serde(default)]
    stamp: Option<Stamp>,
    message: serde_json::Value,
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, SyncError> {
    let bytes = serde_json::to_vec(envelope).map_err(|e| SyncError::Encode(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(SyncError::Encode(format!(
            "message too large: {} bytes (max {})",
            bytes.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(bytes)
}

/// Decode an envelope.
///
/// Returns `Ok(None)` for frames from a newer protocol (unknown version or
/// message type) and `Err` for frames that are not an envelope at all.
pub fn decode_envelope(bytes: &[u8]) -> Result<Option<Envelope>, SyncError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(SyncError::Decode(format!(
            "message too large: {} bytes (max {})",
            bytes.len(),
            MAX_MESSAGE_SIZE
        )));
    }

    let raw: RawEnvelope = serde_json::from_slice(bytes)?;
    if raw.v != ENVELOPE_VERSION {
        debug!(version = raw.v, "unknown envelope version, skipping");
        return Ok(None);
    }

    match serde_json::from_value::<SyncMessage>(raw.message) {
        Ok(message) => Ok(Some(Envelope {
            v: raw.v,
            stamp: raw.stamp,
            message,
        })),
        Err(e) => {
            debug!(error = %e, "unknown or malformed message type, skipping");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ParticipantId;

    #[test]
    fn update_roundtrip() {
        let env = Envelope::new(SyncMessage::Update { file: "x".into() });
        let bytes = encode_envelope(&env).unwrap();
        assert_eq!(decode_envelope(&bytes).unwrap(), Some(env));
    }

    #[test]
    fn welcome_roundtrip() {
        let env = Envelope::stamped(
            SyncMessage::WelcomeParticipant {
                welcome_message: "y".into(),
            },
            Stamp {
                clock: 7,
                origin: ParticipantId::new(),
            },
        );
        let bytes = encode_envelope(&env).unwrap();
        assert_eq!(decode_envelope(&bytes).unwrap(), Some(env));
    }

    #[test]
    fn wire_shape_is_tagged() {
        let env = Envelope::new(SyncMessage::Update { file: "x".into() });
        let json: serde_json::Value =
            serde_json::from_slice(&encode_envelope(&env).unwrap()).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["message"]["type"], "update");
        assert_eq!(json["message"]["file"], "x");
        assert!(json.get("stamp").is_none());
    }

    #[test]
    fn unknown_version_is_skipped() {
        let bytes = br#"{"v":2,"message":{"type":"update","file":"x"}}"#;
        assert_eq!(decode_envelope(bytes).unwrap(), None);
    }

    #[test]
    fn unknown_message_type_is_skipped() {
        let bytes = br#"{"v":1,"message":{"type":"teleport","to":"moon"}}"#;
        assert_eq!(decode_envelope(bytes).unwrap(), None);
    }

    #[test]
    fn garbage_is_an_error() {
        let err = decode_envelope(b"\x00\x01not json").unwrap_err();
        assert_eq!(err.error_code(), "decode_failed");
    }

    #[test]
    fn oversized_message_is_rejected() {
        let env = Envelope::new(SyncMessage::Update {
            file: "f".repeat(MAX_MESSAGE_SIZE),
        });
        assert!(matches!(encode_envelope(&env), Err(SyncError::Encode(_))));
    }
}
