// Protocol messages — the JSON layer above the fragment codecs
//
// A protocol message that fits in a single MTU goes on the wire as-is (the
// "direct" path); anything larger is chunked or enveloped by the codec layer
// and reassembled back into one of these on the far side.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum serialized protocol message size: 64 KB
/// Prevents memory exhaustion from a malicious oversized direct write.
pub const MAX_PROTOCOL_MESSAGE_SIZE: usize = 64 * 1024;

/// Protocol message errors
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("Message too large: {0} bytes (max {MAX_PROTOCOL_MESSAGE_SIZE})")]
    TooLarge(usize),

    #[error("Not valid UTF-8")]
    NotUtf8,

    #[error("Malformed protocol message: {0}")]
    Malformed(String),
}

/// What a protocol message is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Chat text addressed to a peer
    Message,
    /// Application-level delivery acknowledgement
    Ack,
    /// Bilateral contact-status announcement
    ContactStatus,
    /// Handshake traffic (routing is out of scope; the kind matters for
    /// responder arbitration, which must not react to handshake writes)
    Handshake,
    /// Offline-queue synchronization
    QueueSync,
}

/// How the content field was encrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EncryptionMethod {
    /// Shared global key (lowest tier)
    SharedKey,
    /// Pairing-derived key
    Pairing,
    /// ECDH-derived session key
    Ecdh,
}

/// A single protocol message.
///
/// Serialized as JSON. The `type` discriminator doubles as the sniffing
/// signature for the direct (unfragmented) receive path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    /// Message kind discriminator
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Unique message id (UUID v4)
    pub id: String,
    /// Sender id (ephemeral or persistent, per spy-mode rules)
    pub sender: String,
    /// Intended recipient id, when addressed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Content — ciphertext when `encrypted`, plaintext otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Whether `content` is encrypted (receivers must not attempt decryption
    /// when false)
    #[serde(default)]
    pub encrypted: bool,
    /// Encryption method used, when encrypted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<EncryptionMethod>,
    /// Signature over the content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Unix timestamp (milliseconds)
    pub timestamp: u64,
}

impl ProtocolMessage {
    /// Build a chat message shell (content/encryption filled by the pipeline)
    pub fn message(id: String, sender: String, recipient: String, timestamp: u64) -> Self {
        Self {
            kind: MessageKind::Message,
            id,
            sender,
            recipient: Some(recipient),
            content: None,
            encrypted: false,
            method: None,
            signature: None,
            timestamp,
        }
    }

    /// Build a delivery ACK for a received message id
    pub fn ack(acked_id: &str, sender: String, recipient: String, timestamp: u64) -> Self {
        Self {
            kind: MessageKind::Ack,
            id: acked_id.to_string(),
            sender,
            recipient: Some(recipient),
            content: None,
            encrypted: false,
            method: None,
            signature: None,
            timestamp,
        }
    }

    /// Build a contact-status announcement. `content` carries the boolean.
    pub fn contact_status(id: String, sender: String, recipient: String, we_have_them: bool, timestamp: u64) -> Self {
        Self {
            kind: MessageKind::ContactStatus,
            id,
            sender,
            recipient: Some(recipient),
            content: Some(if we_have_them { "1" } else { "0" }.to_string()),
            encrypted: false,
            method: None,
            signature: None,
            timestamp,
        }
    }

    /// The contact-status boolean, for `ContactStatus` messages
    pub fn status_flag(&self) -> Option<bool> {
        if self.kind != MessageKind::ContactStatus {
            return None;
        }
        match self.content.as_deref() {
            Some("1") => Some(true),
            Some("0") => Some(false),
            _ => None,
        }
    }

    /// Serialize to wire bytes (JSON)
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if bytes.len() > MAX_PROTOCOL_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Deserialize from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_PROTOCOL_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(bytes.len()));
        }
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Cheap signature check for the direct-message sniff: UTF-8 JSON object
    /// carrying a `type` field. Callers still need `from_bytes` to accept it.
    pub fn sniff(bytes: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(bytes) else {
            return false;
        };
        let trimmed = text.trim_start();
        trimmed.starts_with('{') && trimmed.contains("\"type\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_message() -> ProtocolMessage {
        let mut msg = ProtocolMessage::message(
            "msg-1".into(),
            "sender-a".into(),
            "recipient-b".into(),
            1_700_000_000_000,
        );
        msg.content = Some("hello".into());
        msg
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = make_test_message();
        let bytes = msg.to_bytes().unwrap();
        let restored = ProtocolMessage::from_bytes(&bytes).unwrap();

        assert_eq!(restored.kind, MessageKind::Message);
        assert_eq!(restored.id, "msg-1");
        assert_eq!(restored.sender, "sender-a");
        assert_eq!(restored.recipient.as_deref(), Some("recipient-b"));
        assert_eq!(restored.content.as_deref(), Some("hello"));
        assert!(!restored.encrypted);
    }

    #[test]
    fn test_sniff_accepts_protocol_json() {
        let bytes = make_test_message().to_bytes().unwrap();
        assert!(ProtocolMessage::sniff(&bytes));
    }

    #[test]
    fn test_sniff_rejects_plain_text() {
        assert!(!ProtocolMessage::sniff(b"hello world"));
        assert!(!ProtocolMessage::sniff(b"{\"foo\": 1}"));
        assert!(!ProtocolMessage::sniff(&[0xD9, 0x01, 0x02]));
    }

    #[test]
    fn test_ack_carries_acked_id() {
        let ack = ProtocolMessage::ack("msg-42", "a".into(), "b".into(), 1);
        assert_eq!(ack.kind, MessageKind::Ack);
        assert_eq!(ack.id, "msg-42");
    }

    #[test]
    fn test_contact_status_flag() {
        let yes = ProtocolMessage::contact_status("s1".into(), "a".into(), "b".into(), true, 1);
        let no = ProtocolMessage::contact_status("s2".into(), "a".into(), "b".into(), false, 1);

        assert_eq!(yes.status_flag(), Some(true));
        assert_eq!(no.status_flag(), Some(false));
        assert_eq!(make_test_message().status_flag(), None);
    }

    #[test]
    fn test_reject_oversized_decode() {
        let big = vec![b'{'; MAX_PROTOCOL_MESSAGE_SIZE + 1];
        assert!(matches!(
            ProtocolMessage::from_bytes(&big),
            Err(ProtocolError::TooLarge(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_error_not_panic() {
        let result = ProtocolMessage::from_bytes(b"{\"type\": \"message\"");
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_kind_serializes_camel_case() {
        let status = ProtocolMessage::contact_status("s".into(), "a".into(), "b".into(), true, 1);
        let json = String::from_utf8(status.to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"type\":\"contactStatus\""));
    }
}
