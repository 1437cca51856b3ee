/// Inbound classification — the front door for raw link bytes
///
/// Every buffer from either role (central notification or peripheral write)
/// passes through `InboundCodec::classify` exactly once. Malformed data is
/// logged and dropped; a mesh link routinely carries noise and partial
/// frames, so nothing on this path is fatal.

use std::time::Instant;

use tracing::{debug, trace};

use super::chunk::{looks_like_chunk, ChunkMessage};
use super::envelope::{FragmentEnvelope, ENVELOPE_MAGIC};
use super::forward::{ForwardCache, ForwardDecision};
use super::reassembly::{CompletedPayload, InsertOutcome, ReassemblyStore};
use crate::protocol::ProtocolMessage;

/// Why a buffer produced no payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    /// Envelope/chunk failed to decode
    Malformed,
    /// Duplicate fragment (index already buffered or id already complete)
    DuplicateFragment,
    /// Relay fragment absorbed (TTL exhausted or dedup window hit)
    RelayAbsorbed,
    /// Matched no known format
    Unclassifiable,
}

/// Classification result for one inbound buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Health-check ping; reassembler untouched, no payload
    Ping,
    /// Direct (unfragmented) protocol message
    Direct(ProtocolMessage),
    /// A fragment completed a message addressed to us
    PayloadReady(CompletedPayload),
    /// Fragment accepted, message still incomplete
    Buffered,
    /// Fragment for another node: retransmit these bytes
    Relay {
        bytes: Vec<u8>,
        fragment_id: String,
        ttl: u8,
        recipient: String,
    },
    /// Nothing to do
    Dropped(DropCause),
}

/// The stateful inbound codec: reassembly buffers + relay dedup window
pub struct InboundCodec {
    /// Every id this node answers to (session id, persistent id)
    local_ids: Vec<String>,
    reassembly: ReassemblyStore,
    forward: ForwardCache,
}

impl InboundCodec {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_ids: vec![local_id.into()],
            reassembly: ReassemblyStore::new(),
            forward: ForwardCache::new(),
        }
    }

    /// Replace the ids fragments must match to be reassembled for us
    pub fn set_local_ids(&mut self, ids: Vec<String>) {
        self.local_ids = ids;
    }

    fn is_local(&self, id: &str) -> bool {
        self.local_ids.iter().any(|local| local == id)
    }

    /// Classify one raw buffer. See module docs for the ordering.
    pub fn classify(&mut self, bytes: &[u8], now: Instant) -> Inbound {
        if bytes.is_empty() {
            return Inbound::Dropped(DropCause::Unclassifiable);
        }

        // 1. Health-check ping: every byte zero
        if bytes.iter().all(|&b| b == super::PING_BYTE) {
            trace!(len = bytes.len(), "ping received");
            return Inbound::Ping;
        }

        // 2. Binary envelope
        if bytes[0] == ENVELOPE_MAGIC {
            return self.classify_envelope(bytes, now);
        }

        // 3. Direct protocol message
        if ProtocolMessage::sniff(bytes) {
            match ProtocolMessage::from_bytes(bytes) {
                Ok(msg) => return Inbound::Direct(msg),
                Err(e) => {
                    debug!(error = %e, "protocol-shaped buffer failed to parse");
                    // fall through: it may still be a chunk line
                }
            }
        }

        // 4. Legacy text chunk
        if looks_like_chunk(bytes) {
            let line = match std::str::from_utf8(bytes) {
                Ok(line) => line,
                Err(_) => return Inbound::Dropped(DropCause::Malformed),
            };
            return match ChunkMessage::parse(line) {
                Ok(chunk) => {
                    let key = chunk.message_id.clone();
                    let outcome = self.reassembly.insert_chunk(&chunk, now);
                    self.map_insert(key, outcome)
                }
                Err(e) => {
                    debug!(error = %e, "chunk heuristic matched but parse failed");
                    Inbound::Dropped(DropCause::Malformed)
                }
            };
        }

        // 5. Unclassifiable
        debug!(len = bytes.len(), first = bytes[0], "unclassifiable buffer dropped");
        Inbound::Dropped(DropCause::Unclassifiable)
    }

    fn classify_envelope(&mut self, bytes: &[u8], now: Instant) -> Inbound {
        let env = match FragmentEnvelope::from_bytes(bytes) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "malformed envelope dropped");
                return Inbound::Dropped(DropCause::Malformed);
            }
        };

        let foreign = env
            .recipient
            .as_deref()
            .is_some_and(|r| !r.is_empty() && !self.is_local(r));

        if foreign {
            // Forward-only: never delivered locally. Opportunistically
            // buffer anyway, so a completed foreign payload can be
            // re-fragmented at a smaller downstream MTU.
            let _ = self.reassembly.insert_envelope(&env, now);

            let recipient = env.recipient.clone().unwrap_or_default();
            return match self.forward.decide(&env, now) {
                ForwardDecision::Relay {
                    bytes,
                    fragment_id,
                    ttl,
                    ..
                } => Inbound::Relay {
                    bytes,
                    fragment_id,
                    ttl,
                    recipient,
                },
                ForwardDecision::Absorb(reason) => {
                    trace!(?reason, id = %env.id_hex(), "relay fragment absorbed");
                    Inbound::Dropped(DropCause::RelayAbsorbed)
                }
            };
        }

        let key = env.id_hex();
        let outcome = self.reassembly.insert_envelope(&env, now);
        self.map_insert(key, outcome)
    }

    fn map_insert(&mut self, key: String, outcome: InsertOutcome) -> Inbound {
        match outcome {
            InsertOutcome::Completed => match self.reassembly.take_completed(&key) {
                Some(payload) => Inbound::PayloadReady(payload),
                None => Inbound::Dropped(DropCause::DuplicateFragment),
            },
            InsertOutcome::Buffered => Inbound::Buffered,
            InsertOutcome::DuplicateIndex
            | InsertOutcome::AlreadyCompleted
            | InsertOutcome::TotalMismatch => Inbound::Dropped(DropCause::DuplicateFragment),
        }
    }

    /// Claim a completed payload by id (used for re-fragmenting foreign
    /// payloads at a different MTU)
    pub fn take_completed(&mut self, id: &str) -> Option<CompletedPayload> {
        self.reassembly.take_completed(id)
    }

    /// Periodic eviction of stale buffers, completions, and dedup entries
    pub fn sweep(&mut self, now: Instant) -> usize {
        self.reassembly.sweep(now) + self.forward.sweep(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload_type;

    fn make_codec() -> InboundCodec {
        InboundCodec::new("local-node")
    }

    fn envelope_bytes(recipient: Option<&str>, ttl: u8, index: u16, total: u16) -> Vec<u8> {
        FragmentEnvelope::new(
            [5u8; 8],
            index,
            total,
            ttl,
            payload_type::TEXT,
            recipient.map(str::to_string),
            format!("part-{index} ").into_bytes(),
        )
        .unwrap()
        .to_bytes()
        .unwrap()
    }

    #[test]
    fn test_single_zero_byte_is_ping() {
        let mut codec = make_codec();
        assert_eq!(codec.classify(&[0x00], Instant::now()), Inbound::Ping);
    }

    #[test]
    fn test_three_byte_ping() {
        // Scenario: peer sends a 3-byte ping — classified as ping, the
        // reassembler untouched, no payload produced.
        let mut codec = make_codec();
        assert_eq!(
            codec.classify(&[0x00, 0x00, 0x00], Instant::now()),
            Inbound::Ping
        );
        assert_eq!(codec.reassembly.pending_count(), 0);
    }

    #[test]
    fn test_empty_buffer_dropped() {
        let mut codec = make_codec();
        assert_eq!(
            codec.classify(&[], Instant::now()),
            Inbound::Dropped(DropCause::Unclassifiable)
        );
    }

    #[test]
    fn test_envelope_for_us_reassembles() {
        let mut codec = make_codec();
        let now = Instant::now();

        assert_eq!(
            codec.classify(&envelope_bytes(Some("local-node"), 5, 0, 2), now),
            Inbound::Buffered
        );
        match codec.classify(&envelope_bytes(Some("local-node"), 5, 1, 2), now) {
            Inbound::PayloadReady(payload) => {
                assert_eq!(payload.bytes, b"part-0 part-1 ");
                assert_eq!(payload.recipient.as_deref(), Some("local-node"));
            }
            other => panic!("expected PayloadReady, got {:?}", other),
        }
    }

    #[test]
    fn test_envelope_without_recipient_reassembles_locally() {
        let mut codec = make_codec();
        match codec.classify(&envelope_bytes(None, 5, 0, 1), Instant::now()) {
            Inbound::PayloadReady(_) => {}
            other => panic!("expected PayloadReady, got {:?}", other),
        }
    }

    #[test]
    fn test_foreign_envelope_is_relayed_not_delivered() {
        let mut codec = make_codec();
        match codec.classify(&envelope_bytes(Some("other-node"), 5, 0, 2), Instant::now()) {
            Inbound::Relay { bytes, ttl, .. } => {
                assert_eq!(ttl, 4);
                let env = FragmentEnvelope::from_bytes(&bytes).unwrap();
                assert_eq!(env.recipient.as_deref(), Some("other-node"));
            }
            other => panic!("expected Relay, got {:?}", other),
        }
    }

    #[test]
    fn test_foreign_envelope_ttl_exhausted_absorbed() {
        let mut codec = make_codec();
        assert_eq!(
            codec.classify(&envelope_bytes(Some("other-node"), 1, 0, 2), Instant::now()),
            Inbound::Dropped(DropCause::RelayAbsorbed)
        );
    }

    #[test]
    fn test_foreign_envelope_duplicate_absorbed() {
        let mut codec = make_codec();
        let now = Instant::now();
        let bytes = envelope_bytes(Some("other-node"), 5, 0, 2);

        assert!(matches!(
            codec.classify(&bytes, now),
            Inbound::Relay { .. }
        ));
        assert_eq!(
            codec.classify(&bytes, now),
            Inbound::Dropped(DropCause::RelayAbsorbed)
        );
    }

    #[test]
    fn test_foreign_envelope_buffered_for_refragmentation() {
        let mut codec = make_codec();
        let now = Instant::now();

        codec.classify(&envelope_bytes(Some("other-node"), 5, 0, 2), now);
        codec.classify(&envelope_bytes(Some("other-node"), 5, 1, 2), now);

        let id = hex::encode([5u8; 8]);
        let payload = codec.take_completed(&id).expect("foreign payload buffered");
        assert_eq!(payload.bytes, b"part-0 part-1 ");
    }

    #[test]
    fn test_malformed_envelope_dropped_silently() {
        let mut codec = make_codec();
        assert_eq!(
            codec.classify(&[ENVELOPE_MAGIC, 1, 2, 3], Instant::now()),
            Inbound::Dropped(DropCause::Malformed)
        );
    }

    #[test]
    fn test_direct_protocol_message() {
        let mut codec = make_codec();
        let msg = ProtocolMessage::message("m1".into(), "a".into(), "local-node".into(), 7);
        let bytes = msg.to_bytes().unwrap();

        match codec.classify(&bytes, Instant::now()) {
            Inbound::Direct(parsed) => assert_eq!(parsed.id, "m1"),
            other => panic!("expected Direct, got {:?}", other),
        }
    }

    #[test]
    fn test_chunk_path_reassembles() {
        let mut codec = make_codec();
        let now = Instant::now();

        let chunks = ChunkMessage::chunk_text("m2", &"y".repeat(120), false, 64).unwrap();
        assert!(chunks.len() > 1);

        let mut ready = None;
        for chunk in &chunks {
            if let Inbound::PayloadReady(p) = codec.classify(chunk.encode().as_bytes(), now) {
                ready = Some(p);
            }
        }
        let payload = ready.expect("chunks should complete");
        assert_eq!(payload.bytes, "y".repeat(120).into_bytes());
    }

    #[test]
    fn test_garbage_dropped() {
        let mut codec = make_codec();
        assert_eq!(
            codec.classify(&[0x01, 0x02, 0x03, 0x04], Instant::now()),
            Inbound::Dropped(DropCause::Unclassifiable)
        );
        assert_eq!(
            codec.classify(b"plain text, not a chunk", Instant::now()),
            Inbound::Dropped(DropCause::Unclassifiable)
        );
    }

    #[test]
    fn test_sweep_clears_state() {
        let mut codec = make_codec();
        let start = Instant::now();

        codec.classify(&envelope_bytes(Some("local-node"), 5, 0, 2), start);
        codec.classify(&envelope_bytes(Some("other-node"), 5, 1, 2), start);

        let later = start + crate::codec::FRAGMENT_TIMEOUT + std::time::Duration::from_secs(1);
        assert!(codec.sweep(later) > 0);
    }
}
