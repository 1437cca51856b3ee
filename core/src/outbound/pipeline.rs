/// Send pipeline — resolve, encrypt, sign, fragment, dispatch, track
///
/// The single-chunk fast path avoids binary-envelope overhead for the
/// common case (short text); anything that chunks to more than one piece,
/// or fails to chunk at all, goes through the envelope path, which handles
/// arbitrary size and recipient-scoped relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ack::{AckOutcome, AckTracker, ACK_TIMEOUT};
use super::encryption::{encrypt_content, select_method};
use super::identity::{resolve_identities, ResolveError};
use crate::codec::chunk::ChunkMessage;
use crate::codec::envelope::FragmentEnvelope;
use crate::codec::{payload_type, CodecError, DEFAULT_TTL};
use crate::connection::link::LinkRole;
use crate::identity::LocalIdentity;
use crate::protocol::{ProtocolError, ProtocolMessage};
use crate::traits::{ContactStore, CryptoProvider, TransportError, TransportWriter};

/// Send-pipeline failures. Every variant aborts before or during dispatch;
/// delivery failures after dispatch surface as `SendOutcome::delivered ==
/// false`, not as errors.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("No usable link")]
    NoLink,
}

/// What the pipeline needs to know about the link it writes to
#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    pub address: String,
    pub characteristic: String,
    pub mtu: usize,
    pub role: LinkRole,
}

/// Which wire path a send took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPath {
    /// Legacy chunk string, single write
    SingleChunk,
    /// Binary envelopes, one write per fragment
    Envelope,
}

/// Result of a completed send
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
    pub delivered: bool,
    pub path: DispatchPath,
}

/// The outbound pipeline. One per engine.
pub struct SendPipeline {
    contacts: Arc<dyn ContactStore>,
    crypto: Arc<dyn CryptoProvider>,
    transport: Arc<dyn TransportWriter>,
    acks: Arc<AckTracker>,
    /// Raised for the duration of a send; the health monitor reads this to
    /// suppress concurrent pings
    busy: Arc<AtomicBool>,
    ttl: u8,
    ack_timeout: Duration,
}

/// Clears the busy flag even on early return
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl SendPipeline {
    pub fn new(
        contacts: Arc<dyn ContactStore>,
        crypto: Arc<dyn CryptoProvider>,
        transport: Arc<dyn TransportWriter>,
        acks: Arc<AckTracker>,
        busy: Arc<AtomicBool>,
    ) -> Self {
        Self {
            contacts,
            crypto,
            transport,
            acks,
            busy,
            ttl: DEFAULT_TTL,
            ack_timeout: ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Whether a send is currently in flight
    pub fn in_flight(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Send a text message and wait for its delivery outcome.
    pub async fn send_text(
        &self,
        link: &LinkSnapshot,
        local: &LocalIdentity,
        contact_key: &str,
        text: &str,
    ) -> Result<SendOutcome, SendError> {
        self.busy.store(true, Ordering::SeqCst);
        let _guard = BusyGuard(self.busy.clone());

        // Identity first: a self-addressed or unresolvable send must fail
        // before any wire bytes exist
        let ids = resolve_identities(
            self.contacts.as_ref(),
            self.crypto.as_ref(),
            local,
            contact_key,
        )?;

        let method = select_method(self.crypto.as_ref(), &ids.recipient_id);
        let sealed = encrypt_content(self.crypto.as_ref(), &ids.encryption_key, text, method);

        let tier = self.crypto.security_tier(&ids.recipient_id);
        let signature = self.crypto.sign(&sealed.content, tier);

        let message_id = Uuid::new_v4().to_string();
        let mut msg = ProtocolMessage::message(
            message_id.clone(),
            ids.sender_id.clone(),
            ids.recipient_id.clone(),
            now_millis(),
        );
        msg.content = Some(sealed.content);
        msg.encrypted = sealed.encrypted;
        msg.method = sealed.method;
        msg.signature = Some(signature);

        let bytes = msg.to_bytes()?;

        // Register before dispatch so an instant ACK cannot be lost
        let rx = self.acks.register(&message_id);

        let path = self
            .dispatch(link, &message_id, &bytes, Some(&ids.recipient_id))
            .await;
        let path = match path {
            Ok(path) => path,
            Err(e) => {
                self.acks.resolve(&message_id, AckOutcome::Cancelled);
                return Err(e);
            }
        };

        let outcome = self.acks.wait(&message_id, rx, self.ack_timeout).await;
        let delivered = outcome.delivered();
        if delivered {
            info!(message_id = %message_id, "message delivered");
        } else {
            debug!(message_id = %message_id, ?outcome, "message not acknowledged");
        }

        Ok(SendOutcome {
            message_id,
            delivered,
            path,
        })
    }

    /// Fire-and-forget protocol traffic (ACKs, contact status). No ACK
    /// tracking, no busy flag.
    pub async fn send_protocol(
        &self,
        link: &LinkSnapshot,
        msg: &ProtocolMessage,
    ) -> Result<(), SendError> {
        let bytes = msg.to_bytes()?;
        self.dispatch(link, &msg.id, &bytes, msg.recipient.as_deref())
            .await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        link: &LinkSnapshot,
        message_id: &str,
        bytes: &[u8],
        recipient: Option<&str>,
    ) -> Result<DispatchPath, SendError> {
        // Chunking works on the serialized text; a UTF-8 failure here just
        // means the payload is binary and must take the envelope path.
        let as_text = std::str::from_utf8(bytes).ok();
        let chunked = as_text
            .map(|text| ChunkMessage::chunk_text(message_id, text, false, link.mtu))
            .and_then(Result::ok);

        match chunked {
            Some(chunks) if chunks.len() == 1 => {
                let line = chunks[0].encode();
                self.write(link, line.as_bytes()).await?;
                debug!(message_id, "dispatched via single-chunk fast path");
                Ok(DispatchPath::SingleChunk)
            }
            _ => {
                let fragment_id: [u8; 8] = rand::random();
                let fragments = FragmentEnvelope::fragment_payload(
                    fragment_id,
                    bytes,
                    link.mtu,
                    self.ttl,
                    payload_type::TEXT,
                    recipient,
                )?;
                let count = fragments.len();
                for fragment in &fragments {
                    let frame = fragment.to_bytes()?;
                    self.write(link, &frame).await?;
                }
                debug!(message_id, count, "dispatched via envelope path");
                Ok(DispatchPath::Envelope)
            }
        }
    }

    async fn write(&self, link: &LinkSnapshot, bytes: &[u8]) -> Result<(), TransportError> {
        match link.role {
            LinkRole::Client => {
                self.transport
                    .write(&link.address, &link.characteristic, bytes)
                    .await
            }
            LinkRole::Server => {
                self.transport
                    .notify(&link.address, &link.characteristic, bytes)
                    .await
            }
        }
    }

    /// Resolve an observed network ACK for a message id
    pub fn on_ack_received(&self, message_id: &str) {
        if self.acks.resolve(message_id, AckOutcome::Acked) {
            debug!(message_id, "network ack observed");
        } else {
            warn!(message_id, "ack for unknown or already-resolved message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SecurityTier;
    use crate::protocol::EncryptionMethod;
    use crate::traits::{ContactRecord, CryptoError};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingTransport {
        writes: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TransportWriter for RecordingTransport {
        async fn connect(&self, _address: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn write(
            &self,
            _address: &str,
            _characteristic: &str,
            bytes: &[u8],
        ) -> Result<(), TransportError> {
            self.writes.lock().push(bytes.to_vec());
            Ok(())
        }
        async fn notify(
            &self,
            _address: &str,
            _characteristic: &str,
            bytes: &[u8],
        ) -> Result<(), TransportError> {
            self.writes.lock().push(bytes.to_vec());
            Ok(())
        }
    }

    struct StubContacts;

    impl ContactStore for StubContacts {
        fn lookup(&self, any_id: &str) -> Option<ContactRecord> {
            (any_id == "key-b").then(|| ContactRecord {
                session_id: Some("peer-sess".to_string()),
                ..Default::default()
            })
        }
        fn upgrade_tier(&self, _peer_id: &str, _tier: SecurityTier) {}
        fn cache_shared_secret(&self, _peer_id: &str, _secret: &[u8]) {}
        fn cached_shared_secret(&self, _peer_id: &str) -> Option<Vec<u8>> {
            None
        }
    }

    struct StubCrypto;

    impl CryptoProvider for StubCrypto {
        fn security_tier(&self, _peer_id: &str) -> SecurityTier {
            SecurityTier::Low
        }
        fn has_secure_session(&self, _peer_id: &str) -> bool {
            false
        }
        fn encrypt(
            &self,
            plaintext: &str,
            _peer_id: &str,
            _method: EncryptionMethod,
        ) -> Result<String, CryptoError> {
            Ok(plaintext.to_string())
        }
        fn decrypt(
            &self,
            ciphertext: &str,
            _peer_id: &str,
            _method: EncryptionMethod,
        ) -> Result<String, CryptoError> {
            Ok(ciphertext.to_string())
        }
        fn sign(&self, _text: &str, _tier: SecurityTier) -> String {
            "sig".to_string()
        }
        fn verify(&self, _t: &str, _s: &str, _k: &str, _e: bool) -> bool {
            true
        }
        fn compute_shared_secret(&self, _peer_id: &str) -> Option<Vec<u8>> {
            None
        }
    }

    fn make_pipeline() -> (SendPipeline, Arc<RecordingTransport>, Arc<AckTracker>) {
        let transport = Arc::new(RecordingTransport::new());
        let acks = Arc::new(AckTracker::new());
        let pipeline = SendPipeline::new(
            Arc::new(StubContacts),
            Arc::new(StubCrypto),
            transport.clone(),
            acks.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .with_ack_timeout(Duration::from_millis(50));
        (pipeline, transport, acks)
    }

    fn make_link(mtu: usize) -> LinkSnapshot {
        LinkSnapshot {
            address: "AA:BB".to_string(),
            characteristic: "char-1".to_string(),
            mtu,
            role: LinkRole::Client,
        }
    }

    fn make_local() -> LocalIdentity {
        LocalIdentity::new("local-sess").with_persistent_id("local-pk")
    }

    #[tokio::test]
    async fn test_self_addressed_send_writes_nothing() {
        let (pipeline, transport, _) = make_pipeline();

        let result = pipeline
            .send_text(&make_link(512), &make_local(), "", "hello")
            .await;

        assert!(matches!(
            result,
            Err(SendError::Resolve(ResolveError::SelfAddressed))
        ));
        assert!(transport.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_large_message_takes_envelope_path() {
        let (pipeline, transport, _acks) = make_pipeline();
        let text = "x".repeat(600);

        // No peer answers, so the ack timeout fires and delivery is false
        let outcome = pipeline
            .send_text(&make_link(128), &make_local(), "key-b", &text)
            .await
            .unwrap();

        assert_eq!(outcome.path, DispatchPath::Envelope);
        assert!(!outcome.delivered);

        let writes = transport.writes.lock();
        assert!(writes.len() > 1);
        for frame in writes.iter() {
            assert!(frame.len() <= 128);
            assert_eq!(frame[0], crate::codec::ENVELOPE_MAGIC);
        }
    }

    #[tokio::test]
    async fn test_short_message_takes_single_chunk_path() {
        let (pipeline, transport, acks) = make_pipeline();

        let link = make_link(512);
        let local = make_local();
        let send = pipeline.send_text(&link, &local, "key-b", "hi");
        tokio::pin!(send);

        // Race the timeout with an ACK once the write is visible
        let outcome = loop {
            tokio::select! {
                out = &mut send => break out,
                _ = tokio::time::sleep(Duration::from_millis(1)) => {
                    let writes = transport.writes.lock();
                    if let Some(first) = writes.first() {
                        let line = std::str::from_utf8(first).unwrap();
                        let chunk = ChunkMessage::parse(line).unwrap();
                        acks.resolve(&chunk.message_id, AckOutcome::Acked);
                    }
                }
            }
        }
        .unwrap();

        assert_eq!(outcome.path, DispatchPath::SingleChunk);
        assert!(outcome.delivered);
        assert_eq!(transport.writes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_busy_flag_cleared_after_send() {
        let (pipeline, _, _) = make_pipeline();

        let _ = pipeline
            .send_text(&make_link(512), &make_local(), "key-b", "hi")
            .await;
        assert!(!pipeline.in_flight());
    }

    #[tokio::test]
    async fn test_ack_received_resolves_once() {
        let (pipeline, _, acks) = make_pipeline();
        let _rx = acks.register("m1");

        pipeline.on_ack_received("m1");
        // Second ack for the same id is a logged no-op
        pipeline.on_ack_received("m1");
        assert_eq!(acks.pending_count(), 0);
    }
}
