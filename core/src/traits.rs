// Capability seams — what the surrounding system must provide
//
// The engine never talks to a radio, a database, or a cipher directly.
// Everything external comes in through these narrow traits, passed to the
// engine constructor, so tests can run fully isolated instances.

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::SecurityTier;
use crate::protocol::EncryptionMethod;

/// Transport-level failures. All of these are transient from the engine's
/// point of view; the health monitor owns retries.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Notify failed: {0}")]
    NotifyFailed(String),

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Operation timed out")]
    Timeout,
}

/// Cryptographic failures. Never fatal: encryption failures degrade to
/// plaintext sends, decryption failures surface as undecryptable content.
#[derive(Debug, Error, Clone)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptFailed(String),

    #[error("No key material for peer {0}")]
    NoKey(String),
}

/// Raw connect/write/notify primitives over the GATT link.
#[async_trait]
pub trait TransportWriter: Send + Sync {
    /// Central-role connection attempt to a remembered peripheral. Used by
    /// the reconnection policy; the platform owns scanning and pairing.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Central-role write to a peripheral's characteristic
    async fn write(
        &self,
        address: &str,
        characteristic: &str,
        bytes: &[u8],
    ) -> Result<(), TransportError>;

    /// Peripheral-role notification to a subscribed central
    async fn notify(
        &self,
        address: &str,
        characteristic: &str,
        bytes: &[u8],
    ) -> Result<(), TransportError>;
}

/// Opaque encrypt/decrypt/sign/verify, keyed by peer and tier.
#[cfg_attr(test, mockall::automock)]
pub trait CryptoProvider: Send + Sync {
    /// Current trust tier for a peer
    fn security_tier(&self, peer_id: &str) -> SecurityTier;

    /// Whether an established secure-channel session exists with the peer
    fn has_secure_session(&self, peer_id: &str) -> bool;

    fn encrypt(
        &self,
        plaintext: &str,
        peer_id: &str,
        method: EncryptionMethod,
    ) -> Result<String, CryptoError>;

    fn decrypt(
        &self,
        ciphertext: &str,
        peer_id: &str,
        method: EncryptionMethod,
    ) -> Result<String, CryptoError>;

    /// Sign with a key appropriate to the tier (ephemeral key below High)
    fn sign(&self, text: &str, tier: SecurityTier) -> String;

    fn verify(&self, text: &str, signature: &str, key: &str, ephemeral: bool) -> bool;

    /// ECDH step for the mutual-contact upgrade; None when impossible
    fn compute_shared_secret(&self, peer_id: &str) -> Option<Vec<u8>>;
}

/// A stored contact, as looked up by any of its known ids.
#[derive(Debug, Clone, Default)]
pub struct ContactRecord {
    /// Stored public key
    pub public_key: Option<String>,
    /// Stable long-term id, once pairing has established one
    pub persistent_id: Option<String>,
    /// Current ephemeral session id, when the peer is live
    pub session_id: Option<String>,
    /// Display name, when known
    pub display_name: Option<String>,
    /// Local ground truth: do we hold this peer as a contact
    pub is_contact: bool,
}

/// Contact/secret persistence, consumed as an interface.
pub trait ContactStore: Send + Sync {
    /// Look a contact up by public key, persistent id, or ephemeral id
    fn lookup(&self, any_id: &str) -> Option<ContactRecord>;

    /// Persist an upgraded security tier for a peer
    fn upgrade_tier(&self, peer_id: &str, tier: SecurityTier);

    fn cache_shared_secret(&self, peer_id: &str, secret: &[u8]);

    fn cached_shared_secret(&self, peer_id: &str) -> Option<Vec<u8>>;
}

/// The mesh route scorer, consumed as an opaque next-hop chooser.
pub trait RelayTopology: Send + Sync {
    /// Best next hop for a recipient not directly linked, if any
    fn next_hop(&self, recipient_id: &str) -> Option<String>;

    /// Whether the link to `address` is currently the only viable relay
    /// path. The health monitor will not tear such a link down.
    fn is_sole_relay_path(&self, address: &str) -> bool;
}

/// Which side of the handshake we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// The (out-of-scope) handshake protocol, invoked by the connection machine
/// once arbitration decides a side.
#[async_trait]
pub trait HandshakeDriver: Send + Sync {
    async fn begin(&self, address: &str, role: HandshakeRole) -> Result<(), TransportError>;
}
