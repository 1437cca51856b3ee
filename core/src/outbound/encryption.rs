/// Encryption method selection and application
///
/// The method follows the peer's trust tier, with an established secure
/// session overriding to the strongest method. Encryption failure never
/// aborts a send: the message degrades to plaintext with `encrypted: false`
/// so receivers do not attempt decryption.

use tracing::warn;

use crate::identity::SecurityTier;
use crate::protocol::EncryptionMethod;
use crate::traits::CryptoProvider;

/// Content after the encryption stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedContent {
    pub content: String,
    pub encrypted: bool,
    pub method: Option<EncryptionMethod>,
}

/// Pick the encryption method for a peer
pub fn select_method(crypto: &dyn CryptoProvider, peer_id: &str) -> EncryptionMethod {
    if crypto.has_secure_session(peer_id) {
        return EncryptionMethod::Ecdh;
    }
    match crypto.security_tier(peer_id) {
        SecurityTier::High => EncryptionMethod::Ecdh,
        SecurityTier::Medium => EncryptionMethod::Pairing,
        SecurityTier::Low => EncryptionMethod::SharedKey,
    }
}

/// Encrypt content, degrading to plaintext on failure
pub fn encrypt_content(
    crypto: &dyn CryptoProvider,
    key_id: &str,
    plaintext: &str,
    method: EncryptionMethod,
) -> EncryptedContent {
    match crypto.encrypt(plaintext, key_id, method) {
        Ok(ciphertext) => EncryptedContent {
            content: ciphertext,
            encrypted: true,
            method: Some(method),
        },
        Err(e) => {
            warn!(key = key_id, error = %e, "encryption failed, sending unencrypted");
            EncryptedContent {
                content: plaintext.to_string(),
                encrypted: false,
                method: None,
            }
        }
    }
}
