/// Identity resolution — who a send is from, to, and keyed under
///
/// The caller supplies at most a contact key; everything else is resolved
/// here. A message that resolves to our own id is never sent — that guards
/// against the misaddressing class of bug where a stale session id loops a
/// message back to its author.

use thiserror::Error;
use tracing::debug;

use crate::identity::LocalIdentity;
use crate::traits::{ContactStore, CryptoProvider};

/// Identity-resolution failures. All of them abort the send before any
/// wire bytes are produced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Recipient resolved to the local node")]
    SelfAddressed,

    #[error("No recipient could be resolved")]
    NoRecipient,
}

/// The resolved parties of one outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentities {
    /// Sender id to put on the wire (ephemeral in spy mode)
    pub sender_id: String,
    /// Where the message is going
    pub recipient_id: String,
    /// Key id encryption is performed under
    pub encryption_key: String,
}

/// Resolve sender, recipient, and encryption key for a send.
///
/// Recipient priority: persistent id (when the tier prefers persistent
/// addressing and one is cached) → current ephemeral session id → stored
/// public key → normalized caller-supplied key → local session id. The
/// last resort deliberately trips the self-address guard.
pub fn resolve_identities(
    contacts: &dyn ContactStore,
    crypto: &dyn CryptoProvider,
    local: &LocalIdentity,
    supplied_key: &str,
) -> Result<ResolvedIdentities, ResolveError> {
    let supplied = supplied_key.trim();
    let contact = if supplied.is_empty() {
        None
    } else {
        contacts.lookup(supplied)
    };

    let tier = crypto.security_tier(if supplied.is_empty() {
        &local.session_id
    } else {
        supplied
    });

    let persistent = contact.as_ref().and_then(|c| c.persistent_id.clone());
    let session = contact.as_ref().and_then(|c| c.session_id.clone());
    let public_key = contact.as_ref().and_then(|c| c.public_key.clone());

    let recipient_id = if tier.prefers_persistent_addressing() && persistent.is_some() {
        persistent
    } else {
        None
    }
    .or(session)
    .or(public_key)
    .or_else(|| {
        if supplied.is_empty() {
            None
        } else {
            Some(supplied.to_string())
        }
    })
    .unwrap_or_else(|| local.session_id.clone());

    if local.is_self(&recipient_id) {
        debug!(recipient = %recipient_id, "send aborted: recipient is self");
        return Err(ResolveError::SelfAddressed);
    }
    if recipient_id.is_empty() {
        return Err(ResolveError::NoRecipient);
    }

    let encryption_key = if supplied.is_empty() {
        recipient_id.clone()
    } else {
        supplied.to_string()
    };

    let secure = crypto.has_secure_session(&recipient_id);
    let sender_id = local.sender_id(secure).to_string();

    Ok(ResolvedIdentities {
        sender_id,
        recipient_id,
        encryption_key,
    })
}
