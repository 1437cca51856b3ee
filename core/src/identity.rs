// Node identity — who we are on the mesh
//
// Every node carries a short-lived session id (rotates per app launch) and,
// once pairing has happened at least once, a stable persistent id. Which one
// goes on the wire as the sender depends on whether the node is operating
// anonymously over an already-secure channel.

use serde::{Deserialize, Serialize};

/// Trust tier for a peer, as resolved by the surrounding crypto layer.
///
/// Drives both encryption-method selection and recipient addressing:
/// `High` peers are addressed by persistent id and get ECDH-derived keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityTier {
    /// No pairing yet — shared global key only
    Low,
    /// PIN pairing completed — pairing-derived key
    Medium,
    /// Mutual contact + ECDH secret established
    High,
}

impl SecurityTier {
    /// Whether this tier prefers the stable persistent id for addressing
    pub fn prefers_persistent_addressing(&self) -> bool {
        matches!(self, SecurityTier::High)
    }
}

/// The local node's identity material
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Ephemeral per-session id (always present)
    pub session_id: String,
    /// Stable long-term id, if one has been established
    pub persistent_id: Option<String>,
    /// Whether identity hints are being broadcast. Disabled + secure session
    /// means the node is deliberately hiding its persistent identity.
    pub hint_broadcasting: bool,
}

impl LocalIdentity {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            persistent_id: None,
            hint_broadcasting: true,
        }
    }

    pub fn with_persistent_id(mut self, persistent_id: impl Into<String>) -> Self {
        self.persistent_id = Some(persistent_id.into());
        self
    }

    /// True when `id` names this node under any of its identities
    pub fn is_self(&self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        if id == self.session_id {
            return true;
        }
        self.persistent_id.as_deref() == Some(id)
    }

    /// Anonymous ("spy") mode: hints are off while a secure session exists,
    /// so sends must not reveal the persistent id.
    pub fn spy_mode(&self, secure_session_established: bool) -> bool {
        !self.hint_broadcasting && secure_session_established
    }

    /// The sender id to put on an outbound message
    pub fn sender_id(&self, secure_session_established: bool) -> &str {
        if self.spy_mode(secure_session_established) {
            return &self.session_id;
        }
        self.persistent_id.as_deref().unwrap_or(&self.session_id)
    }
}
