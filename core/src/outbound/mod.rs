//! Outbound pipeline — from "send text to peer" to wire bytes
//!
//! Stages: resolve sender/recipient identity, select an encryption method,
//! sign, serialize, chunk or envelope at the negotiated MTU, dispatch, and
//! track delivery through application-level ACKs.

pub mod ack;
pub mod encryption;
pub mod identity;
pub mod pipeline;

pub use ack::{AckOutcome, AckTracker, ACK_TIMEOUT};
pub use encryption::{select_method, EncryptedContent};
pub use identity::{resolve_identities, ResolveError, ResolvedIdentities};
pub use pipeline::{DispatchPath, LinkSnapshot, SendError, SendOutcome, SendPipeline};
