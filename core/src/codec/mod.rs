//! Wire codecs — fragment lifecycle for both directions of the link
//!
//! This module provides:
//! - FragmentEnvelope: binary fragment format with TTL-bounded relay
//! - ChunkMessage: legacy pipe-delimited text chunk format
//! - ReassemblyStore: keyed reassembly buffers with one-shot completion
//! - ForwardCache: per-(fragment, index) dedup window for mesh relay
//! - InboundCodec: the classification front door for raw inbound buffers
//!
//! Classification order for an inbound buffer:
//! 1. all-zero bytes: health-check ping
//! 2. envelope magic: binary fragment (reassemble locally or relay)
//! 3. UTF-8 JSON with a `type` field: direct protocol message
//! 4. printable-ASCII with >= 4 pipes: legacy text chunk
//! 5. anything else: dropped

pub mod chunk;
pub mod classify;
pub mod envelope;
pub mod forward;
pub mod reassembly;

pub use chunk::{looks_like_chunk, ChunkMessage};
pub use classify::{DropCause, Inbound, InboundCodec};
pub use envelope::{FragmentEnvelope, ENVELOPE_MAGIC};
pub use forward::{ForwardCache, ForwardDecision};
pub use reassembly::{CompletedPayload, InsertOutcome, ReassemblyStore};

use std::time::Duration;
use thiserror::Error;

/// Health-check ping byte
pub const PING_BYTE: u8 = 0x00;

/// How long an incomplete reassembly buffer, a completed-but-unclaimed
/// payload, or a forward-dedup entry may live before the sweep evicts it.
pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the periodic cleanup sweep runs
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Default relay depth budget for a freshly fragmented message
pub const DEFAULT_TTL: u8 = 7;

/// Original-payload-type values carried in the envelope header
pub mod payload_type {
    /// Serialized protocol message (UTF-8 JSON)
    pub const TEXT: u8 = 0x01;
    /// Opaque binary payload
    pub const BINARY: u8 = 0x02;
}

/// Codec errors. Malformed inbound data never propagates past the
/// classifier — it is logged and dropped there.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Buffer too short: need {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },

    #[error("Bad envelope magic: {0:#04x}")]
    BadMagic(u8),

    #[error("Fragment index {index} out of range (total {total})")]
    IndexOutOfRange { index: u16, total: u16 },

    #[error("Fragment total must be nonzero")]
    ZeroTotal,

    #[error("Recipient id too long: {0} bytes (max 255)")]
    RecipientTooLong(usize),

    #[error("Recipient id is not UTF-8")]
    BadRecipient,

    #[error("MTU {0} too small to carry a fragment")]
    MtuTooSmall(usize),

    #[error("Payload needs {0} fragments (max 65535)")]
    TooManyFragments(usize),

    #[error("Not a chunk message")]
    NotAChunk,

    #[error("Malformed chunk field: {0}")]
    BadChunkField(String),
}
