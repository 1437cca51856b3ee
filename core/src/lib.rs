// Weft Core — BLE mesh link engine
#![allow(clippy::empty_line_after_doc_comments)]
//
// Turns an unreliable, MTU-limited, dual-role radio link into a reliable
// ordered message channel with mesh relay. The radio itself, persistence,
// and the crypto primitives live outside, behind the traits in `traits`.

pub mod codec;
pub mod connection;
pub mod engine;
pub mod health;
pub mod identity;
pub mod logging;
pub mod outbound;
pub mod protocol;
pub mod sync;
pub mod traits;

pub use codec::{ChunkMessage, CompletedPayload, FragmentEnvelope, Inbound, InboundCodec};
pub use connection::{ConnectionEvent, ConnectionInfo, LinkRole, LinkState};
pub use engine::{EngineConfig, EngineDeps, EngineEvent, EngineHandle, LinkEngine, ReceivedContent};
pub use health::{HealthConfig, HealthMonitor, HealthState};
pub use identity::{LocalIdentity, SecurityTier};
pub use outbound::{AckOutcome, AckTracker, SendError, SendOutcome, SendPipeline};
pub use protocol::{EncryptionMethod, MessageKind, ProtocolMessage};
pub use sync::{ContactSyncMachine, SyncEffect};
pub use traits::{
    ContactRecord, ContactStore, CryptoError, CryptoProvider, HandshakeDriver, HandshakeRole,
    RelayTopology, TransportError, TransportWriter,
};
