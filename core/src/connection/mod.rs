//! Connection state machine — per-link lifecycle for both BLE roles
//!
//! The node is peripheral and central at once. Each role runs its own
//! sub-state-machine (`peripheral::PeripheralSession`,
//! `central::CentralSession`) over a shared `LinkRegistry`; both publish
//! into one `ConnectionInfoHandle`. The concurrency-sensitive decision —
//! whether an event means "start a responder handshake now" — lives in
//! `peripheral` as an explicit predicate with typed veto reasons.

pub mod central;
pub mod info;
pub mod link;
pub mod peripheral;

pub use central::CentralSession;
pub use info::{ConnectionInfo, ConnectionInfoHandle};
pub use link::{Link, LinkRegistry, LinkRole, LinkState};
pub use peripheral::{
    ArbitrationVeto, CollisionGuard, PeripheralSession, SessionIdentity,
    FALLBACK_HANDSHAKE_DELAY,
};

use serde::{Deserialize, Serialize};

/// Radio/transport events the machine consumes, each carrying the peer
/// device address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Peripheral role: a central connected to us
    CentralConnected { address: String },
    /// Peripheral role: a central went away
    CentralDisconnected { address: String },
    /// Peripheral role: a central subscribed to our characteristic
    Subscribed {
        address: String,
        characteristic: String,
    },
    /// Either role: the link MTU was renegotiated
    MtuChanged { address: String, mtu: usize },
    /// Peripheral role: inbound write
    WriteRequested {
        address: String,
        #[serde(with = "serde_bytes_vec")]
        bytes: Vec<u8>,
    },
    /// Central role: notification from a peripheral we subscribed to
    NotificationReceived {
        address: String,
        #[serde(with = "serde_bytes_vec")]
        bytes: Vec<u8>,
    },
    /// Central role: the remote's GATT table changed (app restart)
    ServiceChanged { address: String },
    /// Adapter power transitions
    RadioPoweredOn,
    RadioPoweredOff,
}

// Compact byte-array serialization for event payloads
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}
