/// Observable connection summary — one per node, mutated by everyone
///
/// Every component updates this through the single `apply` entry point,
/// which serializes the mutation and broadcasts the new snapshot. Direct
/// field mutation from outside would lose updates when, say, the health
/// monitor and a handshake completion race.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Snapshot of the node's link status, as shown to consumers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub ready: bool,
    pub advertising: bool,
    pub scanning: bool,
    pub reconnecting: bool,
    /// Display name of the active peer, when known
    pub peer_name: Option<String>,
    /// Human-readable status line
    pub status: String,
}

/// Serialized mutate-and-broadcast handle around `ConnectionInfo`
pub struct ConnectionInfoHandle {
    inner: Mutex<ConnectionInfo>,
    tx: watch::Sender<ConnectionInfo>,
}

impl ConnectionInfoHandle {
    pub fn new() -> (Self, watch::Receiver<ConnectionInfo>) {
        let info = ConnectionInfo::default();
        let (tx, rx) = watch::channel(info.clone());
        (
            Self {
                inner: Mutex::new(info),
                tx,
            },
            rx,
        )
    }

    /// Apply a mutation and broadcast the result. The lock spans both, so
    /// concurrent updates cannot interleave and drop each other's fields.
    pub fn apply(&self, mutate: impl FnOnce(&mut ConnectionInfo)) -> ConnectionInfo {
        let mut info = self.inner.lock();
        mutate(&mut info);
        let snapshot = info.clone();
        // Receivers may all be gone; that is not an error
        let _ = self.tx.send(snapshot.clone());
        snapshot
    }

    pub fn snapshot(&self) -> ConnectionInfo {
        self.inner.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionInfo> {
        self.tx.subscribe()
    }
}
