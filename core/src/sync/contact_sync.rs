/// Contact sync — converging "do we hold each other" without ping-pong
///
/// Two booleans per peer: what they last claimed about us, and our own
/// ground truth about them. Both sides announce; gating on both directions
/// stops the degenerate loop where two nodes re-announce the same unchanged
/// value at each other forever. Once a terminal state is reached the
/// machine latches and ignores everything until an explicit reset.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Minimum gap between identical never-acknowledged announcements
pub const STATUS_COOLDOWN: Duration = Duration::from_secs(2);

/// When the one-shot retry of the initial exchange fires
pub const SYNC_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Why an incoming status produced no side effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Identical to the previous status from this peer (loop prevention)
    DuplicateStatus,
    /// Sync already completed for this peer
    AlreadyComplete,
}

/// Terminal convergence states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Both sides hold each other: ensure the ECDH secret and upgrade the
    /// security tier to High
    Mutual,
    /// Both sides have confirmed not holding each other
    NoRelationship,
}

/// Effect of an incoming status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEffect {
    /// Dropped without side effects
    Ignored(IgnoreReason),
    /// Sync completed for this peer
    Converged(Convergence),
    /// They hold us, we do not hold them: ask the user
    MutualConsentRequired,
    /// We hold them, they do not hold us yet: wait
    Waiting,
}

#[derive(Debug)]
struct PeerSync {
    /// Local ground truth from contact storage
    we_have_them: bool,
    /// Last status received from the peer
    last_received: Option<bool>,
    /// Last status we sent to the peer
    last_sent: Option<bool>,
    /// Latched once a terminal state is reached
    complete: bool,
    started_at: Instant,
    retried: bool,
}

impl PeerSync {
    fn new(we_have_them: bool, now: Instant) -> Self {
        Self {
            we_have_them,
            last_received: None,
            last_sent: None,
            complete: false,
            started_at: now,
            retried: false,
        }
    }
}

/// Per-peer sync state, keyed by peer id
pub struct ContactSyncMachine {
    peers: HashMap<String, PeerSync>,
}

impl ContactSyncMachine {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Record (or refresh) our ground truth about a peer. Creates the sync
    /// state lazily on first relevant event.
    pub fn set_local_truth(&mut self, peer_id: &str, we_have_them: bool, now: Instant) {
        let entry = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerSync::new(we_have_them, now));
        entry.we_have_them = we_have_them;
    }

    /// Should we (re)announce our status to this peer right now?
    /// Returns the value to send.
    ///
    /// Sent only when the value differs from the last one sent, or when
    /// nothing was ever sent and the cooldown has elapsed since init.
    pub fn should_send(&self, peer_id: &str, now: Instant) -> Option<bool> {
        let peer = self.peers.get(peer_id)?;
        if peer.complete {
            return None;
        }
        match peer.last_sent {
            Some(sent) if sent != peer.we_have_them => Some(peer.we_have_them),
            Some(_) => None,
            // Never sent: only after the cooldown since init has elapsed
            // (the initial exchange itself happens at handshake completion)
            None if now.duration_since(peer.started_at) >= STATUS_COOLDOWN => {
                Some(peer.we_have_them)
            }
            None => None,
        }
    }

    /// Record that we announced `value` to the peer
    pub fn record_sent(&mut self, peer_id: &str, value: bool) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_sent = Some(value);
        }
    }

    /// Process the peer's claim about us
    pub fn on_status_received(
        &mut self,
        peer_id: &str,
        they_have_us: bool,
        now: Instant,
    ) -> SyncEffect {
        let peer = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerSync::new(false, now));

        if peer.complete {
            return SyncEffect::Ignored(IgnoreReason::AlreadyComplete);
        }
        if peer.last_received == Some(they_have_us) {
            debug!(peer = %peer_id, they_have_us, "duplicate contact status ignored");
            return SyncEffect::Ignored(IgnoreReason::DuplicateStatus);
        }
        peer.last_received = Some(they_have_us);

        match (peer.we_have_them, they_have_us) {
            (true, true) => {
                peer.complete = true;
                info!(peer = %peer_id, "contact sync complete: mutual");
                SyncEffect::Converged(Convergence::Mutual)
            }
            (false, false) => {
                peer.complete = true;
                info!(peer = %peer_id, "contact sync complete: no relationship");
                SyncEffect::Converged(Convergence::NoRelationship)
            }
            (false, true) => SyncEffect::MutualConsentRequired,
            (true, false) => SyncEffect::Waiting,
        }
    }

    /// Whether the one-shot retry of the status exchange is due
    pub fn retry_due(&self, peer_id: &str, now: Instant) -> bool {
        self.peers
            .get(peer_id)
            .map(|p| {
                !p.complete && !p.retried && now.duration_since(p.started_at) >= SYNC_RETRY_DELAY
            })
            .unwrap_or(false)
    }

    pub fn mark_retried(&mut self, peer_id: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.retried = true;
        }
    }

    pub fn is_complete(&self, peer_id: &str) -> bool {
        self.peers.get(peer_id).map(|p| p.complete).unwrap_or(false)
    }

    /// Drop the sync state for a peer (disconnect, contact removed). The
    /// next relevant event starts a fresh exchange.
    pub fn reset(&mut self, peer_id: &str) {
        if self.peers.remove(peer_id).is_some() {
            debug!(peer = %peer_id, "contact sync state reset");
        }
    }

    pub fn tracked_peers(&self) -> usize {
        self.peers.len()
    }
}

impl Default for ContactSyncMachine {
    fn default() -> Self {
        Self::new()
    }
}
