/// Peripheral-role session — inbound centrals and responder arbitration
///
/// The core concurrency decision lives here: given an event that might mean
/// "a peer is ready to talk" (subscribe, MTU negotiated, first non-handshake
/// write), may we start a responder handshake? Subscription, MTU exchange,
/// and the first write race each other on real radios, so the same predicate
/// is re-evaluated by a 400 ms fallback timer.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::link::{Link, LinkRegistry, LinkRole, LinkState, DEFAULT_MTU};

/// Fallback re-evaluation delay for responder arbitration
pub const FALLBACK_HANDSHAKE_DELAY: Duration = Duration::from_millis(400);

/// Why a responder handshake was not started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationVeto {
    /// A handshake is already in progress
    HandshakeInProgress,
    /// The connection is already ready
    AlreadyReady,
    /// No connected central is known yet
    NoCentral,
    /// The central has not subscribed to a characteristic yet
    NoCharacteristic,
    /// A client-role link to the same peer is active or pending; whichever
    /// role reaches handshake first wins, the other yields
    ClientRoleEngaged,
    /// A connection collision with this peer is being resolved
    CollisionInProgress,
    /// Server teardown for this peer is deferred; do not re-engage
    TeardownDeferred,
    /// No live server-side link for the address remains
    LinkGone,
}

/// Addresses excluded from arbitration while another part of the system
/// untangles them.
#[derive(Debug, Default)]
pub struct CollisionGuard {
    resolving: HashSet<String>,
    teardown_deferred: HashSet<String>,
}

impl CollisionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_resolving(&mut self, address: &str) {
        self.resolving.insert(address.to_string());
    }

    pub fn clear_resolving(&mut self, address: &str) {
        self.resolving.remove(address);
    }

    pub fn is_resolving(&self, address: &str) -> bool {
        self.resolving.contains(address)
    }

    pub fn defer_teardown(&mut self, address: &str) {
        self.teardown_deferred.insert(address.to_string());
    }

    pub fn clear_teardown(&mut self, address: &str) {
        self.teardown_deferred.remove(address);
    }

    pub fn is_teardown_deferred(&self, address: &str) -> bool {
        self.teardown_deferred.contains(address)
    }
}

/// Peer identity that survives a peripheral⇄central mode switch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub peer_session_id: Option<String>,
    pub peer_display_name: Option<String>,
    pub mutual_contact: bool,
}

/// What a central disconnect left us with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The disconnected peer was not the active central
    Unrelated,
    /// Another server connection was promoted to active; re-attempt the
    /// responder handshake for it
    Promoted { address: String },
    /// No server connections remain; peripheral session fully reset
    Reset,
}

/// The peripheral-role sub-state-machine
pub struct PeripheralSession {
    /// The central we currently treat as the conversation partner
    pub current_central: Option<String>,
    /// Characteristic the central subscribed to
    pub characteristic: Option<String>,
    pub mtu: usize,
    pub handshake_started: bool,
    pub state: LinkState,
    pub advertising: bool,
    /// Survives mode switches
    pub identity: SessionIdentity,
}

impl PeripheralSession {
    pub fn new() -> Self {
        Self {
            current_central: None,
            characteristic: None,
            mtu: DEFAULT_MTU,
            handshake_started: false,
            state: LinkState::Disconnected,
            advertising: false,
            identity: SessionIdentity::default(),
        }
    }

    /// A central connected to us
    pub fn on_central_connected(
        &mut self,
        address: &str,
        registry: &mut LinkRegistry,
        now: Instant,
    ) {
        let mut link = Link::new(address, LinkRole::Server, now);
        link.state = LinkState::Connected;
        registry.insert(link);

        if self.current_central.is_none() {
            self.current_central = Some(address.to_string());
            self.state = LinkState::Connected;
        }
        info!(address, "central connected");
    }

    /// The central subscribed to our characteristic
    pub fn on_subscribed(
        &mut self,
        address: &str,
        characteristic: &str,
        registry: &mut LinkRegistry,
        now: Instant,
    ) {
        if self.current_central.as_deref() == Some(address) {
            self.characteristic = Some(characteristic.to_string());
        }
        if let Some(link) = registry.get_mut(address, LinkRole::Server) {
            link.characteristic = Some(characteristic.to_string());
            link.touch(now);
        }
        debug!(address, characteristic, "central subscribed");
    }

    /// Link MTU renegotiated
    pub fn on_mtu_changed(&mut self, address: &str, mtu: usize, registry: &mut LinkRegistry) {
        if self.current_central.as_deref() == Some(address) {
            self.mtu = mtu;
        }
        if let Some(link) = registry.get_mut(address, LinkRole::Server) {
            link.mtu = mtu;
        }
        debug!(address, mtu, "mtu changed");
    }

    /// The responder-handshake arbitration predicate. Ok(()) means "start
    /// the handshake now"; a veto names the clause that failed.
    pub fn should_start_responder(
        &self,
        registry: &LinkRegistry,
        guard: &CollisionGuard,
    ) -> Result<(), ArbitrationVeto> {
        if self.handshake_started {
            return Err(ArbitrationVeto::HandshakeInProgress);
        }
        if self.state == LinkState::Ready {
            return Err(ArbitrationVeto::AlreadyReady);
        }
        let address = self
            .current_central
            .as_deref()
            .ok_or(ArbitrationVeto::NoCentral)?;
        if self.characteristic.is_none() {
            return Err(ArbitrationVeto::NoCharacteristic);
        }
        if registry.client_link_engaged(address) {
            return Err(ArbitrationVeto::ClientRoleEngaged);
        }
        if guard.is_resolving(address) {
            return Err(ArbitrationVeto::CollisionInProgress);
        }
        if guard.is_teardown_deferred(address) {
            return Err(ArbitrationVeto::TeardownDeferred);
        }
        let live = registry
            .get(address, LinkRole::Server)
            .map(|l| l.state.is_active())
            .unwrap_or(false);
        if !live {
            return Err(ArbitrationVeto::LinkGone);
        }
        Ok(())
    }

    /// Record that the responder handshake was started
    pub fn mark_handshake_started(&mut self, registry: &mut LinkRegistry) {
        self.handshake_started = true;
        self.state = LinkState::Handshaking;
        if let Some(address) = self.current_central.clone() {
            if let Some(link) = registry.get_mut(&address, LinkRole::Server) {
                link.state = LinkState::Handshaking;
            }
        }
    }

    /// Handshake completed; the link is usable
    pub fn mark_ready(&mut self, registry: &mut LinkRegistry) {
        self.state = LinkState::Ready;
        if let Some(address) = self.current_central.clone() {
            if let Some(link) = registry.get_mut(&address, LinkRole::Server) {
                link.state = LinkState::Ready;
            }
        }
    }

    /// A central disconnected. If it was the active one, promote the most
    /// recent remaining server connection, or reset if none remain.
    pub fn on_central_disconnected(
        &mut self,
        address: &str,
        registry: &mut LinkRegistry,
    ) -> DisconnectOutcome {
        registry.remove(address, LinkRole::Server);

        if self.current_central.as_deref() != Some(address) {
            return DisconnectOutcome::Unrelated;
        }

        // Teardown cascades: handshake coordinator, characteristic, MTU
        self.current_central = None;
        self.characteristic = None;
        self.handshake_started = false;
        self.mtu = DEFAULT_MTU;
        self.state = LinkState::Disconnected;

        let promoted = registry
            .server_links_by_recency()
            .first()
            .map(|l| (l.address.clone(), l.characteristic.clone(), l.mtu));

        match promoted {
            Some((address, characteristic, mtu)) => {
                info!(address = %address, "promoting remaining server connection");
                self.current_central = Some(address.clone());
                self.characteristic = characteristic;
                self.mtu = mtu;
                self.state = LinkState::Connected;
                DisconnectOutcome::Promoted { address }
            }
            None => {
                info!("no server connections remain; peripheral session reset");
                DisconnectOutcome::Reset
            }
        }
    }

    /// Switch the node into central-only mode. Session/contact identity is
    /// preserved; peripheral transients are cleared. The caller stops mesh
    /// (advertising + scanning) and removes GATT services, then restarts
    /// explicitly.
    pub fn enter_central_only_mode(&mut self) -> SessionIdentity {
        self.current_central = None;
        self.characteristic = None;
        self.handshake_started = false;
        self.mtu = DEFAULT_MTU;
        self.state = LinkState::Disconnected;
        self.advertising = false;
        self.identity.clone()
    }
}

impl Default for PeripheralSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_session(registry: &mut LinkRegistry) -> PeripheralSession {
        let mut session = PeripheralSession::new();
        session.on_central_connected("AA", registry, Instant::now());
        session.on_subscribed("AA", "char-1", registry, Instant::now());
        session
    }

    #[test]
    fn test_arbitration_passes_when_all_clauses_hold() {
        let mut registry = LinkRegistry::new();
        let session = ready_session(&mut registry);
        let guard = CollisionGuard::new();

        assert_eq!(session.should_start_responder(&registry, &guard), Ok(()));
    }

    #[test]
    fn test_arbitration_vetoes_in_progress_handshake() {
        let mut registry = LinkRegistry::new();
        let mut session = ready_session(&mut registry);
        let guard = CollisionGuard::new();

        session.mark_handshake_started(&mut registry);
        assert_eq!(
            session.should_start_responder(&registry, &guard),
            Err(ArbitrationVeto::HandshakeInProgress)
        );
    }

    #[test]
    fn test_arbitration_vetoes_ready_connection() {
        let mut registry = LinkRegistry::new();
        let mut session = ready_session(&mut registry);
        let guard = CollisionGuard::new();

        session.state = LinkState::Ready;
        assert_eq!(
            session.should_start_responder(&registry, &guard),
            Err(ArbitrationVeto::AlreadyReady)
        );
    }

    #[test]
    fn test_arbitration_requires_central_and_characteristic() {
        let registry = LinkRegistry::new();
        let guard = CollisionGuard::new();

        let session = PeripheralSession::new();
        assert_eq!(
            session.should_start_responder(&registry, &guard),
            Err(ArbitrationVeto::NoCentral)
        );

        let mut registry = LinkRegistry::new();
        let mut session = PeripheralSession::new();
        session.on_central_connected("AA", &mut registry, Instant::now());
        assert_eq!(
            session.should_start_responder(&registry, &guard),
            Err(ArbitrationVeto::NoCharacteristic)
        );
    }

    #[test]
    fn test_arbitration_yields_to_client_role_link() {
        // A client-role link to the peer is active; an inbound peripheral
        // write from it must not start a responder handshake.
        let mut registry = LinkRegistry::new();
        let session = ready_session(&mut registry);
        let guard = CollisionGuard::new();

        registry.insert(Link::new("AA", LinkRole::Client, Instant::now()));
        assert_eq!(
            session.should_start_responder(&registry, &guard),
            Err(ArbitrationVeto::ClientRoleEngaged)
        );
    }

    #[test]
    fn test_arbitration_respects_collision_guard() {
        let mut registry = LinkRegistry::new();
        let session = ready_session(&mut registry);
        let mut guard = CollisionGuard::new();

        guard.mark_resolving("AA");
        assert_eq!(
            session.should_start_responder(&registry, &guard),
            Err(ArbitrationVeto::CollisionInProgress)
        );

        guard.clear_resolving("AA");
        guard.defer_teardown("AA");
        assert_eq!(
            session.should_start_responder(&registry, &guard),
            Err(ArbitrationVeto::TeardownDeferred)
        );

        guard.clear_teardown("AA");
        assert_eq!(session.should_start_responder(&registry, &guard), Ok(()));
    }

    #[test]
    fn test_arbitration_requires_live_server_link() {
        let mut registry = LinkRegistry::new();
        let session = ready_session(&mut registry);
        let guard = CollisionGuard::new();

        registry.remove("AA", LinkRole::Server);
        assert_eq!(
            session.should_start_responder(&registry, &guard),
            Err(ArbitrationVeto::LinkGone)
        );
    }

    #[test]
    fn test_disconnect_of_inactive_central_is_unrelated() {
        let mut registry = LinkRegistry::new();
        let mut session = ready_session(&mut registry);
        session.on_central_connected("BB", &mut registry, Instant::now());
        // AA connected first and stays active
        assert_eq!(session.current_central.as_deref(), Some("AA"));

        let outcome = session.on_central_disconnected("BB", &mut registry);
        assert_eq!(outcome, DisconnectOutcome::Unrelated);
        assert_eq!(session.current_central.as_deref(), Some("AA"));
    }

    #[test]
    fn test_disconnect_promotes_most_recent_remaining() {
        let mut registry = LinkRegistry::new();
        let mut session = PeripheralSession::new();
        let base = Instant::now();

        session.on_central_connected("AA", &mut registry, base);
        session.on_subscribed("AA", "char-1", &mut registry, base);
        session.on_central_connected("BB", &mut registry, base + Duration::from_secs(1));
        session.on_subscribed("BB", "char-2", &mut registry, base + Duration::from_secs(1));
        session.mark_handshake_started(&mut registry);

        let outcome = session.on_central_disconnected("AA", &mut registry);
        assert_eq!(
            outcome,
            DisconnectOutcome::Promoted {
                address: "BB".to_string()
            }
        );
        assert_eq!(session.current_central.as_deref(), Some("BB"));
        assert_eq!(session.characteristic.as_deref(), Some("char-2"));
        // The old handshake state must not leak onto the promoted link
        assert!(!session.handshake_started);
    }

    #[test]
    fn test_disconnect_with_no_remaining_resets() {
        let mut registry = LinkRegistry::new();
        let mut session = ready_session(&mut registry);
        session.mark_handshake_started(&mut registry);

        let outcome = session.on_central_disconnected("AA", &mut registry);
        assert_eq!(outcome, DisconnectOutcome::Reset);
        assert_eq!(session.current_central, None);
        assert_eq!(session.characteristic, None);
        assert!(!session.handshake_started);
        assert_eq!(session.state, LinkState::Disconnected);
    }

    #[test]
    fn test_central_only_mode_preserves_identity() {
        let mut registry = LinkRegistry::new();
        let mut session = ready_session(&mut registry);
        session.identity = SessionIdentity {
            peer_session_id: Some("peer-sess".to_string()),
            peer_display_name: Some("Bo".to_string()),
            mutual_contact: true,
        };
        session.mark_handshake_started(&mut registry);
        session.advertising = true;

        let preserved = session.enter_central_only_mode();

        assert_eq!(preserved.peer_session_id.as_deref(), Some("peer-sess"));
        assert_eq!(preserved.peer_display_name.as_deref(), Some("Bo"));
        assert!(preserved.mutual_contact);
        // Transients cleared
        assert_eq!(session.current_central, None);
        assert_eq!(session.characteristic, None);
        assert!(!session.handshake_started);
        assert!(!session.advertising);
        // Identity still present on the session itself
        assert!(session.identity.mutual_contact);
    }

    #[test]
    fn test_mtu_tracked_for_current_central_only() {
        let mut registry = LinkRegistry::new();
        let mut session = ready_session(&mut registry);
        session.on_central_connected("BB", &mut registry, Instant::now());

        session.on_mtu_changed("BB", 247, &mut registry);
        assert_eq!(session.mtu, DEFAULT_MTU);

        session.on_mtu_changed("AA", 185, &mut registry);
        assert_eq!(session.mtu, 185);
    }
}
