/// Links and the per-address, per-role registry
///
/// A Link is one physical BLE connection. The same peer address may appear
/// once per role (we connect to them as central while they connect to us as
/// peripheral), never twice in one role.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Which side of the connection we are for this link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkRole {
    /// We are the peripheral; the peer connected to us
    Server,
    /// We are the central; we connected to the peer
    Client,
}

/// Per-link lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Handshaking,
    Ready,
    /// Transient teardown on any error; returns to Disconnected
    Disconnecting,
}

impl LinkState {
    /// Active means the link occupies its (address, role) slot: it is
    /// either usable or on its way to being usable.
    pub fn is_active(&self) -> bool {
        !matches!(self, LinkState::Disconnected | LinkState::Disconnecting)
    }

    /// Pending means connecting or handshaking — not yet usable, but a
    /// competing role must still yield to it.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            LinkState::Connecting | LinkState::Connected | LinkState::Handshaking
        )
    }
}

/// One physical BLE connection
#[derive(Debug, Clone)]
pub struct Link {
    pub address: String,
    pub role: LinkRole,
    pub state: LinkState,
    pub mtu: usize,
    /// Characteristic we write to (client) or notify on (server)
    pub characteristic: Option<String>,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

/// Default ATT MTU before negotiation
pub const DEFAULT_MTU: usize = 23;

impl Link {
    pub fn new(address: impl Into<String>, role: LinkRole, now: Instant) -> Self {
        Self {
            address: address.into(),
            role,
            state: LinkState::Connecting,
            mtu: DEFAULT_MTU,
            characteristic: None,
            connected_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }
}

/// All live links, keyed by (address, role)
pub struct LinkRegistry {
    links: HashMap<(String, LinkRole), Link>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
        }
    }

    /// Insert a fresh link, replacing any stale one in the same slot
    pub fn insert(&mut self, link: Link) -> Option<Link> {
        self.links
            .insert((link.address.clone(), link.role), link)
    }

    pub fn get(&self, address: &str, role: LinkRole) -> Option<&Link> {
        self.links.get(&(address.to_string(), role))
    }

    pub fn get_mut(&mut self, address: &str, role: LinkRole) -> Option<&mut Link> {
        self.links.get_mut(&(address.to_string(), role))
    }

    pub fn remove(&mut self, address: &str, role: LinkRole) -> Option<Link> {
        self.links.remove(&(address.to_string(), role))
    }

    /// A client-role link to this address that is active or pending.
    /// Responder arbitration and the reconnect policy both yield to it.
    pub fn client_link_engaged(&self, address: &str) -> bool {
        self.get(address, LinkRole::Client)
            .map(|l| l.state.is_active())
            .unwrap_or(false)
    }

    /// Server-role links, most recently connected first
    pub fn server_links_by_recency(&self) -> Vec<&Link> {
        let mut links: Vec<&Link> = self
            .links
            .values()
            .filter(|l| l.role == LinkRole::Server && l.state.is_active())
            .collect();
        links.sort_by(|a, b| b.connected_at.cmp(&a.connected_at));
        links
    }

    pub fn active_count(&self) -> usize {
        self.links.values().filter(|l| l.state.is_active()).count()
    }

    /// Drop every link (radio power loss)
    pub fn clear(&mut self) {
        self.links.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
