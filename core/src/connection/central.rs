/// Central-role session — outbound connections to remote peripherals
///
/// The mirror of `PeripheralSession`. Mostly bookkeeping over the shared
/// registry, plus the Service-Changed zombie detection: a remote whose GATT
/// table changed under us has restarted its app, and the connection object
/// we hold is dead weight — recovery is a clean disconnect, not a retry.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::link::{Link, LinkRegistry, LinkRole, LinkState};

/// Decision for a central-role event that may end a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralAction {
    /// Nothing to do
    None,
    /// Force-disconnect this client link (zombie connection)
    ForceDisconnect { address: String },
}

/// The central-role sub-state-machine
pub struct CentralSession {
    pub scanning: bool,
    /// Remembered across radio power cycles for reconnection
    pub last_connected_device: Option<String>,
}

impl CentralSession {
    pub fn new() -> Self {
        Self {
            scanning: false,
            last_connected_device: None,
        }
    }

    /// We initiated a connection to a peripheral
    pub fn begin_connect(&mut self, address: &str, registry: &mut LinkRegistry, now: Instant) {
        registry.insert(Link::new(address, LinkRole::Client, now));
        debug!(address, "client connection started");
    }

    /// The connection came up
    pub fn on_connected(&mut self, address: &str, registry: &mut LinkRegistry, now: Instant) {
        if let Some(link) = registry.get_mut(address, LinkRole::Client) {
            link.state = LinkState::Connected;
            link.touch(now);
        }
        self.last_connected_device = Some(address.to_string());
        info!(address, "client connection established");
    }

    pub fn on_subscribed(
        &mut self,
        address: &str,
        characteristic: &str,
        registry: &mut LinkRegistry,
    ) {
        if let Some(link) = registry.get_mut(address, LinkRole::Client) {
            link.characteristic = Some(characteristic.to_string());
        }
    }

    pub fn mark_handshaking(&mut self, address: &str, registry: &mut LinkRegistry) {
        if let Some(link) = registry.get_mut(address, LinkRole::Client) {
            link.state = LinkState::Handshaking;
        }
    }

    pub fn mark_ready(&mut self, address: &str, registry: &mut LinkRegistry) {
        if let Some(link) = registry.get_mut(address, LinkRole::Client) {
            link.state = LinkState::Ready;
        }
    }

    /// The remote's GATT table changed: zombie connection, remote app
    /// restarted. Force a disconnect instead of attempting recovery.
    pub fn on_service_changed(
        &mut self,
        address: &str,
        registry: &LinkRegistry,
    ) -> CentralAction {
        let engaged = registry
            .get(address, LinkRole::Client)
            .map(|l| l.state.is_active())
            .unwrap_or(false);
        if engaged {
            warn!(address, "service-changed from live peer; forcing disconnect");
            CentralAction::ForceDisconnect {
                address: address.to_string(),
            }
        } else {
            CentralAction::None
        }
    }

    /// Tear a client link down. Cascades to handshake and MTU state held on
    /// the link itself.
    pub fn on_disconnected(&mut self, address: &str, registry: &mut LinkRegistry) {
        if registry.remove(address, LinkRole::Client).is_some() {
            info!(address, "client connection closed");
        }
    }

    /// Radio went down: remember the connected device, clear link state.
    /// Returns the remembered address, if any.
    pub fn on_radio_powered_off(&mut self, registry: &mut LinkRegistry) -> Option<String> {
        let connected: Vec<String> = registry
            .iter()
            .filter(|l| l.role == LinkRole::Client && l.state.is_active())
            .map(|l| l.address.clone())
            .collect();

        if let Some(address) = connected.first() {
            self.last_connected_device = Some(address.clone());
        }
        for address in connected {
            registry.remove(&address, LinkRole::Client);
        }
        self.last_connected_device.clone()
    }
}

impl Default for CentralSession {
    fn default() -> Self {
        Self::new()
    }
}
