//! Link engine — one dispatcher loop per node
//!
//! Owns the codec, pipeline, connection machine, health monitor, and sync
//! machine, and serializes every mutation through a single `select!` loop.
//! Radio I/O (pings, handshakes, reconnect attempts, relays, sends) runs in
//! spawned tasks that report back through the same input channel, so no
//! await ever blocks event dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::codec::{Inbound, InboundCodec, SWEEP_INTERVAL};
use crate::connection::{
    CentralSession, CollisionGuard, ConnectionEvent, ConnectionInfo, ConnectionInfoHandle,
    LinkRegistry, LinkRole, LinkState, PeripheralSession, FALLBACK_HANDSHAKE_DELAY,
};
use crate::health::{
    FailureAction, HealthConfig, HealthFlags, HealthMonitor, HealthState, MonitorStatus,
};
use crate::identity::{LocalIdentity, SecurityTier};
use crate::outbound::{AckTracker, LinkSnapshot, SendError, SendOutcome, SendPipeline};
use crate::protocol::{MessageKind, ProtocolMessage};
use crate::sync::{ContactSyncMachine, Convergence, SyncEffect, SYNC_RETRY_DELAY};
use crate::traits::{
    ContactStore, CryptoProvider, HandshakeDriver, HandshakeRole, RelayTopology, TransportWriter,
};

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub health: HealthConfig,
    pub sweep_interval: Duration,
    pub fallback_handshake_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            sweep_interval: SWEEP_INTERVAL,
            fallback_handshake_delay: FALLBACK_HANDSHAKE_DELAY,
        }
    }
}

/// External collaborators, passed in explicitly so tests can run isolated
/// engine instances.
pub struct EngineDeps {
    pub transport: Arc<dyn TransportWriter>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub contacts: Arc<dyn ContactStore>,
    pub topology: Arc<dyn RelayTopology>,
    pub handshake: Arc<dyn HandshakeDriver>,
    pub local: LocalIdentity,
}

/// Post-decrypt content of a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedContent {
    Plaintext(String),
    /// Decryption failed; the UI renders a failure state instead of text
    Undecryptable,
    /// Signature verification failed
    Untrusted,
}

/// Events the engine emits
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MessageReceived {
        message_id: String,
        sender: String,
        content: ReceivedContent,
    },
    MessageSent {
        message_id: String,
        delivered: bool,
    },
    RelayDecision {
        fragment_id: String,
        forwarded: bool,
        ttl: u8,
    },
    SpyModeDetected {
        peer: String,
    },
    IdentityRevealed {
        peer_session_id: String,
        persistent_id: String,
    },
    ContactStatusChanged {
        peer: String,
        mutual: bool,
    },
    MutualConsentRequired {
        peer: String,
    },
}

enum EngineInput {
    Transport(ConnectionEvent),
    SendText {
        contact_key: String,
        text: String,
        reply: oneshot::Sender<Result<SendOutcome, SendError>>,
    },
    SetPairingInProgress(bool),
    EnterCentralOnlyMode,
    FallbackArbitration {
        address: String,
    },
    HandshakeFinished {
        address: String,
        link_role: LinkRole,
        success: bool,
    },
    PingResult {
        address: String,
        success: bool,
    },
    ReconnectAttempt {
        address: String,
    },
    ReconnectResult {
        address: String,
        success: bool,
    },
    SyncRetry {
        peer: String,
        address: String,
    },
    Shutdown,
}

/// Cheap cloneable handle for talking to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    input_tx: mpsc::Sender<EngineInput>,
    events_tx: broadcast::Sender<EngineEvent>,
    info_rx: watch::Receiver<ConnectionInfo>,
}

impl EngineHandle {
    /// Feed a transport event into the engine
    pub async fn inject(&self, event: ConnectionEvent) {
        let _ = self.input_tx.send(EngineInput::Transport(event)).await;
    }

    /// Send text to a peer and await the delivery outcome
    pub async fn send_text(
        &self,
        contact_key: &str,
        text: &str,
    ) -> Result<SendOutcome, SendError> {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .input_tx
            .send(EngineInput::SendText {
                contact_key: contact_key.to_string(),
                text: text.to_string(),
                reply,
            })
            .await;
        if sent.is_err() {
            return Err(SendError::NoLink);
        }
        rx.await.unwrap_or(Err(SendError::NoLink))
    }

    pub async fn set_pairing_in_progress(&self, pairing: bool) {
        let _ = self
            .input_tx
            .send(EngineInput::SetPairingInProgress(pairing))
            .await;
    }

    /// Switch into central-only mode (UI-driven rescan). Peer identity is
    /// preserved; peripheral transients are cleared. The caller stops mesh
    /// networking and restarts scanning explicitly.
    pub async fn enter_central_only_mode(&self) {
        let _ = self.input_tx.send(EngineInput::EnterCentralOnlyMode).await;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    pub fn connection_info(&self) -> watch::Receiver<ConnectionInfo> {
        self.info_rx.clone()
    }

    /// Stop the engine: cancels timers and resolves pending ACKs with a
    /// terminal failure.
    pub async fn shutdown(&self) {
        let _ = self.input_tx.send(EngineInput::Shutdown).await;
    }
}

/// The link engine. Construct with `new`, then drive with `run`.
pub struct LinkEngine {
    cfg: EngineConfig,
    local: LocalIdentity,
    transport: Arc<dyn TransportWriter>,
    crypto: Arc<dyn CryptoProvider>,
    contacts: Arc<dyn ContactStore>,
    topology: Arc<dyn RelayTopology>,
    handshake: Arc<dyn HandshakeDriver>,

    codec: InboundCodec,
    pipeline: Arc<SendPipeline>,
    acks: Arc<AckTracker>,
    registry: LinkRegistry,
    peripheral: PeripheralSession,
    central: CentralSession,
    guard: CollisionGuard,
    monitor: HealthMonitor,
    sync: ContactSyncMachine,
    info: Arc<ConnectionInfoHandle>,

    events_tx: broadcast::Sender<EngineEvent>,
    input_tx: mpsc::Sender<EngineInput>,
    input_rx: mpsc::Receiver<EngineInput>,
    tasks: Vec<JoinHandle<()>>,

    /// address -> last known peer id on that address
    addr_peer: HashMap<String, String>,
    /// Ephemeral sender ids observed, for identity-reveal detection
    seen_session_senders: HashSet<String>,
    /// Addresses with a fallback arbitration timer already pending
    pending_fallback: HashSet<String>,
    pairing_in_progress: bool,
    next_health_at: Instant,
}

impl LinkEngine {
    pub fn new(deps: EngineDeps, cfg: EngineConfig) -> (Self, EngineHandle) {
        let acks = Arc::new(AckTracker::new());
        let busy = Arc::new(AtomicBool::new(false));
        let pipeline = Arc::new(SendPipeline::new(
            deps.contacts.clone(),
            deps.crypto.clone(),
            deps.transport.clone(),
            acks.clone(),
            busy,
        ));

        let mut codec = InboundCodec::new(deps.local.session_id.clone());
        let mut local_ids = vec![deps.local.session_id.clone()];
        if let Some(pk) = &deps.local.persistent_id {
            local_ids.push(pk.clone());
        }
        codec.set_local_ids(local_ids);

        let (info, info_rx) = ConnectionInfoHandle::new();
        let (events_tx, _) = broadcast::channel(64);
        let (input_tx, input_rx) = mpsc::channel(256);

        let monitor = HealthMonitor::new(cfg.health.clone());
        let handle = EngineHandle {
            input_tx: input_tx.clone(),
            events_tx: events_tx.clone(),
            info_rx,
        };

        let engine = Self {
            next_health_at: Instant::now() + monitor.current_interval(),
            cfg,
            local: deps.local,
            transport: deps.transport,
            crypto: deps.crypto,
            contacts: deps.contacts,
            topology: deps.topology,
            handshake: deps.handshake,
            codec,
            pipeline,
            acks,
            registry: LinkRegistry::new(),
            peripheral: PeripheralSession::new(),
            central: CentralSession::new(),
            guard: CollisionGuard::new(),
            monitor,
            sync: ContactSyncMachine::new(),
            info: Arc::new(info),
            events_tx,
            input_tx,
            input_rx,
            tasks: Vec::new(),
            addr_peer: HashMap::new(),
            seen_session_senders: HashSet::new(),
            pending_fallback: HashSet::new(),
            pairing_in_progress: false,
        };
        (engine, handle)
    }

    /// Run until shutdown. Consumes the engine.
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.cfg.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it
        sweep.tick().await;

        loop {
            let health_sleep = tokio::time::sleep_until(self.next_health_at.into());
            tokio::pin!(health_sleep);

            tokio::select! {
                maybe = self.input_rx.recv() => {
                    match maybe {
                        None | Some(EngineInput::Shutdown) => break,
                        Some(input) => self.handle_input(input),
                    }
                }
                _ = sweep.tick() => {
                    let evicted = self.codec.sweep(Instant::now());
                    if evicted > 0 {
                        debug!(evicted, "cleanup sweep");
                    }
                }
                _ = &mut health_sleep => {
                    self.health_cycle();
                }
            }

            self.tasks.retain(|t| !t.is_finished());
        }

        self.dispose();
    }

    fn dispose(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let cancelled = self.acks.fail_all();
        if cancelled > 0 {
            debug!(cancelled, "pending acks cancelled at shutdown");
        }
        info!("link engine stopped");
    }

    fn spawn(&mut self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.push(tokio::spawn(fut));
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    // ---- input dispatch ------------------------------------------------

    fn handle_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Transport(event) => self.handle_transport_event(event),
            EngineInput::SendText {
                contact_key,
                text,
                reply,
            } => self.handle_send_text(contact_key, text, reply),
            EngineInput::SetPairingInProgress(pairing) => {
                self.pairing_in_progress = pairing;
            }
            EngineInput::EnterCentralOnlyMode => {
                let identity = self.peripheral.enter_central_only_mode();
                self.central.scanning = false;
                self.info.apply(|i| {
                    i.connected = false;
                    i.ready = false;
                    i.advertising = false;
                    i.scanning = false;
                    i.peer_name = identity.peer_display_name.clone();
                    i.status = "central-only mode".to_string();
                });
            }
            EngineInput::FallbackArbitration { address } => {
                self.pending_fallback.remove(&address);
                if self.peripheral.current_central.as_deref() == Some(address.as_str()) {
                    // One re-evaluation; no further fallback chaining
                    self.try_responder_handshake(false);
                }
            }
            EngineInput::HandshakeFinished {
                address,
                link_role,
                success,
            } => self.handle_handshake_finished(address, link_role, success),
            EngineInput::PingResult { address, success } => {
                self.handle_ping_result(address, success)
            }
            EngineInput::ReconnectAttempt { address } => self.attempt_reconnect(address),
            EngineInput::ReconnectResult { address, success } => {
                self.handle_reconnect_result(address, success)
            }
            EngineInput::SyncRetry { peer, address } => {
                if self.sync.retry_due(&peer, Instant::now()) {
                    self.sync.mark_retried(&peer);
                    self.send_contact_status(&peer, &address);
                }
            }
            // Shutdown is intercepted by the run loop before dispatch
            EngineInput::Shutdown => {}
        }
    }

    fn handle_transport_event(&mut self, event: ConnectionEvent) {
        let now = Instant::now();
        match event {
            ConnectionEvent::CentralConnected { address } => {
                self.peripheral
                    .on_central_connected(&address, &mut self.registry, now);
                self.monitor.note_grace(now);
                self.info.apply(|i| {
                    i.connected = true;
                    i.status = "connected".to_string();
                });
            }
            ConnectionEvent::CentralDisconnected { address } => {
                self.on_peer_gone(&address);
                let outcome = self
                    .peripheral
                    .on_central_disconnected(&address, &mut self.registry);
                match outcome {
                    crate::connection::peripheral::DisconnectOutcome::Promoted { .. } => {
                        self.try_responder_handshake(true);
                    }
                    crate::connection::peripheral::DisconnectOutcome::Reset => {
                        self.peripheral.advertising = true;
                        self.info.apply(|i| {
                            i.connected = false;
                            i.ready = false;
                            i.advertising = true;
                            i.status = "advertising".to_string();
                        });
                    }
                    crate::connection::peripheral::DisconnectOutcome::Unrelated => {}
                }
            }
            ConnectionEvent::Subscribed {
                address,
                characteristic,
            } => {
                // Subscription can land on either role's link
                self.peripheral
                    .on_subscribed(&address, &characteristic, &mut self.registry, now);
                self.central
                    .on_subscribed(&address, &characteristic, &mut self.registry);
                self.try_responder_handshake(true);
            }
            ConnectionEvent::MtuChanged { address, mtu } => {
                self.peripheral
                    .on_mtu_changed(&address, mtu, &mut self.registry);
                if let Some(link) = self.registry.get_mut(&address, LinkRole::Client) {
                    link.mtu = mtu;
                }
                self.try_responder_handshake(true);
            }
            ConnectionEvent::WriteRequested { address, bytes } => {
                let was_handshake = self.on_inbound(&address, &bytes);
                if !was_handshake {
                    self.try_responder_handshake(true);
                }
            }
            ConnectionEvent::NotificationReceived { address, bytes } => {
                if let Some(link) = self.registry.get_mut(&address, LinkRole::Client) {
                    link.touch(now);
                }
                self.on_inbound(&address, &bytes);
            }
            ConnectionEvent::ServiceChanged { address } => {
                if let crate::connection::central::CentralAction::ForceDisconnect { address } =
                    self.central.on_service_changed(&address, &self.registry)
                {
                    self.on_peer_gone(&address);
                    self.central.on_disconnected(&address, &mut self.registry);
                    self.info.apply(|i| {
                        i.connected = false;
                        i.ready = false;
                        i.status = "zombie connection dropped".to_string();
                    });
                }
            }
            ConnectionEvent::RadioPoweredOn => {
                let has_active = self.registry.active_count() > 0;
                if let Some((device, settle)) = self.monitor.on_radio_powered_on(has_active) {
                    self.info.apply(|i| i.reconnecting = true);
                    let tx = self.input_tx.clone();
                    self.spawn(async move {
                        tokio::time::sleep(settle).await;
                        let _ = tx
                            .send(EngineInput::ReconnectAttempt { address: device })
                            .await;
                    });
                }
            }
            ConnectionEvent::RadioPoweredOff => {
                let remembered = self.central.on_radio_powered_off(&mut self.registry);
                self.monitor.on_radio_powered_off(remembered);
                self.registry.clear();
                self.peripheral.enter_central_only_mode();
                self.info.apply(|i| {
                    *i = ConnectionInfo {
                        status: "bluetooth off".to_string(),
                        ..ConnectionInfo::default()
                    };
                });
            }
        }
    }

    /// Peer-scoped cleanup shared by every disconnect path
    fn on_peer_gone(&mut self, address: &str) {
        if let Some(peer) = self.addr_peer.get(address).cloned() {
            self.sync.reset(&peer);
        }
    }

    // ---- inbound bytes -------------------------------------------------

    /// Classify and dispatch one inbound buffer. Returns true when the
    /// buffer was handshake traffic (responder arbitration must not react).
    fn on_inbound(&mut self, address: &str, bytes: &[u8]) -> bool {
        let now = Instant::now();
        match self.codec.classify(bytes, now) {
            Inbound::Ping => {
                if let Some(link) = self.registry.get_mut(address, LinkRole::Server) {
                    link.touch(now);
                }
                false
            }
            Inbound::Direct(msg) => {
                let was_handshake = msg.kind == MessageKind::Handshake;
                self.dispatch_protocol(address, msg);
                was_handshake
            }
            Inbound::PayloadReady(payload) => {
                match ProtocolMessage::from_bytes(&payload.bytes) {
                    Ok(msg) => {
                        let was_handshake = msg.kind == MessageKind::Handshake;
                        self.dispatch_protocol(address, msg);
                        was_handshake
                    }
                    Err(e) => {
                        debug!(id = %payload.id, error = %e, "reassembled payload is not a protocol message");
                        false
                    }
                }
            }
            Inbound::Relay {
                bytes,
                fragment_id,
                ttl,
                recipient,
            } => {
                self.forward_fragment(address, bytes, fragment_id, ttl, recipient);
                false
            }
            Inbound::Buffered => false,
            Inbound::Dropped(cause) => {
                trace!(?cause, "inbound buffer dropped");
                false
            }
        }
    }

    fn forward_fragment(
        &mut self,
        from: &str,
        bytes: Vec<u8>,
        fragment_id: String,
        ttl: u8,
        recipient: String,
    ) {
        let hop = self.topology.next_hop(&recipient);
        let snapshot = hop.as_deref().and_then(|addr| self.link_for(addr));

        let forwarded = snapshot.is_some();
        self.emit(EngineEvent::RelayDecision {
            fragment_id: fragment_id.clone(),
            forwarded,
            ttl,
        });

        let Some(link) = snapshot else {
            debug!(fragment_id = %fragment_id, from, "no next hop for relay fragment");
            return;
        };

        let transport = self.transport.clone();
        self.spawn(async move {
            let result = match link.role {
                LinkRole::Client => {
                    transport
                        .write(&link.address, &link.characteristic, &bytes)
                        .await
                }
                LinkRole::Server => {
                    transport
                        .notify(&link.address, &link.characteristic, &bytes)
                        .await
                }
            };
            if let Err(e) = result {
                debug!(error = %e, "relay forward failed");
            }
        });
    }

    // ---- protocol dispatch ---------------------------------------------

    fn dispatch_protocol(&mut self, address: &str, msg: ProtocolMessage) {
        self.addr_peer
            .insert(address.to_string(), msg.sender.clone());

        match msg.kind {
            MessageKind::Message => self.handle_chat_message(address, msg),
            MessageKind::Ack => {
                self.pipeline.on_ack_received(&msg.id);
            }
            MessageKind::ContactStatus => self.handle_contact_status(address, msg),
            MessageKind::Handshake => {
                // Handshake routing lives outside the engine; the kind only
                // matters for arbitration gating
                trace!(sender = %msg.sender, "handshake traffic observed");
            }
            MessageKind::QueueSync => {
                trace!(sender = %msg.sender, "queue sync message observed");
            }
        }
    }

    fn handle_chat_message(&mut self, address: &str, msg: ProtocolMessage) {
        let sender = msg.sender.clone();
        let record = self.contacts.lookup(&sender);

        // Anonymous-sender detection: an established secure session exists
        // but the peer chose an id other than its persistent one
        if self.crypto.has_secure_session(&sender) {
            let is_persistent = record
                .as_ref()
                .and_then(|r| r.persistent_id.as_deref())
                .map(|p| p == sender)
                .unwrap_or(false);
            if !is_persistent {
                self.emit(EngineEvent::SpyModeDetected {
                    peer: sender.clone(),
                });
            }
        }

        // Identity reveal: a persistent id shows up for a peer we only knew
        // by its session id
        if let Some(record) = &record {
            if record.persistent_id.as_deref() == Some(sender.as_str()) {
                if let Some(session_id) = &record.session_id {
                    if self.seen_session_senders.contains(session_id) {
                        self.emit(EngineEvent::IdentityRevealed {
                            peer_session_id: session_id.clone(),
                            persistent_id: sender.clone(),
                        });
                    }
                }
            } else {
                self.seen_session_senders.insert(sender.clone());
            }
        } else {
            self.seen_session_senders.insert(sender.clone());
        }

        let content = self.decode_content(&msg);

        // Application-level delivery ACK back to the sender
        if let Some(link) = self.link_for(address) {
            let ack = ProtocolMessage::ack(
                &msg.id,
                self.local.session_id.clone(),
                sender.clone(),
                now_millis(),
            );
            let pipeline = self.pipeline.clone();
            self.spawn(async move {
                if let Err(e) = pipeline.send_protocol(&link, &ack).await {
                    debug!(error = %e, "failed to send delivery ack");
                }
            });
        }

        self.emit(EngineEvent::MessageReceived {
            message_id: msg.id,
            sender,
            content,
        });
    }

    fn decode_content(&self, msg: &ProtocolMessage) -> ReceivedContent {
        let Some(raw) = msg.content.as_deref() else {
            return ReceivedContent::Plaintext(String::new());
        };

        let text = if msg.encrypted {
            let Some(method) = msg.method else {
                return ReceivedContent::Undecryptable;
            };
            match self.crypto.decrypt(raw, &msg.sender, method) {
                Ok(text) => text,
                Err(e) => {
                    warn!(sender = %msg.sender, error = %e, "decryption failed");
                    return ReceivedContent::Undecryptable;
                }
            }
        } else {
            raw.to_string()
        };

        if let Some(signature) = &msg.signature {
            let record = self.contacts.lookup(&msg.sender);
            let ephemeral = record
                .as_ref()
                .and_then(|r| r.persistent_id.as_deref())
                .map(|p| p != msg.sender)
                .unwrap_or(true);
            if !self.crypto.verify(raw, signature, &msg.sender, ephemeral) {
                warn!(sender = %msg.sender, "signature verification failed");
                return ReceivedContent::Untrusted;
            }
        }

        ReceivedContent::Plaintext(text)
    }

    fn handle_contact_status(&mut self, address: &str, msg: ProtocolMessage) {
        let Some(they_have_us) = msg.status_flag() else {
            debug!(sender = %msg.sender, "contact status with no flag dropped");
            return;
        };
        let peer = msg.sender.clone();
        let now = Instant::now();

        let we_have_them = self
            .contacts
            .lookup(&peer)
            .map(|r| r.is_contact)
            .unwrap_or(false);
        self.sync.set_local_truth(&peer, we_have_them, now);

        match self.sync.on_status_received(&peer, they_have_us, now) {
            SyncEffect::Converged(Convergence::Mutual) => {
                // ECDH-ensure runs exactly once; the completion latch in the
                // sync machine guards re-entry
                if let Some(secret) = self.crypto.compute_shared_secret(&peer) {
                    self.contacts.cache_shared_secret(&peer, &secret);
                }
                self.contacts.upgrade_tier(&peer, SecurityTier::High);
                self.peripheral.identity.mutual_contact = true;
                self.emit(EngineEvent::ContactStatusChanged {
                    peer: peer.clone(),
                    mutual: true,
                });
            }
            SyncEffect::Converged(Convergence::NoRelationship) => {
                self.emit(EngineEvent::ContactStatusChanged {
                    peer: peer.clone(),
                    mutual: false,
                });
            }
            SyncEffect::MutualConsentRequired => {
                self.emit(EngineEvent::MutualConsentRequired { peer: peer.clone() });
            }
            SyncEffect::Waiting | SyncEffect::Ignored(_) => {}
        }

        // Answer with our own status when gating allows it
        if let Some(value) = self.sync.should_send(&peer, now) {
            self.sync.record_sent(&peer, value);
            self.send_status_value(&peer, address, value);
        }
    }

    fn send_contact_status(&mut self, peer: &str, address: &str) {
        let we_have_them = self
            .contacts
            .lookup(peer)
            .map(|r| r.is_contact)
            .unwrap_or(false);
        self.sync
            .set_local_truth(peer, we_have_them, Instant::now());
        self.sync.record_sent(peer, we_have_them);
        self.send_status_value(peer, address, we_have_them);
    }

    fn send_status_value(&mut self, peer: &str, address: &str, value: bool) {
        let Some(link) = self.link_for(address) else {
            debug!(peer = %peer, "no link for contact status send");
            return;
        };
        let msg = ProtocolMessage::contact_status(
            uuid::Uuid::new_v4().to_string(),
            self.local.session_id.clone(),
            peer.to_string(),
            value,
            now_millis(),
        );
        let pipeline = self.pipeline.clone();
        self.spawn(async move {
            if let Err(e) = pipeline.send_protocol(&link, &msg).await {
                debug!(error = %e, "failed to send contact status");
            }
        });
    }

    // ---- responder arbitration -----------------------------------------

    fn try_responder_handshake(&mut self, schedule_fallback: bool) {
        match self
            .peripheral
            .should_start_responder(&self.registry, &self.guard)
        {
            Ok(()) => {
                // Arbitration passing implies a known central
                let Some(address) = self.peripheral.current_central.clone() else {
                    return;
                };
                self.peripheral.mark_handshake_started(&mut self.registry);
                info!(address = %address, "starting responder handshake");
                self.spawn_handshake(address, HandshakeRole::Responder, LinkRole::Server);
            }
            Err(veto) => {
                trace!(?veto, "responder handshake vetoed");
                if !schedule_fallback {
                    return;
                }
                // Readiness notifications can be slow or dropped; bridge the
                // subscribe/MTU/first-write races with one re-evaluation
                let Some(address) = self.peripheral.current_central.clone() else {
                    return;
                };
                if self.pending_fallback.insert(address.clone()) {
                    let tx = self.input_tx.clone();
                    let delay = self.cfg.fallback_handshake_delay;
                    self.spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(EngineInput::FallbackArbitration { address }).await;
                    });
                }
            }
        }
    }

    fn spawn_handshake(&mut self, address: String, role: HandshakeRole, link_role: LinkRole) {
        if link_role == LinkRole::Client {
            self.central.mark_handshaking(&address, &mut self.registry);
        }
        let handshake = self.handshake.clone();
        let tx = self.input_tx.clone();
        self.spawn(async move {
            let success = handshake.begin(&address, role).await.is_ok();
            let _ = tx
                .send(EngineInput::HandshakeFinished {
                    address,
                    link_role,
                    success,
                })
                .await;
        });
    }

    fn handle_handshake_finished(&mut self, address: String, link_role: LinkRole, success: bool) {
        let now = Instant::now();
        if !success {
            warn!(address = %address, ?link_role, "handshake failed");
            match link_role {
                LinkRole::Server => {
                    self.peripheral.handshake_started = false;
                    self.peripheral.state = LinkState::Connected;
                    if let Some(link) = self.registry.get_mut(&address, LinkRole::Server) {
                        link.state = LinkState::Connected;
                    }
                }
                LinkRole::Client => {
                    self.central.on_disconnected(&address, &mut self.registry);
                }
            }
            return;
        }

        match link_role {
            LinkRole::Server => self.peripheral.mark_ready(&mut self.registry),
            LinkRole::Client => self.central.mark_ready(&address, &mut self.registry),
        }
        self.monitor.start(now);
        self.next_health_at = now + self.monitor.current_interval();

        let peer_name = self.peripheral.identity.peer_display_name.clone();
        self.info.apply(|i| {
            i.connected = true;
            i.ready = true;
            i.reconnecting = false;
            i.peer_name = peer_name;
            i.status = "ready".to_string();
        });
        info!(address = %address, ?link_role, "link ready");

        // Kick off the bilateral contact exchange, with its one-shot retry
        let peer = self
            .addr_peer
            .get(&address)
            .cloned()
            .unwrap_or_else(|| address.clone());
        self.send_contact_status(&peer, &address);

        let tx = self.input_tx.clone();
        let retry_peer = peer.clone();
        let retry_address = address.clone();
        self.spawn(async move {
            tokio::time::sleep(SYNC_RETRY_DELAY).await;
            let _ = tx
                .send(EngineInput::SyncRetry {
                    peer: retry_peer,
                    address: retry_address,
                })
                .await;
        });
    }

    // ---- health & reconnection -----------------------------------------

    fn health_cycle(&mut self) {
        let now = Instant::now();
        match self.monitor.state() {
            HealthState::Idle => {
                self.next_health_at =
                    now + Duration::from_millis(self.monitor.config().max_interval_ms);
            }
            HealthState::HealthChecking => {
                let flags = HealthFlags {
                    pairing_in_progress: self.pairing_in_progress,
                    handshake_in_progress: self.peripheral.handshake_started
                        || self
                            .registry
                            .iter()
                            .any(|l| l.state == LinkState::Handshaking),
                    send_in_flight: self.pipeline.in_flight(),
                    has_active_link: self.active_link().is_some(),
                };
                if let Some(reason) = self.monitor.should_skip(&flags, now) {
                    trace!(?reason, "health check skipped");
                    self.next_health_at = now + self.monitor.current_interval();
                    return;
                }

                let Some(link) = self.active_link() else {
                    self.next_health_at = now + self.monitor.current_interval();
                    return;
                };
                let transport = self.transport.clone();
                let timeout = self.monitor.config().ping_timeout;
                let tx = self.input_tx.clone();
                self.spawn(async move {
                    let ping = [crate::codec::PING_BYTE];
                    let write = async {
                        match link.role {
                            LinkRole::Client => {
                                transport
                                    .write(&link.address, &link.characteristic, &ping)
                                    .await
                            }
                            LinkRole::Server => {
                                transport
                                    .notify(&link.address, &link.characteristic, &ping)
                                    .await
                            }
                        }
                    };
                    let success = tokio::time::timeout(timeout, write)
                        .await
                        .map(|r| r.is_ok())
                        .unwrap_or(false);
                    let _ = tx
                        .send(EngineInput::PingResult {
                            address: link.address,
                            success,
                        })
                        .await;
                });
                // Next cycle is scheduled when the result arrives; park the
                // timer far enough out to avoid double-pinging
                self.next_health_at = now + self.monitor.config().ping_timeout * 2;
            }
            HealthState::Reconnecting => {
                let target = self
                    .monitor
                    .remembered_device()
                    .map(str::to_string)
                    .or_else(|| self.central.last_connected_device.clone());
                match target {
                    Some(address) => self.attempt_reconnect(address),
                    None => {
                        self.monitor.stop();
                        self.info.apply(|i| i.reconnecting = false);
                    }
                }
                self.next_health_at = now + self.monitor.current_interval();
            }
        }
    }

    fn handle_ping_result(&mut self, address: String, success: bool) {
        let now = Instant::now();
        if success {
            self.monitor.record_check_success();
            if let Some(link) = self.registry.get_mut(&address, LinkRole::Client) {
                link.touch(now);
            }
            self.monitor.after_cycle();
            self.next_health_at = now + self.monitor.current_interval();
            return;
        }

        let sole = self.topology.is_sole_relay_path(&address);
        match self.monitor.record_check_failure(sole) {
            FailureAction::KeepSoleRelayPath => {
                self.monitor.after_cycle();
                self.next_health_at = now + self.monitor.current_interval();
            }
            FailureAction::TearDownAndReconnect => {
                self.on_peer_gone(&address);
                self.central.on_disconnected(&address, &mut self.registry);
                if self.peripheral.current_central.as_deref() == Some(address.as_str()) {
                    self.peripheral
                        .on_central_disconnected(&address, &mut self.registry);
                }
                self.info.apply(|i| {
                    i.connected = false;
                    i.ready = false;
                    i.reconnecting = true;
                    i.status = "reconnecting".to_string();
                });
                self.next_health_at = now + self.monitor.current_interval();
            }
        }
    }

    fn attempt_reconnect(&mut self, address: String) {
        let veto = HealthMonitor::reconnect_veto(
            self.registry.client_link_engaged(&address),
            self.guard.is_resolving(&address),
            self.guard.is_teardown_deferred(&address),
        );
        if let Some(veto) = veto {
            debug!(?veto, address = %address, "reconnect attempt deferred");
            return;
        }

        let transport = self.transport.clone();
        let timeout = self.monitor.config().ping_timeout;
        let tx = self.input_tx.clone();
        self.spawn(async move {
            let success = tokio::time::timeout(timeout, transport.connect(&address))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            let _ = tx
                .send(EngineInput::ReconnectResult { address, success })
                .await;
        });
    }

    fn handle_reconnect_result(&mut self, address: String, success: bool) {
        let now = Instant::now();
        match self.monitor.record_reconnect_result(success, now) {
            MonitorStatus::Stopped => {
                self.info.apply(|i| {
                    i.reconnecting = false;
                    i.status = "reconnect attempts exhausted".to_string();
                });
            }
            MonitorStatus::Running if success => {
                self.central.begin_connect(&address, &mut self.registry, now);
                self.central.on_connected(&address, &mut self.registry, now);
                self.info.apply(|i| {
                    i.connected = true;
                    i.reconnecting = false;
                    i.status = "reconnected".to_string();
                });
                self.spawn_handshake(address, HandshakeRole::Initiator, LinkRole::Client);
                self.next_health_at = now + self.monitor.current_interval();
            }
            MonitorStatus::Running => {
                self.monitor.after_cycle();
                self.next_health_at = now + self.monitor.current_interval();
            }
        }
    }

    // ---- sends ---------------------------------------------------------

    fn handle_send_text(
        &mut self,
        contact_key: String,
        text: String,
        reply: oneshot::Sender<Result<SendOutcome, SendError>>,
    ) {
        let Some(link) = self.active_link() else {
            let _ = reply.send(Err(SendError::NoLink));
            return;
        };
        let pipeline = self.pipeline.clone();
        let local = self.local.clone();
        let events_tx = self.events_tx.clone();
        self.spawn(async move {
            let result = pipeline
                .send_text(&link, &local, &contact_key, &text)
                .await;
            if let Ok(outcome) = &result {
                let _ = events_tx.send(EngineEvent::MessageSent {
                    message_id: outcome.message_id.clone(),
                    delivered: outcome.delivered,
                });
            }
            let _ = reply.send(result);
        });
    }

    // ---- link selection ------------------------------------------------

    /// The link sends and pings go through: the freshest ready client link,
    /// else the peripheral's active central.
    fn active_link(&self) -> Option<LinkSnapshot> {
        let client = self
            .registry
            .iter()
            .filter(|l| {
                l.role == LinkRole::Client
                    && l.state == LinkState::Ready
                    && l.characteristic.is_some()
            })
            .max_by_key(|l| l.last_activity);
        if let Some(link) = client {
            return Some(LinkSnapshot {
                address: link.address.clone(),
                characteristic: link.characteristic.clone().unwrap_or_default(),
                mtu: link.mtu,
                role: LinkRole::Client,
            });
        }

        if self.peripheral.state == LinkState::Ready {
            let address = self.peripheral.current_central.clone()?;
            let characteristic = self.peripheral.characteristic.clone()?;
            return Some(LinkSnapshot {
                address,
                characteristic,
                mtu: self.peripheral.mtu,
                role: LinkRole::Server,
            });
        }
        None
    }

    /// Snapshot of whichever usable link reaches `address`
    fn link_for(&self, address: &str) -> Option<LinkSnapshot> {
        if let Some(link) = self.registry.get(address, LinkRole::Client) {
            if link.state.is_active() {
                if let Some(characteristic) = &link.characteristic {
                    return Some(LinkSnapshot {
                        address: link.address.clone(),
                        characteristic: characteristic.clone(),
                        mtu: link.mtu,
                        role: LinkRole::Client,
                    });
                }
            }
        }
        if self.peripheral.current_central.as_deref() == Some(address) {
            if let Some(characteristic) = &self.peripheral.characteristic {
                return Some(LinkSnapshot {
                    address: address.to_string(),
                    characteristic: characteristic.clone(),
                    mtu: self.peripheral.mtu,
                    role: LinkRole::Server,
                });
            }
        }
        None
    }
}

pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
