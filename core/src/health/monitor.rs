/// Health monitor — adaptive-interval liveness checks and reconnection
///
/// Three regimes: `Idle` (not running), `HealthChecking` (link believed
/// healthy, interval stretching toward the max), `Reconnecting` (link lost,
/// interval snapped back to the minimum). The monitor never races the
/// connection machine: checks are skipped around handshakes and sends, and
/// reconnect attempts yield to a live client link, collision resolution, or
/// deferred teardown.
///
/// The monitor is sans-IO: the engine drives it and performs the actual
/// ping write and reconnect call.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Tunables for the health monitor
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval floor (and the reconnecting-regime interval)
    pub min_interval_ms: u64,
    /// Interval ceiling
    pub max_interval_ms: u64,
    /// Bound on the 1-byte ping write
    pub ping_timeout: Duration,
    /// Post-connect/post-handshake window during which checks are skipped
    pub grace: Duration,
    /// Radio settle delay before the power-on reconnect attempt
    pub settle: Duration,
    /// Reconnect attempts before the monitor gives up permanently
    pub max_reconnect_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1000,
            max_interval_ms: 30_000,
            ping_timeout: Duration::from_secs(5),
            grace: Duration::from_secs(10),
            settle: Duration::from_millis(800),
            max_reconnect_attempts: 5,
        }
    }
}

/// Monitor regime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Idle,
    HealthChecking,
    Reconnecting,
}

/// Why a health check was skipped this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    PairingInProgress,
    HandshakeInProgress,
    SendInFlight,
    NoActiveLink,
    GraceWindow,
}

/// Snapshot of engine state the skip decision needs
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthFlags {
    pub pairing_in_progress: bool,
    pub handshake_in_progress: bool,
    pub send_in_flight: bool,
    pub has_active_link: bool,
}

/// What to do about a failed check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Disconnect the link, clear connection state, enter Reconnecting
    TearDownAndReconnect,
    /// The link is the mesh's only viable relay path: keep it despite the
    /// failed ping, stay in HealthChecking
    KeepSoleRelayPath,
}

/// Why a reconnect attempt was deferred this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectVeto {
    ClientRoleEngaged,
    CollisionInProgress,
    TeardownDeferred,
}

/// Whether the monitor keeps running after a result is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    Running,
    /// Attempt budget exhausted; requires external re-trigger
    Stopped,
}

/// The health monitor state machine
pub struct HealthMonitor {
    cfg: HealthConfig,
    state: HealthState,
    interval_ms: u64,
    reconnect_attempts: u32,
    grace_until: Option<Instant>,
    /// Remembered across radio power cycles
    last_connected_device: Option<String>,
    reconnecting_flag: bool,
}

impl HealthMonitor {
    pub fn new(cfg: HealthConfig) -> Self {
        let interval_ms = cfg.min_interval_ms;
        Self {
            cfg,
            state: HealthState::Idle,
            interval_ms,
            reconnect_attempts: 0,
            grace_until: None,
            last_connected_device: None,
            reconnecting_flag: false,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn config(&self) -> &HealthConfig {
        &self.cfg
    }

    /// The reconnecting flag surfaced into ConnectionInfo
    pub fn reconnecting(&self) -> bool {
        self.reconnecting_flag
    }

    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Start (or restart) monitoring a link
    pub fn start(&mut self, now: Instant) {
        self.state = HealthState::HealthChecking;
        self.interval_ms = self.cfg.min_interval_ms;
        self.reconnect_attempts = 0;
        self.reconnecting_flag = false;
        self.note_grace(now);
        info!("health monitor started");
    }

    pub fn stop(&mut self) {
        self.state = HealthState::Idle;
        info!("health monitor stopped");
    }

    /// Open the post-connect/post-handshake grace window
    pub fn note_grace(&mut self, now: Instant) {
        self.grace_until = Some(now + self.cfg.grace);
    }

    /// Grow the interval by x1.2 (integer arithmetic), clamped
    pub fn after_cycle(&mut self) -> u64 {
        self.interval_ms = (self.interval_ms * 12 / 10)
            .clamp(self.cfg.min_interval_ms, self.cfg.max_interval_ms);
        self.interval_ms
    }

    fn reset_interval(&mut self) {
        self.interval_ms = self.cfg.min_interval_ms;
    }

    /// Whether this cycle's check should be skipped, and why
    pub fn should_skip(&self, flags: &HealthFlags, now: Instant) -> Option<SkipReason> {
        if flags.pairing_in_progress {
            return Some(SkipReason::PairingInProgress);
        }
        if flags.handshake_in_progress {
            return Some(SkipReason::HandshakeInProgress);
        }
        if flags.send_in_flight {
            return Some(SkipReason::SendInFlight);
        }
        if !flags.has_active_link {
            return Some(SkipReason::NoActiveLink);
        }
        if let Some(until) = self.grace_until {
            if now < until {
                return Some(SkipReason::GraceWindow);
            }
        }
        None
    }

    /// Ping succeeded: stay in HealthChecking, interval keeps stretching
    pub fn record_check_success(&mut self) {
        self.state = HealthState::HealthChecking;
        debug!(interval_ms = self.interval_ms, "health check ok");
    }

    /// Ping failed. Unless the link is the mesh's only relay path, the
    /// engine must disconnect it and start reconnecting at the minimum
    /// interval. The monitor itself keeps running either way.
    pub fn record_check_failure(&mut self, sole_relay_path: bool) -> FailureAction {
        if sole_relay_path {
            warn!("health check failed but link is the only relay path; keeping it");
            self.state = HealthState::HealthChecking;
            return FailureAction::KeepSoleRelayPath;
        }

        warn!("health check failed; entering reconnect");
        self.state = HealthState::Reconnecting;
        self.reconnecting_flag = true;
        self.reset_interval();
        FailureAction::TearDownAndReconnect
    }

    /// Guard a reconnect attempt against the connection machine
    pub fn reconnect_veto(
        client_link_engaged: bool,
        collision_in_progress: bool,
        teardown_deferred: bool,
    ) -> Option<ReconnectVeto> {
        if client_link_engaged {
            return Some(ReconnectVeto::ClientRoleEngaged);
        }
        if collision_in_progress {
            return Some(ReconnectVeto::CollisionInProgress);
        }
        if teardown_deferred {
            return Some(ReconnectVeto::TeardownDeferred);
        }
        None
    }

    /// Record a reconnect attempt's outcome
    pub fn record_reconnect_result(&mut self, success: bool, now: Instant) -> MonitorStatus {
        if success {
            info!("reconnected");
            self.state = HealthState::HealthChecking;
            self.reconnecting_flag = false;
            self.reconnect_attempts = 0;
            self.reset_interval();
            self.note_grace(now);
            return MonitorStatus::Running;
        }

        self.reconnect_attempts += 1;
        if self.reconnect_attempts >= self.cfg.max_reconnect_attempts {
            warn!(
                attempts = self.reconnect_attempts,
                "reconnect budget exhausted; monitor stopping"
            );
            self.state = HealthState::Idle;
            self.reconnecting_flag = false;
            return MonitorStatus::Stopped;
        }
        debug!(attempt = self.reconnect_attempts, "reconnect attempt failed");
        MonitorStatus::Running
    }

    /// Radio came back. With a remembered device and no active link,
    /// schedule an immediate reconnect attempt after the settle delay.
    pub fn on_radio_powered_on(&mut self, has_active_link: bool) -> Option<(String, Duration)> {
        if has_active_link {
            return None;
        }
        let device = self.last_connected_device.clone()?;
        info!(device = %device, "radio powered on; scheduling reconnect");
        self.state = HealthState::Reconnecting;
        self.reconnecting_flag = true;
        self.reset_interval();
        Some((device, self.cfg.settle))
    }

    /// Radio went away. Remember the connected device and keep running so
    /// monitoring resumes when power returns.
    pub fn on_radio_powered_off(&mut self, connected_device: Option<String>) {
        if let Some(device) = connected_device {
            self.last_connected_device = Some(device);
        }
        self.reconnecting_flag = false;
        debug!(remembered = ?self.last_connected_device, "radio powered off");
    }

    pub fn remembered_device(&self) -> Option<&str> {
        self.last_connected_device.as_deref()
    }
}
