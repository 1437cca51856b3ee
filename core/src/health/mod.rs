//! Connection health — adaptive ping scheduling and reconnection policy

pub mod monitor;

pub use monitor::{
    FailureAction, HealthConfig, HealthFlags, HealthMonitor, HealthState, MonitorStatus,
    ReconnectVeto, SkipReason,
};
