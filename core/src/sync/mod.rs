//! Bilateral contact/security synchronization

pub mod contact_sync;

pub use contact_sync::{
    ContactSyncMachine, Convergence, IgnoreReason, SyncEffect, STATUS_COOLDOWN, SYNC_RETRY_DELAY,
};
