/// ACK tracking — delivery completions keyed by message id
///
/// A message id is registered before its first byte hits the wire and is
/// resolved by whichever comes first: a protocol ACK from the network or the
/// local timeout. Both can race; resolving an already-resolved id is a
/// no-op, never an error.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// How long a registered message waits for its ACK
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal state of a tracked message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Network ACK observed
    Acked,
    /// No ACK within the timeout
    TimedOut,
    /// Engine shut down with the ACK still pending
    Cancelled,
}

impl AckOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, AckOutcome::Acked)
    }
}

/// Completion tracker for in-flight message ids
pub struct AckTracker {
    pending: Mutex<HashMap<String, oneshot::Sender<AckOutcome>>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a message id and receive its completion. Re-registering an
    /// id cancels the previous waiter.
    pub fn register(&self, message_id: &str) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        if pending.insert(message_id.to_string(), tx).is_some() {
            debug!(message_id, "re-registered in-flight message id");
        }
        rx
    }

    /// Resolve a message id. Returns false if the id was unknown or already
    /// resolved — callers must treat that as normal (ACK/timeout races).
    pub fn resolve(&self, message_id: &str, outcome: AckOutcome) -> bool {
        let sender = self.pending.lock().remove(message_id);
        match sender {
            Some(tx) => {
                // A dropped receiver just means nobody is waiting anymore
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve everything still pending with a terminal failure.
    /// Called on engine disposal so no waiter hangs forever.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (id, tx) in drained {
            debug!(message_id = %id, "pending ack cancelled");
            let _ = tx.send(AckOutcome::Cancelled);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Await a registered completion, applying the ACK timeout.
    pub async fn wait(
        &self,
        message_id: &str,
        mut rx: oneshot::Receiver<AckOutcome>,
        timeout: Duration,
    ) -> AckOutcome {
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped: tracker was re-registered or torn down
            Ok(Err(_)) => AckOutcome::Cancelled,
            Err(_) => {
                // Timeout and a late ACK can race; resolve() arbitrates.
                // Losing the race means the real outcome is already in the
                // channel.
                if self.resolve(message_id, AckOutcome::TimedOut) {
                    AckOutcome::TimedOut
                } else {
                    rx.try_recv().unwrap_or(AckOutcome::TimedOut)
                }
            }
        }
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}
