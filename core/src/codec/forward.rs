/// Relay forwarding — TTL accounting and the retransmission dedup window
///
/// A fragment addressed to someone else is forwarded at most once per
/// `(fragmentId, index)` within the fragment timeout, with its TTL spent by
/// one hop. TTL <= 1 is absorbed; that bounds relay depth and stops
/// forwarding storms on redundant links.

use std::collections::HashMap;
use std::time::Instant;

use super::envelope::FragmentEnvelope;
use super::FRAGMENT_TIMEOUT;

/// Why a fragment was absorbed instead of forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsorbReason {
    /// Hop budget exhausted
    TtlExhausted,
    /// Same (fragment, index) already forwarded inside the dedup window
    DuplicateWindow,
    /// Fragment would not re-encode (oversized recipient etc.)
    EncodeFailed,
}

/// Outcome of the relay decision for one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardDecision {
    /// Retransmit these bytes (TTL already spent)
    Relay {
        bytes: Vec<u8>,
        fragment_id: String,
        index: u16,
        ttl: u8,
    },
    /// Do not retransmit
    Absorb(AbsorbReason),
}

/// Dedup window keyed by (fragment id, index)
pub struct ForwardCache {
    seen: HashMap<([u8; 8], u16), Instant>,
}

impl ForwardCache {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }

    /// Decide whether to forward a fragment not addressed to us.
    pub fn decide(&mut self, env: &FragmentEnvelope, now: Instant) -> ForwardDecision {
        if env.ttl <= 1 {
            return ForwardDecision::Absorb(AbsorbReason::TtlExhausted);
        }

        let key = (env.fragment_id, env.index);
        if let Some(first_seen) = self.seen.get(&key) {
            if now.duration_since(*first_seen) < FRAGMENT_TIMEOUT {
                return ForwardDecision::Absorb(AbsorbReason::DuplicateWindow);
            }
        }

        let forwarded = env.decremented();
        let bytes = match forwarded.to_bytes() {
            Ok(bytes) => bytes,
            Err(_) => return ForwardDecision::Absorb(AbsorbReason::EncodeFailed),
        };

        self.seen.insert(key, now);
        ForwardDecision::Relay {
            bytes,
            fragment_id: env.id_hex(),
            index: env.index,
            ttl: forwarded.ttl,
        }
    }

    /// Evict dedup entries older than the fragment timeout
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, at| now.duration_since(*at) < FRAGMENT_TIMEOUT);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ForwardCache {
    fn default() -> Self {
        Self::new()
    }
}
