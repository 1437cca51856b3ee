/// Reassembly buffers — collecting fragments back into payloads
///
/// One store per engine, keyed by fragment/message id. Completion fires
/// exactly once, when every index 0..total-1 is present; completed payloads
/// sit in a side table until the caller claims them (`take` semantics).
/// Everything ages out after `FRAGMENT_TIMEOUT`.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use tracing::debug;

use super::chunk::ChunkMessage;
use super::envelope::FragmentEnvelope;
use super::FRAGMENT_TIMEOUT;

/// A fully reassembled payload plus the metadata needed to dispatch it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPayload {
    /// Fragment/message id this payload was assembled under
    pub id: String,
    /// Reassembled bytes, concatenated in index order
    pub bytes: Vec<u8>,
    /// Original payload type (see `codec::payload_type`); chunk-path
    /// payloads report TEXT or BINARY from the isBinary flag
    pub original_type: u8,
    /// Recipient the fragments were addressed to, if any
    pub recipient: Option<String>,
    /// Minimum TTL observed across the fragments
    pub ttl: u8,
    /// When the final fragment arrived
    pub received_at: Instant,
}

/// Result of feeding one fragment into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Accepted; message still incomplete
    Buffered,
    /// Accepted and this fragment completed the message
    Completed,
    /// This (id, index) was already buffered — dropped idempotently
    DuplicateIndex,
    /// The id already completed — dropped idempotently
    AlreadyCompleted,
    /// Fragment disagrees with the buffer's declared total — dropped
    TotalMismatch,
}

struct ReassemblyBuffer {
    parts: BTreeMap<u16, Vec<u8>>,
    total: u16,
    min_ttl: u8,
    recipient: Option<String>,
    original_type: u8,
    started_at: Instant,
}

impl ReassemblyBuffer {
    fn new(total: u16, ttl: u8, recipient: Option<String>, original_type: u8, now: Instant) -> Self {
        Self {
            parts: BTreeMap::new(),
            total,
            min_ttl: ttl,
            recipient,
            original_type,
            started_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.parts.len() == self.total as usize
    }

    fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in self.parts.values() {
            out.extend_from_slice(part);
        }
        out
    }
}

/// Keyed reassembly store with one-shot completed-payload retrieval
pub struct ReassemblyStore {
    buffers: HashMap<String, ReassemblyBuffer>,
    completed: HashMap<String, CompletedPayload>,
    /// Ids completed and already claimed; late duplicates of these are
    /// dropped without rebuilding a buffer
    claimed: HashMap<String, Instant>,
}

impl ReassemblyStore {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            completed: HashMap::new(),
            claimed: HashMap::new(),
        }
    }

    /// Feed a binary fragment
    pub fn insert_envelope(&mut self, env: &FragmentEnvelope, now: Instant) -> InsertOutcome {
        self.insert(
            env.id_hex(),
            env.index,
            env.total,
            env.ttl,
            env.recipient.clone(),
            env.original_type,
            env.data.clone(),
            now,
        )
    }

    /// Feed a legacy text chunk
    pub fn insert_chunk(&mut self, chunk: &ChunkMessage, now: Instant) -> InsertOutcome {
        let original_type = if chunk.is_binary {
            super::payload_type::BINARY
        } else {
            super::payload_type::TEXT
        };
        self.insert(
            chunk.message_id.clone(),
            chunk.index,
            chunk.total,
            // Chunks do not relay; TTL is not meaningful on this path
            1,
            None,
            original_type,
            chunk.content.clone().into_bytes(),
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &mut self,
        id: String,
        index: u16,
        total: u16,
        ttl: u8,
        recipient: Option<String>,
        original_type: u8,
        data: Vec<u8>,
        now: Instant,
    ) -> InsertOutcome {
        if self.completed.contains_key(&id) || self.claimed.contains_key(&id) {
            debug!(id = %id, index, "fragment for already-completed id ignored");
            return InsertOutcome::AlreadyCompleted;
        }

        let buffer = self
            .buffers
            .entry(id.clone())
            .or_insert_with(|| ReassemblyBuffer::new(total, ttl, recipient, original_type, now));

        if buffer.total != total {
            debug!(id = %id, declared = buffer.total, got = total, "fragment total mismatch");
            return InsertOutcome::TotalMismatch;
        }
        if buffer.parts.contains_key(&index) {
            debug!(id = %id, index, "duplicate fragment index ignored");
            return InsertOutcome::DuplicateIndex;
        }

        buffer.min_ttl = buffer.min_ttl.min(ttl);
        buffer.parts.insert(index, data);

        if !buffer.is_complete() {
            return InsertOutcome::Buffered;
        }

        match self.buffers.remove(&id) {
            Some(buffer) => {
                let payload = CompletedPayload {
                    id: id.clone(),
                    bytes: buffer.assemble(),
                    original_type: buffer.original_type,
                    recipient: buffer.recipient,
                    ttl: buffer.min_ttl,
                    received_at: now,
                };
                self.completed.insert(id, payload);
                InsertOutcome::Completed
            }
            None => InsertOutcome::Buffered,
        }
    }

    /// Claim a completed payload. One-time consumption: a second take for
    /// the same id returns None.
    pub fn take_completed(&mut self, id: &str) -> Option<CompletedPayload> {
        let payload = self.completed.remove(id)?;
        self.claimed.insert(id.to_string(), payload.received_at);
        Some(payload)
    }

    /// Number of in-flight (incomplete) buffers
    pub fn pending_count(&self) -> usize {
        self.buffers.len()
    }

    /// Evict everything older than the fragment timeout
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before =
            self.buffers.len() + self.completed.len() + self.claimed.len();

        self.buffers
            .retain(|_, b| now.duration_since(b.started_at) < FRAGMENT_TIMEOUT);
        self.completed
            .retain(|_, p| now.duration_since(p.received_at) < FRAGMENT_TIMEOUT);
        self.claimed
            .retain(|_, at| now.duration_since(*at) < FRAGMENT_TIMEOUT);

        before - (self.buffers.len() + self.completed.len() + self.claimed.len())
    }
}

impl Default for ReassemblyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload_type;
    use std::time::Duration;

    fn make_envelope(id: u8, index: u16, total: u16, ttl: u8, data: &[u8]) -> FragmentEnvelope {
        FragmentEnvelope::new(
            [id; 8],
            index,
            total,
            ttl,
            payload_type::TEXT,
            None,
            data.to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn test_single_fragment_completes_immediately() {
        let mut store = ReassemblyStore::new();
        let now = Instant::now();

        let env = make_envelope(1, 0, 1, 3, b"whole message");
        assert_eq!(store.insert_envelope(&env, now), InsertOutcome::Completed);

        let payload = store.take_completed(&env.id_hex()).unwrap();
        assert_eq!(payload.bytes, b"whole message");
        assert_eq!(payload.ttl, 3);
    }

    #[test]
    fn test_completion_blocked_by_any_missing_index() {
        let mut store = ReassemblyStore::new();
        let now = Instant::now();

        assert_eq!(
            store.insert_envelope(&make_envelope(1, 0, 3, 5, b"a"), now),
            InsertOutcome::Buffered
        );
        assert_eq!(
            store.insert_envelope(&make_envelope(1, 2, 3, 5, b"c"), now),
            InsertOutcome::Buffered
        );
        assert!(store.take_completed(&hex::encode([1u8; 8])).is_none());

        assert_eq!(
            store.insert_envelope(&make_envelope(1, 1, 3, 5, b"b"), now),
            InsertOutcome::Completed
        );
        let payload = store.take_completed(&hex::encode([1u8; 8])).unwrap();
        assert_eq!(payload.bytes, b"abc");
    }

    #[test]
    fn test_out_of_order_with_duplicates_completes_once() {
        // Five parts arriving shuffled with one duplicate; the last
        // missing index is what finally completes the message.
        let mut store = ReassemblyStore::new();
        let now = Instant::now();
        let parts: &[&[u8]] = &[b"one ", b"two ", b"three ", b"four ", b"five"];

        let feed = [0u16, 2, 2, 1, 3];
        let mut completions = 0;
        for &i in &feed {
            let outcome = store.insert_envelope(&make_envelope(9, i, 5, 5, parts[i as usize]), now);
            if outcome == InsertOutcome::Completed {
                completions += 1;
            }
        }
        assert_eq!(completions, 0);

        let outcome = store.insert_envelope(&make_envelope(9, 4, 5, 5, parts[4]), now);
        assert_eq!(outcome, InsertOutcome::Completed);

        let payload = store.take_completed(&hex::encode([9u8; 8])).unwrap();
        assert_eq!(payload.bytes, b"one two three four five");
    }

    #[test]
    fn test_duplicate_index_is_idempotent() {
        let mut store = ReassemblyStore::new();
        let now = Instant::now();

        store.insert_envelope(&make_envelope(1, 0, 2, 5, b"a"), now);
        assert_eq!(
            store.insert_envelope(&make_envelope(1, 0, 2, 5, b"a"), now),
            InsertOutcome::DuplicateIndex
        );
    }

    #[test]
    fn test_fragments_after_completion_are_ignored() {
        let mut store = ReassemblyStore::new();
        let now = Instant::now();

        store.insert_envelope(&make_envelope(1, 0, 1, 5, b"done"), now);
        assert_eq!(
            store.insert_envelope(&make_envelope(1, 0, 1, 5, b"done"), now),
            InsertOutcome::AlreadyCompleted
        );

        // Still ignored after the payload is claimed
        store.take_completed(&hex::encode([1u8; 8]));
        assert_eq!(
            store.insert_envelope(&make_envelope(1, 0, 1, 5, b"done"), now),
            InsertOutcome::AlreadyCompleted
        );
    }

    #[test]
    fn test_take_is_one_shot() {
        let mut store = ReassemblyStore::new();
        let now = Instant::now();

        let env = make_envelope(1, 0, 1, 5, b"x");
        store.insert_envelope(&env, now);

        assert!(store.take_completed(&env.id_hex()).is_some());
        assert!(store.take_completed(&env.id_hex()).is_none());
    }

    #[test]
    fn test_min_ttl_tracked_across_fragments() {
        let mut store = ReassemblyStore::new();
        let now = Instant::now();

        store.insert_envelope(&make_envelope(1, 0, 2, 6, b"a"), now);
        store.insert_envelope(&make_envelope(1, 1, 2, 2, b"b"), now);

        let payload = store.take_completed(&hex::encode([1u8; 8])).unwrap();
        assert_eq!(payload.ttl, 2);
    }

    #[test]
    fn test_total_mismatch_dropped() {
        let mut store = ReassemblyStore::new();
        let now = Instant::now();

        store.insert_envelope(&make_envelope(1, 0, 3, 5, b"a"), now);
        assert_eq!(
            store.insert_envelope(&make_envelope(1, 1, 4, 5, b"b"), now),
            InsertOutcome::TotalMismatch
        );
    }

    #[test]
    fn test_chunk_path() {
        let mut store = ReassemblyStore::new();
        let now = Instant::now();

        let c0 = ChunkMessage::new("m1", 0, 2, false, "hello ").unwrap();
        let c1 = ChunkMessage::new("m1", 1, 2, false, "world").unwrap();

        assert_eq!(store.insert_chunk(&c1, now), InsertOutcome::Buffered);
        assert_eq!(store.insert_chunk(&c0, now), InsertOutcome::Completed);

        let payload = store.take_completed("m1").unwrap();
        assert_eq!(payload.bytes, b"hello world");
        assert_eq!(payload.original_type, payload_type::TEXT);
    }

    #[test]
    fn test_sweep_evicts_stale_buffers() {
        let mut store = ReassemblyStore::new();
        let start = Instant::now();

        store.insert_envelope(&make_envelope(1, 0, 2, 5, b"a"), start);
        assert_eq!(store.pending_count(), 1);

        let later = start + FRAGMENT_TIMEOUT + Duration::from_secs(1);
        let evicted = store.sweep(later);
        assert_eq!(evicted, 1);
        assert_eq!(store.pending_count(), 0);

        // A late fragment for the evicted id starts a fresh buffer
        assert_eq!(
            store.insert_envelope(&make_envelope(1, 0, 2, 5, b"a"), later),
            InsertOutcome::Buffered
        );
    }

    #[test]
    fn test_sweep_evicts_unclaimed_completions() {
        let mut store = ReassemblyStore::new();
        let start = Instant::now();

        let env = make_envelope(2, 0, 1, 5, b"x");
        store.insert_envelope(&env, start);

        let later = start + FRAGMENT_TIMEOUT + Duration::from_secs(1);
        store.sweep(later);
        assert!(store.take_completed(&env.id_hex()).is_none());
    }
}
