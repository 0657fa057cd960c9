//! TTL + size bounded cache of seen message identifiers.
//!
//! Used by the dispatch task to suppress duplicates during dual-publish
//! migrations and idempotent command retries. Single-owner: the dispatch
//! task is both producer and consumer, so no locking is involved.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// Build the cache key for one delivery.
///
/// The third component distinguishes legitimate re-publishes that reuse a
/// `message_id` (retained updates) from true duplicates: a `seq` when the
/// payload carries one, otherwise a hash of the raw payload bytes.
pub fn dedup_key(event_type: &str, message_id: &str, seq: Option<u64>, payload: &[u8]) -> String {
    match seq {
        Some(seq) => format!("{event_type}|{message_id}|{seq}"),
        None => {
            let mut hasher = DefaultHasher::new();
            payload.hash(&mut hasher);
            format!("{event_type}|{message_id}|{:016x}", hasher.finish())
        }
    }
}

/// Ordered bounded map of seen keys.
#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    max_entries: usize,
    seen: HashMap<String, Instant>,
    /// Insertion order, for FIFO eviction.
    order: VecDeque<String>,
}

impl DedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `key` as seen now. Returns `false` when the key was already
    /// present and unexpired, i.e. the delivery is a duplicate.
    pub fn insert(&mut self, key: &str) -> bool {
        self.sweep_expired();

        if let Some(at) = self.seen.get(key) {
            if at.elapsed() < self.ttl {
                return false;
            }
        }

        if self.seen.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.seen.insert(key.to_owned(), Instant::now());
        self.order.push_back(key.to_owned());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Drop expired entries from the front of the insertion order. Entries
    /// expire in insertion order, so this stops at the first live one.
    fn sweep_expired(&mut self) {
        while let Some(front) = self.order.front() {
            let expired = self
                .seen
                .get(front)
                .is_none_or(|at| at.elapsed() >= self.ttl);
            if !expired {
                break;
            }
            let key = self.order.pop_front().unwrap_or_default();
            self.seen.remove(&key);
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self.order.pop_front() {
            self.seen.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_ttl_rejected() {
        let mut cache = DedupCache::new(Duration::from_secs(30), 8);
        assert!(cache.insert("tts.say|m1|abc"));
        assert!(!cache.insert("tts.say|m1|abc"));
        assert!(cache.insert("tts.say|m2|abc"));
    }

    #[test]
    fn fifo_eviction_at_capacity() {
        let mut cache = DedupCache::new(Duration::from_secs(30), 2);
        assert!(cache.insert("a"));
        assert!(cache.insert("b"));
        assert!(cache.insert("c"));
        assert_eq!(cache.len(), 2);
        // "a" was evicted, so it reads as fresh again.
        assert!(cache.insert("a"));
    }

    #[test]
    fn expired_entry_reads_as_fresh() {
        let mut cache = DedupCache::new(Duration::ZERO, 8);
        assert!(cache.insert("x"));
        assert!(cache.insert("x"));
    }

    #[test]
    fn key_uses_seq_when_present() {
        let a = dedup_key("llm.stream", "m1", Some(4), b"ignored");
        let b = dedup_key("llm.stream", "m1", Some(5), b"ignored");
        assert_ne!(a, b);
        assert_eq!(a, "llm.stream|m1|4");
    }

    #[test]
    fn key_hashes_payload_without_seq() {
        let a = dedup_key("tts.say", "m1", None, b"one");
        let b = dedup_key("tts.say", "m1", None, b"two");
        let a2 = dedup_key("tts.say", "m1", None, b"one");
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }
}
