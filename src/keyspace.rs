//! The in-memory keyspace (C1): the authoritative mapping from key to
//! (value, optional expiry), with glob matching and paginated scanning.

use crate::glob;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// One stored value plus its optional expiry deadline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub value: String,
    pub expires_at: Option<SystemTime>,
}

impl Entry {
    fn is_expired_at(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }
}

/// Sentinel TTL values returned by `Keyspace::ttl`.
pub const TTL_ABSENT: i64 = -2;
pub const TTL_NO_EXPIRY: i64 = -1;

/// Shared, concurrently-accessed key-value map.
///
/// Readers (`get`, `keys`, `scan`, `ttl`, `len`) run in parallel with each
/// other; writers are exclusive. A single `parking_lot::RwLock` gives us
/// that discipline directly — `parking_lot` locks don't poison, which
/// matters here because a panicking reader must never wedge every other
/// connection's reads.
#[derive(Default)]
pub struct Keyspace {
    map: RwLock<HashMap<String, Entry>>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds the keyspace from a previously loaded map, used during recovery.
    pub fn from_map(map: HashMap<String, Entry>) -> Self {
        Self {
            map: RwLock::new(map),
        }
    }

    /// Inserts or replaces `key`, clearing any existing TTL.
    pub fn set(&self, key: String, value: String) {
        self.map.write().insert(
            key,
            Entry {
                value,
                expires_at: None,
            },
        );
    }

    /// Inserts or replaces `key` with an expiry `ttl` seconds from now.
    ///
    /// `ttl` must be strictly positive; callers validate this before
    /// reaching the keyspace (see `Engine::set_with_ttl`).
    pub fn set_with_ttl(&self, key: String, value: String, ttl: Duration) {
        let expires_at = SystemTime::now().checked_add(ttl);
        self.map.write().insert(key, Entry { value, expires_at });
    }

    /// Returns the value for `key` if present and not expired. Lazily
    /// deletes the entry (and returns `None`) if it has expired.
    pub fn get(&self, key: &str) -> Option<String> {
        {
            let guard = self.map.read();
            match guard.get(key) {
                Some(entry) if !entry.is_expired_at(SystemTime::now()) => {
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Entry is present but expired: drop the read guard first, then
        // take the writer lock to remove it.
        self.map.write().remove(key);
        None
    }

    /// Removes `key`. Returns whether it existed (an expired key counts as absent).
    pub fn delete(&self, key: &str) -> bool {
        let mut guard = self.map.write();
        match guard.get(key) {
            Some(entry) if entry.is_expired_at(SystemTime::now()) => {
                guard.remove(key);
                false
            }
            Some(_) => {
                guard.remove(key);
                true
            }
            None => false,
        }
    }

    /// Sets (or replaces) the TTL on an existing, non-expired key. Returns
    /// whether it applied.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let mut guard = self.map.write();
        let now = SystemTime::now();
        match guard.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.expires_at = now.checked_add(ttl);
                true
            }
            Some(_) => {
                guard.remove(key);
                false
            }
            None => false,
        }
    }

    /// Removes any TTL on `key`. Returns whether the key existed.
    pub fn persist(&self, key: &str) -> bool {
        let mut guard = self.map.write();
        let now = SystemTime::now();
        match guard.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.expires_at = None;
                true
            }
            Some(_) => {
                guard.remove(key);
                false
            }
            None => false,
        }
    }

    /// Returns `-2` if absent, `-1` if present with no TTL, else the
    /// remaining seconds (>= 0).
    pub fn ttl(&self, key: &str) -> i64 {
        let guard = self.map.read();
        let now = SystemTime::now();
        match guard.get(key) {
            None => TTL_ABSENT,
            Some(entry) if entry.is_expired_at(now) => TTL_ABSENT,
            Some(Entry {
                expires_at: None, ..
            }) => TTL_NO_EXPIRY,
            Some(Entry {
                expires_at: Some(deadline),
                ..
            }) => deadline
                .duration_since(now)
                .map(|d| {
                    // Round up: a key with 400ms left should read TTL 1, not 0.
                    (d.as_nanos() + 999_999_999) / 1_000_000_000
                })
                .map(|secs| secs as i64)
                .unwrap_or(0),
        }
    }

    /// Number of non-expired entries. Scans the map; callers needing O(1)
    /// should rely on `delete_expired` being run frequently enough that
    /// this stays close to the true live count.
    pub fn len(&self) -> usize {
        let guard = self.map.read();
        let now = SystemTime::now();
        guard.values().filter(|e| !e.is_expired_at(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the keyspace.
    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// All non-expired keys matching `pattern`.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let guard = self.map.read();
        let now = SystemTime::now();
        let pattern_bytes = pattern.as_bytes();
        guard
            .iter()
            .filter(|(_, e)| !e.is_expired_at(now))
            .filter(|(k, _)| glob::matches(pattern_bytes, k.as_bytes()))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Paginated iteration over keys matching `pattern`.
    ///
    /// Each call takes a consistent read-locked snapshot, sorts the
    /// matching non-expired keys lexicographically, and slices `count` of
    /// them starting at `cursor`. This is O(n log n) per call rather than
    /// O(1) memory, but it gives the "every key present throughout is
    /// visited at least once" guarantee trivially for a static keyspace,
    /// and degrades gracefully (possible skip/duplicate, never a crash or
    /// out-of-bounds cursor) under concurrent mutation.
    pub fn scan(&self, cursor: usize, pattern: &str, count: usize) -> (usize, Vec<String>, bool) {
        let guard = self.map.read();
        let now = SystemTime::now();
        let pattern_bytes = pattern.as_bytes();
        let mut matching: Vec<&String> = guard
            .iter()
            .filter(|(_, e)| !e.is_expired_at(now))
            .filter(|(k, _)| glob::matches(pattern_bytes, k.as_bytes()))
            .map(|(k, _)| k)
            .collect();
        matching.sort();

        if cursor >= matching.len() {
            return (0, Vec::new(), false);
        }

        let end = (cursor + count.max(1)).min(matching.len());
        let batch: Vec<String> = matching[cursor..end].iter().map(|k| (*k).clone()).collect();
        let has_more = end < matching.len();
        let next_cursor = if has_more { end } else { 0 };
        (next_cursor, batch, has_more)
    }

    /// Removes every entry whose expiry has elapsed. Returns the count removed.
    pub fn delete_expired(&self) -> usize {
        let mut guard = self.map.write();
        let now = SystemTime::now();
        let expired: Vec<String> = guard
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            guard.remove(key);
        }
        expired.len()
    }

    /// Invokes `f` with every non-expired (key, value) pair, holding the
    /// read lock for the whole call so the view is consistent for its
    /// duration. Used by compaction to take a point-in-time copy.
    pub fn range<F: FnMut(&str, &str)>(&self, mut f: F) {
        let guard = self.map.read();
        let now = SystemTime::now();
        for (k, e) in guard.iter() {
            if !e.is_expired_at(now) {
                f(k, &e.value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn set_then_get() {
        let ks = Keyspace::new();
        ks.set("a".into(), "1".into());
        assert_eq!(ks.get("a"), Some("1".into()));
        assert_eq!(ks.get("missing"), None);
    }

    #[test]
    fn set_clears_ttl() {
        let ks = Keyspace::new();
        ks.set_with_ttl("a".into(), "1".into(), Duration::from_secs(10));
        ks.set("a".into(), "2".into());
        assert_eq!(ks.ttl("a"), TTL_NO_EXPIRY);
    }

    #[test]
    fn expired_key_is_lazily_removed() {
        let ks = Keyspace::new();
        ks.set_with_ttl("a".into(), "1".into(), Duration::from_millis(5));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ks.get("a"), None);
        assert_eq!(ks.ttl("a"), TTL_ABSENT);
    }

    #[test]
    fn delete_reports_existence() {
        let ks = Keyspace::new();
        assert!(!ks.delete("a"));
        ks.set("a".into(), "1".into());
        assert!(ks.delete("a"));
        assert!(!ks.delete("a"));
    }

    #[test]
    fn expire_and_persist() {
        let ks = Keyspace::new();
        assert!(!ks.expire("missing", Duration::from_secs(1)));
        ks.set("a".into(), "1".into());
        assert!(ks.expire("a", Duration::from_secs(30)));
        assert!(ks.ttl("a") > 0);
        assert!(ks.persist("a"));
        assert_eq!(ks.ttl("a"), TTL_NO_EXPIRY);
    }

    #[test]
    fn len_excludes_expired() {
        let ks = Keyspace::new();
        ks.set("a".into(), "1".into());
        ks.set_with_ttl("b".into(), "2".into(), Duration::from_millis(5));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ks.len(), 1);
    }

    #[test]
    fn keys_glob() {
        let ks = Keyspace::new();
        ks.set("user:1".into(), "a".into());
        ks.set("user:2".into(), "b".into());
        ks.set("config:x".into(), "c".into());
        let mut users = ks.keys("user:*");
        users.sort();
        assert_eq!(users, vec!["user:1".to_string(), "user:2".to_string()]);
        assert_eq!(ks.keys("config:*"), vec!["config:x".to_string()]);
    }

    #[test]
    fn scan_covers_every_key_once_when_quiescent() {
        let ks = Keyspace::new();
        for i in 0..25 {
            ks.set(format!("k{i:02}"), "v".into());
        }
        let mut seen = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, batch, has_more) = ks.scan(cursor, "*", 7);
            seen.extend(batch);
            if !has_more {
                break;
            }
            cursor = next;
        }
        seen.sort();
        let mut expected: Vec<String> = (0..25).map(|i| format!("k{i:02}")).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn scan_beyond_end_returns_empty() {
        let ks = Keyspace::new();
        ks.set("a".into(), "1".into());
        let (next, batch, has_more) = ks.scan(50, "*", 10);
        assert_eq!(next, 0);
        assert!(batch.is_empty());
        assert!(!has_more);
    }

    #[test]
    fn range_sees_consistent_non_expired_snapshot() {
        let ks = Keyspace::new();
        ks.set("a".into(), "1".into());
        ks.set_with_ttl("b".into(), "2".into(), Duration::from_millis(5));
        thread::sleep(Duration::from_millis(20));
        let mut seen = Vec::new();
        ks.range(|k, v| seen.push((k.to_string(), v.to_string())));
        assert_eq!(seen, vec![("a".to_string(), "1".to_string())]);
    }

    #[test]
    fn delete_expired_reports_count() {
        let ks = Keyspace::new();
        ks.set_with_ttl("a".into(), "1".into(), Duration::from_millis(5));
        ks.set("b".into(), "2".into());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ks.delete_expired(), 1);
        assert_eq!(ks.len(), 1);
    }
}
