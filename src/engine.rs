//! Engine (C5): the single public surface over the keyspace, WAL, snapshot
//! store and TTL expirer. Enforces the durability ordering and the
//! compaction policy, and runs the recovery procedure on open.

use crate::compaction::{self, CompactionTimer};
use crate::config::EngineConfig;
use crate::error::{KvError, KvResult};
use crate::expirer::{ExpirerStats, TtlExpirer};
use crate::keyspace::{Entry, Keyspace};
use crate::snapshot::SnapshotStore;
use crate::wal::{Op, Wal};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Recovering,
    Running,
    Closing,
    Closed,
}

struct EngineInner {
    keyspace: Arc<Keyspace>,
    wal: Wal,
    snapshot_store: SnapshotStore,
    config: EngineConfig,
    state: RwLock<State>,
    /// Serializes the WAL-append-then-keyspace-apply pair across all
    /// mutating ops, and is held for the duration of compaction.
    write_lock: Mutex<()>,
    wal_entry_count: AtomicU64,
    expirer: Mutex<Option<TtlExpirer>>,
    compaction_timer: Mutex<Option<CompactionTimer>>,
}

/// Orchestrates the keyspace, WAL, snapshot store and TTL expirer behind a
/// single cloneable handle.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Recovers (snapshot + WAL replay) and opens the engine in `dir`,
    /// then starts the TTL sweeper and compaction timer.
    ///
    /// Fails with `RecoveryError` if the snapshot or WAL cannot be
    /// decoded; the engine must never start serving requests on top of a
    /// partially recovered keyspace.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> KvResult<Self> {
        let dir: PathBuf = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let snapshot_store = SnapshotStore::new(&dir);
        let wal = Wal::open(dir.join("kvlite.wal"), config.sync_mode)?;

        let mut map: HashMap<String, Entry> = HashMap::new();
        if let Some(snapshot) = snapshot_store
            .load()
            .map_err(|err| KvError::RecoveryError(err.to_string()))?
        {
            info!(keys = snapshot.key_count, "loaded snapshot");
            for (key, value) in snapshot.data {
                map.insert(
                    key,
                    Entry {
                        value,
                        expires_at: None,
                    },
                );
            }
        }

        let mut wal_entry_count: u64 = 0;
        wal.replay(|record| {
            wal_entry_count += 1;
            match &record.op {
                Op::Set { key, value } => {
                    map.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            expires_at: None,
                        },
                    );
                }
                Op::Delete { key } => {
                    map.remove(key);
                }
                Op::Clear => {
                    map.clear();
                }
            }
        })
        .map_err(|err| KvError::RecoveryError(err.to_string()))?;
        info!(replayed = wal_entry_count, "wal replay complete");

        let keyspace = Arc::new(Keyspace::from_map(map));

        let inner = Arc::new(EngineInner {
            keyspace: Arc::clone(&keyspace),
            wal,
            snapshot_store,
            config: config.clone(),
            state: RwLock::new(State::Recovering),
            write_lock: Mutex::new(()),
            wal_entry_count: AtomicU64::new(wal_entry_count),
            expirer: Mutex::new(None),
            compaction_timer: Mutex::new(None),
        });
        *inner.state.write() = State::Running;

        let expirer = TtlExpirer::start(Arc::clone(&keyspace), config.ttl_check_interval);
        *inner.expirer.lock() = Some(expirer);

        let weak_inner = Arc::downgrade(&inner);
        let timer = CompactionTimer::start(config.compaction_interval, move || {
            let Some(inner) = weak_inner.upgrade() else {
                return;
            };
            if Engine::should_compact(&inner) {
                if let Err(err) = Engine::run_compaction(&inner) {
                    warn!(error = %err, "background compaction failed");
                }
            }
        });
        *inner.compaction_timer.lock() = Some(timer);

        Ok(Self { inner })
    }

    fn ensure_running(&self) -> KvResult<()> {
        match *self.inner.state.read() {
            State::Running => Ok(()),
            _ => Err(KvError::ShutdownInProgress),
        }
    }

    /// Appends then applies a SET, holding the engine write lock for the
    /// whole log-then-apply pair so a reader never observes a keyspace
    /// update whose WAL record didn't make it to disk first.
    pub fn set(&self, key: String, value: String) -> KvResult<()> {
        self.ensure_running()?;
        let _guard = self.inner.write_lock.lock();
        self.inner.wal.append(&Op::Set {
            key: key.clone(),
            value: value.clone(),
        })?;
        self.inner.wal_entry_count.fetch_add(1, Ordering::SeqCst);
        self.inner.keyspace.set(key, value);
        Ok(())
    }

    /// Same as `set`, but with an expiry `ttl` seconds from now. `ttl` must
    /// be strictly positive.
    pub fn set_with_ttl(&self, key: String, value: String, ttl: Duration) -> KvResult<()> {
        if ttl.is_zero() {
            return Err(KvError::ClientError("invalid TTL".to_string()));
        }
        self.ensure_running()?;
        let _guard = self.inner.write_lock.lock();
        self.inner.wal.append(&Op::Set {
            key: key.clone(),
            value: value.clone(),
        })?;
        self.inner.wal_entry_count.fetch_add(1, Ordering::SeqCst);
        self.inner.keyspace.set_with_ttl(key, value, ttl);
        Ok(())
    }

    /// Looks up `key`, lazily expiring it if stale.
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.keyspace.get(key)
    }

    /// Deletes `key`, returning whether it existed. A no-op delete (key
    /// already absent) does not touch the WAL.
    pub fn delete(&self, key: &str) -> KvResult<bool> {
        self.ensure_running()?;
        let _guard = self.inner.write_lock.lock();
        if self.inner.keyspace.get(key).is_none() {
            return Ok(false);
        }
        self.inner.wal.append(&Op::Delete {
            key: key.to_string(),
        })?;
        self.inner.wal_entry_count.fetch_add(1, Ordering::SeqCst);
        self.inner.keyspace.delete(key);
        Ok(true)
    }

    /// Sets/replaces a TTL on an existing, non-expired key.
    pub fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        if ttl.is_zero() {
            return Err(KvError::ClientError("invalid TTL".to_string()));
        }
        Ok(self.inner.keyspace.expire(key, ttl))
    }

    pub fn persist(&self, key: &str) -> bool {
        self.inner.keyspace.persist(key)
    }

    pub fn ttl(&self, key: &str) -> i64 {
        self.inner.keyspace.ttl(key)
    }

    pub fn keys(&self, pattern: &str) -> Vec<String> {
        self.inner.keyspace.keys(pattern)
    }

    pub fn scan(&self, cursor: usize, pattern: &str, count: usize) -> (usize, Vec<String>, bool) {
        self.inner.keyspace.scan(cursor, pattern, count)
    }

    pub fn len(&self) -> usize {
        self.inner.keyspace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.keyspace.is_empty()
    }

    /// Clears the whole keyspace. Logged as a single `CLEAR` record.
    pub fn clear(&self) -> KvResult<()> {
        self.ensure_running()?;
        let _guard = self.inner.write_lock.lock();
        self.inner.wal.append(&Op::Clear)?;
        self.inner.wal_entry_count.fetch_add(1, Ordering::SeqCst);
        self.inner.keyspace.clear();
        Ok(())
    }

    /// Sets several keys atomically with respect to other writers: every
    /// pair is appended and applied while holding the engine write lock.
    pub fn mset(&self, pairs: Vec<(String, String)>) -> KvResult<()> {
        self.ensure_running()?;
        let _guard = self.inner.write_lock.lock();
        for (key, value) in pairs {
            self.inner.wal.append(&Op::Set {
                key: key.clone(),
                value: value.clone(),
            })?;
            self.inner.wal_entry_count.fetch_add(1, Ordering::SeqCst);
            self.inner.keyspace.set(key, value);
        }
        Ok(())
    }

    /// Looks up several keys; absent/expired keys are `None` at their slot.
    pub fn mget(&self, keys: &[String]) -> Vec<Option<String>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Deletes several keys, returning the count that existed.
    pub fn mdel(&self, keys: &[String]) -> KvResult<usize> {
        self.ensure_running()?;
        let _guard = self.inner.write_lock.lock();
        let mut deleted = 0;
        for key in keys {
            if self.inner.keyspace.get(key).is_none() {
                continue;
            }
            self.inner.wal.append(&Op::Delete { key: key.clone() })?;
            self.inner.wal_entry_count.fetch_add(1, Ordering::SeqCst);
            self.inner.keyspace.delete(key);
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Parses the current value as an `i64` (absent counts as `0`), adds
    /// `delta`, and stores the result. Fails if the current value is not
    /// a valid integer.
    pub fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        self.ensure_running()?;
        let _guard = self.inner.write_lock.lock();
        let current: i64 = match self.inner.keyspace.get(key) {
            Some(value) => value
                .parse()
                .map_err(|_| KvError::ClientError("value is not an integer".to_string()))?,
            None => 0,
        };
        let updated = current
            .checked_add(delta)
            .ok_or_else(|| KvError::ClientError("value is not an integer".to_string()))?;
        let rendered = updated.to_string();
        self.inner.wal.append(&Op::Set {
            key: key.to_string(),
            value: rendered.clone(),
        })?;
        self.inner.wal_entry_count.fetch_add(1, Ordering::SeqCst);
        self.inner.keyspace.set(key.to_string(), rendered);
        Ok(updated)
    }

    /// Appends `value` to the current string value (absent counts as
    /// empty), returning the new length.
    pub fn append(&self, key: &str, value: &str) -> KvResult<usize> {
        self.ensure_running()?;
        let _guard = self.inner.write_lock.lock();
        let mut current = self.inner.keyspace.get(key).unwrap_or_default();
        current.push_str(value);
        let new_len = current.len();
        self.inner.wal.append(&Op::Set {
            key: key.to_string(),
            value: current.clone(),
        })?;
        self.inner.wal_entry_count.fetch_add(1, Ordering::SeqCst);
        self.inner.keyspace.set(key.to_string(), current);
        Ok(new_len)
    }

    /// Byte length of the current value, or `0` if absent.
    pub fn strlen(&self, key: &str) -> usize {
        self.inner.keyspace.get(key).map(|v| v.len()).unwrap_or(0)
    }

    /// Flushes the WAL buffer and fsyncs.
    pub fn sync(&self) -> KvResult<()> {
        self.ensure_running()?;
        self.inner.wal.sync()
    }

    /// Forces a compaction cycle regardless of the current heuristic.
    pub fn compact(&self) -> KvResult<()> {
        self.ensure_running()?;
        Engine::run_compaction(&self.inner)
    }

    pub fn wal_size(&self) -> u64 {
        self.inner.wal.size().unwrap_or(0)
    }

    pub fn wal_entry_count(&self) -> u64 {
        self.inner.wal_entry_count.load(Ordering::SeqCst)
    }

    pub fn needs_compaction(&self) -> bool {
        Engine::should_compact(&self.inner)
    }

    pub fn ttl_stats(&self) -> ExpirerStats {
        self.inner
            .expirer
            .lock()
            .as_ref()
            .map(|e| e.stats())
            .unwrap_or_default()
    }

    /// Stops the background workers, flushes the WAL and rejects further
    /// operations. Idempotent.
    pub fn close(&self) -> KvResult<()> {
        {
            let mut state = self.inner.state.write();
            if *state == State::Closed {
                return Ok(());
            }
            *state = State::Closing;
        }
        if let Some(expirer) = self.inner.expirer.lock().take() {
            expirer.stop();
        }
        if let Some(timer) = self.inner.compaction_timer.lock().take() {
            timer.stop();
        }
        let sync_result = self.inner.wal.sync();
        *self.inner.state.write() = State::Closed;
        sync_result
    }

    fn should_compact(inner: &EngineInner) -> bool {
        let count = inner.wal_entry_count.load(Ordering::SeqCst);
        let size = inner.wal.size().unwrap_or(0);
        compaction::needs_compaction(
            count,
            inner.config.max_wal_entries,
            size,
            inner.config.max_wal_size,
        )
    }

    /// Holds the write lock for the whole cycle: snapshot the keyspace,
    /// write the snapshot, then truncate the WAL. If the snapshot write
    /// fails the WAL is left untouched; if the truncate fails the new
    /// snapshot is already in place and the WAL is simply re-replayed
    /// (idempotently) on the next startup.
    fn run_compaction(inner: &EngineInner) -> KvResult<()> {
        let _guard = inner.write_lock.lock();
        let mut data = HashMap::new();
        inner.keyspace.range(|k, v| {
            data.insert(k.to_string(), v.to_string());
        });
        let key_count = data.len();
        inner.snapshot_store.write(data)?;
        inner.wal.truncate()?;
        inner.wal_entry_count.store(0, Ordering::SeqCst);
        info!(keys = key_count, "compaction complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use std::thread::sleep;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new() -> Self {
            let unique = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos();
            let mut path = env::temp_dir();
            path.push(format!("kvlite-engine-test-{unique}"));
            Self { path }
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            sync_mode: true,
            max_wal_entries: 10_000,
            max_wal_size: 10 * 1024 * 1024,
            compaction_interval: Duration::from_secs(3600),
            ttl_check_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn set_get_delete_cycle() {
        let dir = TempDir::new();
        let engine = Engine::open(&dir.path, test_config()).unwrap();

        engine.set("name".into(), "Alice".into()).unwrap();
        assert_eq!(engine.get("name"), Some("Alice".into()));
        assert!(engine.delete("name").unwrap());
        assert_eq!(engine.get("name"), None);
        assert!(!engine.delete("name").unwrap());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new();
        {
            let engine = Engine::open(&dir.path, test_config()).unwrap();
            engine.set("persist".into(), "test_value".into()).unwrap();
            engine.close().unwrap();
        }
        let engine = Engine::open(&dir.path, test_config()).unwrap();
        assert_eq!(engine.get("persist"), Some("test_value".into()));
    }

    #[test]
    fn delete_is_persisted() {
        let dir = TempDir::new();
        {
            let engine = Engine::open(&dir.path, test_config()).unwrap();
            engine.set("a".into(), "1".into()).unwrap();
            engine.delete("a").unwrap();
            engine.close().unwrap();
        }
        let engine = Engine::open(&dir.path, test_config()).unwrap();
        assert_eq!(engine.get("a"), None);
    }

    #[test]
    fn clear_is_persisted() {
        let dir = TempDir::new();
        {
            let engine = Engine::open(&dir.path, test_config()).unwrap();
            engine.set("a".into(), "1".into()).unwrap();
            engine.set("b".into(), "2".into()).unwrap();
            engine.clear().unwrap();
            engine.close().unwrap();
        }
        let engine = Engine::open(&dir.path, test_config()).unwrap();
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn ttl_not_persisted_across_restart() {
        // WAL/snapshot records encode only (op, key, value), so a TTL set
        // via `set_with_ttl` does not survive a restart; the key
        // reappears persistent.
        let dir = TempDir::new();
        {
            let engine = Engine::open(&dir.path, test_config()).unwrap();
            engine
                .set_with_ttl("session".into(), "value".into(), Duration::from_secs(30))
                .unwrap();
            engine.close().unwrap();
        }
        let engine = Engine::open(&dir.path, test_config()).unwrap();
        assert_eq!(engine.get("session"), Some("value".into()));
        assert_eq!(engine.ttl("session"), crate::keyspace::TTL_NO_EXPIRY);
    }

    #[test]
    fn compact_then_reopen_preserves_state() {
        let dir = TempDir::new();
        let engine = Engine::open(&dir.path, test_config()).unwrap();
        engine.set("beta".into(), "fresh".into()).unwrap();
        engine.compact().unwrap();
        assert_eq!(engine.get("beta"), Some("fresh".into()));
        assert_eq!(engine.wal_entry_count(), 0);
        engine.close().unwrap();

        let engine = Engine::open(&dir.path, test_config()).unwrap();
        assert_eq!(engine.get("beta"), Some("fresh".into()));
    }

    #[test]
    fn closed_engine_rejects_mutating_ops() {
        let dir = TempDir::new();
        let engine = Engine::open(&dir.path, test_config()).unwrap();
        engine.close().unwrap();
        assert!(matches!(
            engine.set("a".into(), "1".into()),
            Err(KvError::ShutdownInProgress)
        ));
    }

    #[test]
    fn corrupt_wal_fails_recovery() {
        let dir = TempDir::new();
        {
            let engine = Engine::open(&dir.path, test_config()).unwrap();
            engine.set("a".into(), "1".into()).unwrap();
            engine.close().unwrap();
        }
        let wal_path = dir.path.join("kvlite.wal");
        fs::write(&wal_path, "not-a-valid-record\n").unwrap();
        let result = Engine::open(&dir.path, test_config());
        assert!(matches!(result, Err(KvError::RecoveryError(_))));
    }

    #[test]
    fn incr_decr_and_append_mutate_atomically() {
        let dir = TempDir::new();
        let engine = Engine::open(&dir.path, test_config()).unwrap();

        assert_eq!(engine.incr_by("counter", 1).unwrap(), 1);
        assert_eq!(engine.incr_by("counter", 1).unwrap(), 2);
        assert_eq!(engine.incr_by("counter", -1).unwrap(), 1);

        engine.set("greeting".into(), "hello".into()).unwrap();
        assert_eq!(engine.append("greeting", " world").unwrap(), 11);
        assert_eq!(engine.get("greeting"), Some("hello world".into()));
        assert_eq!(engine.strlen("greeting"), 11);
        assert_eq!(engine.strlen("missing"), 0);

        engine.set("name".into(), "Bob".into()).unwrap();
        assert!(matches!(
            engine.incr_by("name", 1),
            Err(KvError::ClientError(_))
        ));
    }

    #[test]
    fn mset_mget_mdel_operate_on_batches() {
        let dir = TempDir::new();
        let engine = Engine::open(&dir.path, test_config()).unwrap();
        engine
            .mset(vec![("a".into(), "1".into()), ("b".into(), "2".into())])
            .unwrap();
        assert_eq!(
            engine.mget(&["a".into(), "b".into(), "missing".into()]),
            vec![Some("1".into()), Some("2".into()), None]
        );
        assert_eq!(
            engine.mdel(&["a".into(), "missing".into()]).unwrap(),
            1
        );
        assert_eq!(engine.get("a"), None);
        assert_eq!(engine.get("b"), Some("2".into()));
    }

    #[test]
    fn ttl_expirer_reclaims_stale_keys_in_background() {
        let dir = TempDir::new();
        let engine = Engine::open(&dir.path, test_config()).unwrap();
        engine
            .set_with_ttl("temp".into(), "x".into(), Duration::from_millis(10))
            .unwrap();
        sleep(Duration::from_millis(100));
        assert_eq!(engine.len(), 0);
        assert!(engine.ttl_stats().checks_performed > 0);
    }
}
