//! Snapshot store (C3): atomic, whole-keyspace dumps that bound WAL growth.

use crate::error::{KvError, KvResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_FILE: &str = "kvlite.snapshot";

/// Versioned, self-describing dump of the keyspace.
///
/// Entries are restored without TTL: the snapshot format persists only
/// `map<key, value>`, so a key's expiry does not survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub timestamp: u64,
    pub key_count: usize,
    pub data: HashMap<String, String>,
}

/// Metadata-only view of a snapshot, used by `info` without materializing `data`.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub version: u32,
    pub timestamp: u64,
    pub key_count: usize,
    pub size_bytes: u64,
}

/// Atomic dump/load of the keyspace to `<dir>/kvlite.snapshot`.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn canonical_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Serializes `data` to a temp file in the snapshot directory, fsyncs
    /// the temp file *and* the directory, then renames it over the
    /// canonical path. A failed rename removes the temp file so no
    /// half-written snapshot is left behind.
    pub fn write(&self, data: HashMap<String, String>) -> KvResult<()> {
        fs::create_dir_all(&self.dir).map_err(KvError::SnapshotIo)?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            timestamp,
            key_count: data.len(),
            data,
        };

        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let temp_path = self.dir.join(format!("kvlite.snapshot.tmp.{unique}"));

        let result = (|| -> KvResult<()> {
            {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&temp_path)
                    .map_err(KvError::SnapshotIo)?;
                let mut writer = std::io::BufWriter::new(file);
                serde_json::to_writer(&mut writer, &snapshot)
                    .map_err(|err| KvError::SnapshotIo(err.into()))?;
                writer.flush().map_err(KvError::SnapshotIo)?;
                writer.get_ref().sync_all().map_err(KvError::SnapshotIo)?;
            }
            fs::rename(&temp_path, self.canonical_path()).map_err(KvError::SnapshotIo)?;
            sync_dir(&self.dir).map_err(KvError::SnapshotIo)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    /// Returns `None` if no snapshot exists; otherwise decodes and returns it.
    pub fn load(&self) -> KvResult<Option<Snapshot>> {
        let path = self.canonical_path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(KvError::SnapshotIo(err)),
        };
        let reader = BufReader::new(file);
        let snapshot: Snapshot =
            serde_json::from_reader(reader).map_err(|err| KvError::SnapshotIo(err.into()))?;
        if snapshot.data.len() != snapshot.key_count {
            return Err(KvError::SnapshotIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "snapshot key_count {} does not match data length {}",
                    snapshot.key_count,
                    snapshot.data.len()
                ),
            )));
        }
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(KvError::SnapshotIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unrecognized snapshot version {}", snapshot.version),
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.canonical_path().exists()
    }

    pub fn size(&self) -> KvResult<u64> {
        match fs::metadata(self.canonical_path()) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(KvError::SnapshotIo(err)),
        }
    }

    /// Metadata-only load: still parses the whole file (a streaming
    /// decoder would avoid this for very large snapshots), but only
    /// returns the header fields.
    pub fn info(&self) -> KvResult<Option<SnapshotInfo>> {
        let size_bytes = self.size()?;
        match self.load()? {
            Some(snapshot) => Ok(Some(SnapshotInfo {
                version: snapshot.version,
                timestamp: snapshot.timestamp,
                key_count: snapshot.key_count,
                size_bytes,
            })),
            None => Ok(None),
        }
    }

    pub fn delete(&self) -> KvResult<()> {
        match fs::remove_file(self.canonical_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(KvError::SnapshotIo(err)),
        }
    }

    /// Verifies that the canonical snapshot (if any) decodes and its
    /// `key_count`/`data` invariant holds.
    pub fn verify(&self) -> KvResult<bool> {
        Ok(self.load()?.is_some() || !self.exists())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    let dir_file = File::open(dir)?;
    dir_file.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

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
            path.push(format!("kvlite-snapshot-test-{unique}"));
            fs::create_dir_all(&path).unwrap();
            Self { path }
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = TempDir::new();
        let store = SnapshotStore::new(&dir.path);
        let mut data = HashMap::new();
        data.insert("a".to_string(), "1".to_string());
        data.insert("b".to_string(), "2".to_string());
        store.write(data.clone()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.data, data);
        assert_eq!(loaded.key_count, 2);
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
    }

    #[test]
    fn load_without_snapshot_is_none() {
        let dir = TempDir::new();
        let store = SnapshotStore::new(&dir.path);
        assert!(store.load().unwrap().is_none());
        assert!(!store.exists());
    }

    #[test]
    fn write_leaves_no_temp_files_behind() {
        let dir = TempDir::new();
        let store = SnapshotStore::new(&dir.path);
        store.write(HashMap::new()).unwrap();
        let leftovers: Vec<_> = fs::read_dir(&dir.path)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn second_write_replaces_first_atomically() {
        let dir = TempDir::new();
        let store = SnapshotStore::new(&dir.path);
        let mut first = HashMap::new();
        first.insert("a".to_string(), "1".to_string());
        store.write(first).unwrap();

        let mut second = HashMap::new();
        second.insert("a".to_string(), "2".to_string());
        store.write(second.clone()).unwrap();

        assert_eq!(store.load().unwrap().unwrap().data, second);
    }

    #[test]
    fn info_reports_metadata() {
        let dir = TempDir::new();
        let store = SnapshotStore::new(&dir.path);
        let mut data = HashMap::new();
        data.insert("a".to_string(), "1".to_string());
        store.write(data).unwrap();
        let info = store.info().unwrap().unwrap();
        assert_eq!(info.key_count, 1);
        assert!(info.size_bytes > 0);
    }
}
