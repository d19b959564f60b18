//! Compaction policy and the background timer that drives it.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Returns `true` when the WAL has grown enough (by entry count or byte
/// size) to justify a fresh snapshot and truncation.
pub fn needs_compaction(
    wal_entry_count: u64,
    max_wal_entries: u64,
    wal_size_bytes: u64,
    max_wal_size: u64,
) -> bool {
    wal_entry_count >= max_wal_entries || wal_size_bytes >= max_wal_size
}

/// Background timer that wakes every `compaction_interval` and invokes
/// `tick`, which is expected to check `needs_compaction` itself and run a
/// compaction cycle when it applies. Shares the `(tick, shutdown)` shape
/// used by the TTL expirer.
pub struct CompactionTimer {
    shutdown_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl CompactionTimer {
    pub fn start<F>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(interval) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => tick(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CompactionTimer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_on_entry_count() {
        assert!(needs_compaction(10_000, 10_000, 0, 10_485_760));
        assert!(!needs_compaction(9_999, 10_000, 0, 10_485_760));
    }

    #[test]
    fn triggers_on_byte_size() {
        assert!(needs_compaction(0, 10_000, 10_485_760, 10_485_760));
        assert!(!needs_compaction(0, 10_000, 10_485_759, 10_485_760));
    }

    #[test]
    fn timer_ticks_and_stops_cleanly() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);
        let timer = CompactionTimer::start(Duration::from_millis(15), move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        thread::sleep(Duration::from_millis(100));
        timer.stop();
        assert!(ticks.load(Ordering::Relaxed) >= 2);
    }
}
