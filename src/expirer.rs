//! TTL expirer (C4): lazy expiration lives in `Keyspace::get`; this module
//! is the active half — a background sweep that bounds the staleness of
//! expired entries nobody has read yet.

use crate::keyspace::Keyspace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Snapshot of the expirer's running counters, surfaced through `STATS`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpirerStats {
    pub total_expired: u64,
    pub checks_performed: u64,
    pub last_check_unix_secs: u64,
}

struct Counters {
    total_expired: AtomicU64,
    checks_performed: AtomicU64,
    last_check_unix_secs: AtomicU64,
}

/// Background sweeper that periodically calls `Keyspace::delete_expired`.
///
/// Modeled as a task that blocks on `(tick, shutdown)` via
/// `mpsc::Receiver::recv_timeout`: a timeout means "tick, run a sweep", a
/// received message means "shut down now". No global state — the thread
/// only holds the `Arc<Keyspace>` handle passed at construction.
pub struct TtlExpirer {
    shutdown_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl TtlExpirer {
    /// Starts the sweep thread, waking every `check_interval`.
    pub fn start(keyspace: Arc<Keyspace>, check_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let counters = Arc::new(Counters {
            total_expired: AtomicU64::new(0),
            checks_performed: AtomicU64::new(0),
            last_check_unix_secs: AtomicU64::new(0),
        });
        let thread_counters = Arc::clone(&counters);

        let handle = thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(check_interval) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let expired = keyspace.delete_expired();
                    thread_counters
                        .total_expired
                        .fetch_add(expired as u64, Ordering::Relaxed);
                    thread_counters
                        .checks_performed
                        .fetch_add(1, Ordering::Relaxed);
                    thread_counters
                        .last_check_unix_secs
                        .store(now_unix_secs(), Ordering::Relaxed);
                    if expired > 0 {
                        debug!(expired, "ttl sweep reclaimed expired keys");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        Self {
            shutdown_tx,
            handle: Some(handle),
            counters,
        }
    }

    pub fn stats(&self) -> ExpirerStats {
        ExpirerStats {
            total_expired: self.counters.total_expired.load(Ordering::Relaxed),
            checks_performed: self.counters.checks_performed.load(Ordering::Relaxed),
            last_check_unix_secs: self.counters.last_check_unix_secs.load(Ordering::Relaxed),
        }
    }

    /// Signals the sweep thread to stop and waits for the current sweep
    /// (if any) to finish. No sweep is left in flight after this returns.
    pub fn stop(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TtlExpirer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
