//! Client-side connection pool (C7): bounded, reusable TCP connections to
//! a kvlite server, with a liveness probe before handing a connection back out.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::TcpStream;
use std::time::Duration;

/// Errors specific to borrowing/returning pooled connections.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool exhausted")]
    PoolExhausted,
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("failed to connect: {0}")]
    Io(#[from] io::Error),
}

struct PoolState {
    idle: VecDeque<TcpStream>,
    active: u32,
    closed: bool,
}

/// Bounded pool of `TcpStream`s to a single address.
///
/// `max_active` bounds the number of connections that may be dialed
/// concurrently (idle + checked out); `max_idle` bounds how many idle
/// connections are kept around for reuse rather than closed on `put`.
pub struct ConnectionPool {
    addr: String,
    max_active: u32,
    max_idle: usize,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(addr: impl Into<String>, max_active: u32, max_idle: usize) -> Self {
        Self {
            addr: addr.into(),
            max_active,
            max_idle,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                closed: false,
            }),
        }
    }

    /// Returns an idle, live connection if one is available; otherwise
    /// dials a new one subject to `max_active`.
    pub fn get(&self) -> Result<TcpStream, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::PoolClosed);
        }

        while let Some(conn) = state.idle.pop_front() {
            if is_alive(&conn) {
                return Ok(conn);
            }
            state.active = state.active.saturating_sub(1);
        }

        if self.max_active > 0 && state.active >= self.max_active {
            return Err(PoolError::PoolExhausted);
        }

        let conn = TcpStream::connect(&self.addr)?;
        state.active += 1;
        Ok(conn)
    }

    /// Returns `conn` to the idle set, or closes it if the set is full or
    /// the pool has been closed.
    pub fn put(&self, conn: TcpStream) {
        let mut state = self.state.lock();
        if state.closed || state.idle.len() >= self.max_idle {
            state.active = state.active.saturating_sub(1);
            drop(conn);
            return;
        }
        state.idle.push_back(conn);
    }

    /// Idempotent: closes every idle connection and marks the pool closed.
    /// Subsequent `get` calls fail with `PoolClosed`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.active = state.active.saturating_sub(state.idle.len() as u32);
        state.idle.clear();
    }

    pub fn active_count(&self) -> u32 {
        self.state.lock().active
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }
}

/// A short non-blocking read probe: a timeout means the peer is idle and
/// the connection is still usable; any successful read or other error
/// means the peer closed or sent unsolicited data, so the connection is
/// discarded.
fn is_alive(conn: &TcpStream) -> bool {
    let Ok(()) = conn.set_read_timeout(Some(Duration::from_millis(1))) else {
        return false;
    };
    let mut probe = [0u8; 1];
    let result = (&*conn).read(&mut probe);
    let _ = conn.set_read_timeout(None);
    matches!(result, Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut)
}
