//! Error taxonomy shared by the engine, WAL, snapshot store and session layer.

use std::io;

/// Single error sum type for the whole crate.
///
/// Each variant corresponds to one of the error kinds from the durability
/// design: client-facing mistakes are recoverable, WAL/snapshot I/O errors
/// abort the current operation but leave the server running, and corruption
/// or recovery failures are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Malformed command or arguments; the connection stays open.
    #[error("{0}")]
    ClientError(String),

    /// Key absent (or already expired).
    #[error("key not found")]
    NotFound,

    /// WAL append/flush/fsync failed. The mutating op was not applied.
    #[error("wal io error: {0}")]
    WalIo(#[from] io::Error),

    /// A WAL record failed its checksum or could not be decoded during replay.
    #[error("wal corrupt at line {line}: {reason}")]
    WalCorrupt { line: u64, reason: String },

    /// Snapshot write or load failed.
    #[error("snapshot io error: {0}")]
    SnapshotIo(io::Error),

    /// Server is at `max_connections` capacity.
    #[error("connection limit reached")]
    ConnectionLimit,

    /// Engine has entered `Closing`/`Closed` and rejects new operations.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// Recovery could not bring the engine to a consistent state.
    #[error("recovery failed: {0}")]
    RecoveryError(String),
}

/// Convenience alias used throughout the crate.
pub type KvResult<T> = Result<T, KvError>;

impl KvError {
    /// Renders the error the way the protocol layer writes it on the wire,
    /// i.e. without a leading `-ERR ` (callers add the prefix).
    pub fn client_message(&self) -> String {
        match self {
            KvError::ClientError(msg) => msg.clone(),
            KvError::NotFound => "key not found".to_string(),
            KvError::WalIo(err) => format!("failed to write: {err}"),
            KvError::WalCorrupt { line, reason } => {
                format!("wal corrupt at line {line}: {reason}")
            }
            KvError::SnapshotIo(err) => format!("failed to compact: {err}"),
            KvError::ConnectionLimit => "connection limit reached".to_string(),
            KvError::ShutdownInProgress => "server is shutting down".to_string(),
            KvError::RecoveryError(reason) => format!("recovery failed: {reason}"),
        }
    }
}
