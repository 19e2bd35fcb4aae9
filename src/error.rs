//! Engine error taxonomy.
//!
//! Every task-level failure carries enough context to land in the failed-file
//! list, and classifies itself as transient (retryable) or terminal.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("source tree error: {0}")]
    Source(String),

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum mismatch for {path}: expected {expected}, found {found}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("quarantine move failed for {path}: {source}")]
    Quarantine {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid phase transition: {from} -> {to}")]
    Phase { from: String, to: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this failure is worth retrying with backoff.
    ///
    /// Checksum mismatches are handled by the verification re-copy cycle, not
    /// here, and cancellation is never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => io_is_transient(source),
            _ => false,
        }
    }
}

/// Transient I/O classification per the error taxonomy: timeouts and
/// temporary unavailability retry; permission, missing-file, and disk-full
/// conditions are terminal.
pub fn io_is_transient(err: &std::io::Error) -> bool {
    if let Some(code) = err.raw_os_error() {
        match code {
            // Disk full / read-only / permission: terminal regardless of kind.
            c if c == libc::ENOSPC || c == libc::EROFS || c == libc::EACCES => return false,
            // Stale NFS handles and busy devices clear up on network shares.
            c if c == libc::ESTALE || c == libc::EBUSY || c == libc::EAGAIN => return true,
            _ => {}
        }
    }

    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}

pub type Result<T> = std::result::Result<T, EngineError>;
