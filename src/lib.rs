//! ShutterVault
//!
//! Verified multi-destination backup engine for photography assets. One
//! source tree fans out to up to four independent destinations; every copy is
//! re-read and checksum-verified, conflicting destination files are
//! quarantined rather than overwritten, and nothing is ever deleted.

pub mod backup;
pub mod error;
pub mod utils;

// Re-export commonly used types
pub use backup::manager::BackupManager;
pub use backup::progress::{ProgressEvent, ProgressSnapshot};
pub use backup::{DriveKind, Phase, RunOutcome};
pub use error::EngineError;
pub use utils::config::BackupConfig;

pub type Result<T> = std::result::Result<T, EngineError>;
