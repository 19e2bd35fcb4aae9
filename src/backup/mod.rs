pub mod checksum;
pub mod duplicates;
pub mod manager;
pub mod manifest;
pub mod phase;
pub mod progress;
pub mod quarantine;
pub mod retry;
pub mod scheduler;
pub mod verify;
pub mod worker;

pub use manager::BackupManager;
pub use manifest::{Manifest, ManifestEntry};
pub use phase::Phase;
pub use progress::{ProgressEvent, ProgressSnapshot};
pub use scheduler::CopyScheduler;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the engine's metadata directory under each destination's effective
/// root. Holds the quarantine tree and the checksum cache; always excluded
/// from destination walks.
pub const ENGINE_DIR: &str = ".shuttervault";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveKind {
    Ssd,
    Hdd,
    Network,
    Removable,
    Unknown,
}

impl DriveKind {
    /// Default concurrency per drive class. Policy, not a correctness
    /// requirement: removable and network media stay conservative so
    /// timeouts surface quickly, rotational disks limit seek thrash,
    /// solid-state takes the most parallel I/O.
    pub fn default_workers(self) -> usize {
        match self {
            DriveKind::Ssd => 8,
            DriveKind::Hdd => 3,
            DriveKind::Network => 2,
            DriveKind::Removable => 1,
            DriveKind::Unknown => 2,
        }
    }
}

/// One configured destination, resolved at run start.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationTarget {
    pub index: usize,
    /// Root as configured
    pub root: PathBuf,
    /// Root plus the optional organization folder; all copies land here
    pub effective_root: PathBuf,
    pub kind: DriveKind,
    /// Resolved worker count for this run
    pub workers: usize,
}

impl DestinationTarget {
    pub fn label(&self) -> String {
        self.root.display().to_string()
    }
}

/// Terminal state of one (entry, destination) copy task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Copying,
    Verifying,
    Complete,
    Failed,
    /// Completed after displacing a conflicting destination file
    Quarantined,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipReason {
    /// Same relative path, same checksum, per duplicate analysis
    ExactDuplicate,
    /// Same checksum elsewhere in the destination tree
    RenamedDuplicate,
    /// Identical file found at the target path at copy time
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub destination: usize,
    pub relative_path: PathBuf,
    pub error: String,
}

/// Run-terminal outcome surfaced to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RunOutcome {
    CompletedClean,
    CompletedWithFailures { failed_files: Vec<FailedFile> },
    Cancelled,
}
