//! Conflict handling: the engine never deletes a destination file and never
//! silently overwrites divergent content. A conflicting file is moved into a
//! stamped quarantine directory before the new copy lands, and the move is
//! recorded in an append-only trail that no part of the engine ever prunes.

use crate::backup::checksum::{ChecksumEngine, ContentHash};
use crate::backup::ENGINE_DIR;
use crate::error::{EngineError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub original_path: PathBuf,
    pub quarantine_path: PathBuf,
    /// Checksum of the displaced file, also stamped into its quarantine name
    pub displaced_checksum: ContentHash,
    pub reason: String,
    pub quarantined_at: i64,
}

/// What a worker should do after the pre-write conflict check.
#[derive(Debug)]
pub enum ReconcileAction {
    /// Nothing at the destination path; write normally
    Proceed,
    /// Identical content already at the path; count as a skip, not an error
    SkipIdentical,
    /// A divergent file was displaced into quarantine; write normally
    QuarantinedThenProceed(QuarantineRecord),
}

pub struct QuarantineManager {
    quarantine_root: PathBuf,
    /// One stamp per run so a run's displacements land together
    run_stamp: String,
    checksum: ChecksumEngine,
}

impl QuarantineManager {
    pub fn new(effective_root: &Path, checksum: ChecksumEngine) -> Self {
        Self {
            quarantine_root: effective_root.join(ENGINE_DIR).join("quarantine"),
            run_stamp: Utc::now().format("%Y%m%d-%H%M%S").to_string(),
            checksum,
        }
    }

    pub fn quarantine_root(&self) -> &Path {
        &self.quarantine_root
    }

    /// Pre-write conflict check for one destination path.
    ///
    /// Blocking (hashes the existing file); workers call it via the blocking
    /// pool. The rename is atomic within the destination filesystem, and once
    /// started it always runs to completion regardless of cancellation.
    pub fn reconcile(
        &self,
        destination_path: &Path,
        relative_path: &Path,
        incoming: &ContentHash,
    ) -> Result<ReconcileAction> {
        if !destination_path.exists() {
            return Ok(ReconcileAction::Proceed);
        }

        let existing = self
            .checksum
            .checksum_file(destination_path)
            .map_err(|e| EngineError::io(destination_path, e))?;

        if &existing == incoming {
            return Ok(ReconcileAction::SkipIdentical);
        }

        let quarantine_path = self.quarantine_path_for(relative_path, &existing);
        if let Some(parent) = quarantine_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Quarantine {
                    path: quarantine_path.clone(),
                    source: e,
                })?;
        }
        std::fs::rename(destination_path, &quarantine_path).map_err(|e| {
            EngineError::Quarantine {
                path: destination_path.to_path_buf(),
                source: e,
            }
        })?;

        let record = QuarantineRecord {
            original_path: destination_path.to_path_buf(),
            quarantine_path: quarantine_path.clone(),
            displaced_checksum: existing,
            reason: "divergent content at destination path".to_string(),
            quarantined_at: Utc::now().timestamp(),
        };
        self.append_record(&record);

        info!(
            "Quarantined {} -> {}",
            destination_path.display(),
            quarantine_path.display()
        );
        Ok(ReconcileAction::QuarantinedThenProceed(record))
    }

    fn quarantine_path_for(&self, relative_path: &Path, displaced: &ContentHash) -> PathBuf {
        let file_name = relative_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        let stamped = format!("{}.{}", file_name, displaced.short());

        let mut path = self.quarantine_root.join(&self.run_stamp);
        if let Some(parent) = relative_path.parent() {
            path = path.join(parent);
        }
        path.join(stamped)
    }

    /// The trail is best-effort: a failure to log never blocks the backup,
    /// the displaced file itself is already safe.
    fn append_record(&self, record: &QuarantineRecord) {
        let log_path = self.quarantine_root.join("quarantine-log.jsonl");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .and_then(|mut f| {
                let line = serde_json::to_string(record)?;
                writeln!(f, "{line}")
            });
        if let Err(e) = result {
            warn!("Could not append quarantine record: {e}");
        }
    }
}
