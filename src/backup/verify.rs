//! Post-copy verification: a file counts as backed up only after the
//! destination bytes are independently re-read and confirmed identical to
//! the source bytes recorded in the manifest.

use crate::backup::checksum::{ChecksumEngine, ContentHash};
use crate::backup::manifest::ManifestEntry;
use crate::error::{EngineError, Result};
use std::path::Path;
use tracing::debug;

#[derive(Clone, Copy)]
pub struct VerificationEngine {
    checksum: ChecksumEngine,
}

impl VerificationEngine {
    pub fn new(checksum: ChecksumEngine) -> Self {
        Self { checksum }
    }

    /// Re-read the destination file and compare against the manifest
    /// checksum. The verified hash is returned so it can seed the
    /// destination checksum cache for the next run.
    pub async fn verify(
        &self,
        destination_path: &Path,
        entry: &ManifestEntry,
    ) -> Result<ContentHash> {
        let found = self
            .checksum
            .checksum_file_async(destination_path)
            .await
            .map_err(|e| EngineError::io(destination_path, e))?;

        if found == entry.checksum {
            debug!("Verified {}", destination_path.display());
            Ok(found)
        } else {
            Err(EngineError::ChecksumMismatch {
                path: destination_path.to_path_buf(),
                expected: entry.checksum.to_string(),
                found: found.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn entry_for(content: &[u8]) -> ManifestEntry {
        ManifestEntry {
            relative_path: PathBuf::from("a.jpg"),
            source_path: PathBuf::from("/src/a.jpg"),
            size: content.len() as u64,
            modified: 0,
            checksum: ContentHash::from(blake3::hash(content)),
        }
    }

    #[tokio::test]
    async fn matching_bytes_verify() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.jpg");
        fs::write(&dest, b"faithful copy").unwrap();

        let engine = VerificationEngine::new(ChecksumEngine::default());
        let verified = engine.verify(&dest, &entry_for(b"faithful copy")).await.unwrap();
        assert_eq!(verified, ContentHash::from(blake3::hash(b"faithful copy")));
    }

    #[tokio::test]
    async fn corrupted_bytes_are_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.jpg");
        fs::write(&dest, b"bit-rotted copy").unwrap();

        let engine = VerificationEngine::new(ChecksumEngine::default());
        let err = engine
            .verify(&dest, &entry_for(b"original bytes"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ChecksumMismatch { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unreadable_destination_is_an_io_error() {
        let engine = VerificationEngine::new(ChecksumEngine::default());
        let err = engine
            .verify(Path::new("/nonexistent/a.jpg"), &entry_for(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
