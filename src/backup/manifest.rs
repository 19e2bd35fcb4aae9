//! Source tree enumeration and manifest construction.
//!
//! The manifest is the authoritative, immutable list of files and checksums
//! for one backup run. Everything downstream (duplicate analysis, copying,
//! verification) keys off the entries built here.

use crate::backup::checksum::{ChecksumEngine, ContentHash};
use crate::backup::progress::{EventSender, ProgressEvent};
use crate::error::{EngineError, Result};
use crate::utils::config::BackupConfig;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// File types the engine recognizes as photography assets. An empty
/// allow-list in the config means "everything in this table".
static SUPPORTED_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // Common interchange formats
        "jpg", "jpeg", "png", "tif", "tiff", "heic", "heif", "webp", "bmp", "gif", "psd",
        // Raw formats
        "dng", "raw", "arw", "cr2", "cr3", "nef", "nrw", "orf", "raf", "rw2", "pef", "srw",
        "x3f", "gpr", "3fr", "iiq",
        // Video captured alongside stills
        "mp4", "mov", "avi", "m4v", "mts",
        // Sidecar metadata
        "xmp",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Source-tree-relative path; the stable identity key for the run
    pub relative_path: PathBuf,
    pub source_path: PathBuf,
    pub size: u64,
    /// Seconds since epoch
    pub modified: i64,
    pub checksum: ContentHash,
}

/// A file seen during enumeration but excluded from the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestWarning {
    pub path: PathBuf,
    pub message: String,
}

/// Immutable once built; ordered by traversal order, unique by relative path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub id: uuid::Uuid,
    pub source_root: PathBuf,
    entries: Vec<ManifestEntry>,
    total_bytes: u64,
    pub warnings: Vec<ManifestWarning>,
}

impl Manifest {
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn get(&self, relative_path: &Path) -> Option<&ManifestEntry> {
        self.entries
            .iter()
            .find(|e| e.relative_path == relative_path)
    }
}

/// Quick source estimate used by the analyzing phase: file count and total
/// bytes without any hashing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceEstimate {
    pub files: u64,
    pub bytes: u64,
}

pub struct ManifestBuilder {
    checksum: ChecksumEngine,
    extensions: HashSet<String>,
    include_subdirectories: bool,
    excludes: Vec<Regex>,
}

impl ManifestBuilder {
    pub fn new(config: &BackupConfig) -> Result<Self> {
        let extensions = config
            .include_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        let excludes = config
            .cache_exclude_patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| EngineError::Config(format!("bad exclude pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            checksum: ChecksumEngine::new(config.copy_chunk_size),
            extensions,
            include_subdirectories: config.include_subdirectories,
            excludes,
        })
    }

    /// Enumerate without hashing; feeds the free-space preflight.
    pub fn estimate(&self, source_root: &Path) -> Result<SourceEstimate> {
        let mut estimate = SourceEstimate::default();
        for candidate in self.enumerate(source_root, &mut Vec::new())? {
            estimate.files += 1;
            estimate.bytes += candidate.size;
        }
        Ok(estimate)
    }

    /// Walk the source tree and seal a manifest. Unreadable files become
    /// warnings, never aborts. Blocking; callers run it off the async
    /// runtime's core threads.
    pub fn build(
        &self,
        source_root: &Path,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<Manifest> {
        if !source_root.is_dir() {
            return Err(EngineError::Source(format!(
                "source root {} is not a readable directory",
                source_root.display()
            )));
        }

        let mut warnings = Vec::new();
        let candidates = self.enumerate(source_root, &mut warnings)?;
        info!(
            "Enumerated {} candidate files under {}",
            candidates.len(),
            source_root.display()
        );

        // Hash eagerly across the rayon pool; order of results follows
        // traversal order because par_iter preserves indices.
        let checksum = self.checksum;
        let hashed: Vec<std::result::Result<ManifestEntry, ManifestWarning>> = candidates
            .into_par_iter()
            .map(|candidate| {
                if cancel.is_cancelled() {
                    return Err(ManifestWarning {
                        path: candidate.source_path,
                        message: "cancelled".to_string(),
                    });
                }
                match checksum.checksum_file(&candidate.source_path) {
                    Ok(hash) => {
                        let _ = events.send(ProgressEvent::ManifestFileHashed {
                            relative_path: candidate.relative_path.clone(),
                            size: candidate.size,
                        });
                        Ok(ManifestEntry {
                            relative_path: candidate.relative_path,
                            source_path: candidate.source_path,
                            size: candidate.size,
                            modified: candidate.modified,
                            checksum: hash,
                        })
                    }
                    Err(e) => Err(ManifestWarning {
                        path: candidate.source_path,
                        message: e.to_string(),
                    }),
                }
            })
            .collect();

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut entries = Vec::with_capacity(hashed.len());
        for result in hashed {
            match result {
                Ok(entry) => entries.push(entry),
                Err(warning) => {
                    warn!(
                        "Excluding unreadable file {}: {}",
                        warning.path.display(),
                        warning.message
                    );
                    warnings.push(warning);
                }
            }
        }

        let total_bytes = entries.iter().map(|e| e.size).sum();
        let manifest = Manifest {
            id: uuid::Uuid::new_v4(),
            source_root: source_root.to_path_buf(),
            entries,
            total_bytes,
            warnings,
        };

        let _ = events.send(ProgressEvent::ManifestBuilt {
            files: manifest.len() as u64,
            bytes: manifest.total_bytes,
            warnings: manifest.warnings.len(),
        });
        info!(
            "Manifest sealed: {} files, {} bytes, {} warnings",
            manifest.len(),
            manifest.total_bytes,
            manifest.warnings.len()
        );

        Ok(manifest)
    }

    fn enumerate(
        &self,
        source_root: &Path,
        warnings: &mut Vec<ManifestWarning>,
    ) -> Result<Vec<Candidate>> {
        let mut walker = WalkDir::new(source_root).follow_links(false);
        if !self.include_subdirectories {
            walker = walker.max_depth(1);
        }
        // Stable order within and across runs on an unchanged tree
        let walker = walker.sort_by_file_name();

        let mut candidates = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    warnings.push(ManifestWarning {
                        path,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            // Symlinks are never followed or copied
            if entry.file_type().is_symlink() {
                debug!("Skipping symlink {}", entry.path().display());
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path
                .strip_prefix(source_root)
                .unwrap_or(path)
                .to_path_buf();
            let relative_str = relative.to_string_lossy();

            if self.excludes.iter().any(|re| re.is_match(&relative_str)) {
                debug!("Excluded by cache pattern: {relative_str}");
                continue;
            }
            if !self.extension_allowed(path) {
                continue;
            }

            match entry.metadata() {
                Ok(metadata) => {
                    let modified = metadata
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);
                    candidates.push(Candidate {
                        relative_path: relative,
                        source_path: path.to_path_buf(),
                        size: metadata.len(),
                        modified,
                    });
                }
                Err(e) => warnings.push(ManifestWarning {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                }),
            }
        }

        Ok(candidates)
    }

    fn extension_allowed(&self, path: &Path) -> bool {
        let ext = match path.extension() {
            Some(e) => e.to_string_lossy().to_ascii_lowercase(),
            None => return false,
        };
        if self.extensions.is_empty() {
            SUPPORTED_EXTENSIONS.contains(ext.as_str())
        } else {
            self.extensions.contains(&ext)
        }
    }
}

struct Candidate {
    relative_path: PathBuf,
    source_path: PathBuf,
    size: u64,
    modified: i64,
}
