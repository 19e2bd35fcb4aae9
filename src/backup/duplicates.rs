//! Destination-side duplicate classification.
//!
//! Before any copying, each destination tree is compared against the sealed
//! manifest: a file at the same relative path with a matching checksum is an
//! exact duplicate, a matching checksum anywhere else is a renamed duplicate,
//! everything else is unique. The user's skip policy is applied over this
//! classification per destination.

use crate::backup::checksum::{ChecksumEngine, ContentHash};
use crate::backup::manifest::Manifest;
use crate::backup::{DestinationTarget, SkipReason, ENGINE_DIR};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    CopyAll,
    SkipExact,
    SkipRenamed,
    SkipBoth,
}

impl DuplicatePolicy {
    pub fn skips_exact(self) -> bool {
        matches!(self, Self::SkipExact | Self::SkipBoth)
    }

    pub fn skips_renamed(self) -> bool {
        matches!(self, Self::SkipRenamed | Self::SkipBoth)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CopyAll => "copy-all",
            Self::SkipExact => "skip-exact",
            Self::SkipRenamed => "skip-renamed",
            Self::SkipBoth => "skip-both",
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "copy-all" => Ok(Self::CopyAll),
            "skip-exact" => Ok(Self::SkipExact),
            "skip-renamed" => Ok(Self::SkipRenamed),
            "skip-both" => Ok(Self::SkipBoth),
            other => Err(format!("unknown duplicate policy {other:?}")),
        }
    }
}

/// Per-destination classification of the whole manifest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DuplicateAnalysis {
    /// Manifest relative paths with an identical file at the same path
    pub exact: HashSet<PathBuf>,
    /// Manifest relative path -> existing destination relative path
    pub renamed: HashMap<PathBuf, PathBuf>,
    /// Everything else
    pub unique: HashSet<PathBuf>,
    /// Bytes not transferred if both duplicate classes are skipped
    pub potential_bytes_saved: u64,
}

impl DuplicateAnalysis {
    /// The skip decision the scheduler applies for one entry.
    pub fn skip_reason(&self, relative_path: &Path, policy: DuplicatePolicy) -> Option<SkipReason> {
        if policy.skips_exact() && self.exact.contains(relative_path) {
            return Some(SkipReason::ExactDuplicate);
        }
        if policy.skips_renamed() && self.renamed.contains_key(relative_path) {
            return Some(SkipReason::RenamedDuplicate);
        }
        None
    }

    pub fn classified_count(&self) -> usize {
        self.exact.len() + self.renamed.len() + self.unique.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    size: u64,
    mtime: i64,
    checksum: ContentHash,
}

/// Destination checksum cache from a prior run's verification pass.
/// Keyed by relative path; an entry is trusted only while size and mtime
/// both still match. Purely an optimization, never a correctness dependency.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChecksumCache {
    entries: HashMap<String, CacheEntry>,
}

impl ChecksumCache {
    pub fn cache_path(effective_root: &Path) -> PathBuf {
        effective_root.join(ENGINE_DIR).join("checksum-cache.json")
    }

    pub fn load(effective_root: &Path) -> Self {
        let path = Self::cache_path(effective_root);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Discarding unreadable checksum cache {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, effective_root: &Path) -> std::io::Result<()> {
        let path = Self::cache_path(effective_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)
    }

    pub fn lookup(&self, relative: &str, size: u64, mtime: i64) -> Option<&ContentHash> {
        self.entries
            .get(relative)
            .filter(|e| e.size == size && e.mtime == mtime)
            .map(|e| &e.checksum)
    }

    pub fn record(&mut self, relative: String, size: u64, mtime: i64, checksum: ContentHash) {
        self.entries.insert(
            relative,
            CacheEntry {
                size,
                mtime,
                checksum,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct DuplicateDetector {
    checksum: ChecksumEngine,
}

impl DuplicateDetector {
    pub fn new(checksum: ChecksumEngine) -> Self {
        Self { checksum }
    }

    /// Classify every manifest entry against one destination tree.
    /// Blocking; the manager runs one of these per destination on the
    /// blocking pool.
    pub fn analyze(
        &self,
        manifest: &Manifest,
        destination: &DestinationTarget,
        cache: &mut ChecksumCache,
    ) -> Result<DuplicateAnalysis> {
        let mut analysis = DuplicateAnalysis::default();
        let root = &destination.effective_root;

        if !root.exists() {
            for entry in manifest.entries() {
                analysis.unique.insert(entry.relative_path.clone());
            }
            return Ok(analysis);
        }

        // Hash (or cache-hit) every file currently at the destination,
        // building a content index for renamed detection.
        let mut by_path: HashMap<PathBuf, ContentHash> = HashMap::new();
        let mut by_hash: HashMap<ContentHash, PathBuf> = HashMap::new();

        for existing in WalkDir::new(root).follow_links(false) {
            let existing = match existing {
                Ok(e) => e,
                Err(e) => {
                    debug!("Skipping unreadable destination entry: {e}");
                    continue;
                }
            };
            if !existing.file_type().is_file() {
                continue;
            }
            let path = existing.path();
            let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
            // The engine's own metadata/quarantine tree never counts as data
            if relative.starts_with(ENGINE_DIR) {
                continue;
            }

            let metadata = match existing.metadata() {
                Ok(m) => m,
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let relative_key = relative.to_string_lossy().to_string();

            let hash = match cache.lookup(&relative_key, metadata.len(), mtime) {
                Some(hash) => hash.clone(),
                None => match self.checksum.checksum_file(path) {
                    Ok(hash) => {
                        cache.record(relative_key, metadata.len(), mtime, hash.clone());
                        hash
                    }
                    Err(e) => {
                        return Err(EngineError::io(path, e));
                    }
                },
            };

            by_hash.entry(hash.clone()).or_insert_with(|| relative.clone());
            by_path.insert(relative, hash);
        }

        for entry in manifest.entries() {
            let rel = &entry.relative_path;
            if by_path.get(rel) == Some(&entry.checksum) {
                analysis.exact.insert(rel.clone());
                analysis.potential_bytes_saved += entry.size;
                continue;
            }
            match by_hash.get(&entry.checksum) {
                Some(existing_rel) if existing_rel != rel => {
                    analysis
                        .renamed
                        .insert(rel.clone(), existing_rel.clone());
                    analysis.potential_bytes_saved += entry.size;
                }
                _ => {
                    analysis.unique.insert(rel.clone());
                }
            }
        }

        info!(
            "Duplicate analysis for {}: {} exact, {} renamed, {} unique ({} bytes reclaimable)",
            destination.label(),
            analysis.exact.len(),
            analysis.renamed.len(),
            analysis.unique.len(),
            analysis.potential_bytes_saved
        );
        Ok(analysis)
    }
}
