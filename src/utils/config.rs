use crate::backup::duplicates::DuplicatePolicy;
use crate::backup::retry::RetryPolicy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Source tree holding the photography assets
    pub source_root: PathBuf,

    /// Destination roots, 1-4 of them
    pub destinations: Vec<PathBuf>,

    /// Extension allow-list (empty = all supported photography types)
    pub include_extensions: Vec<String>,

    /// Descend into subdirectories of the source root
    pub include_subdirectories: bool,

    /// Regex patterns for application cache/preview folders to skip
    pub cache_exclude_patterns: Vec<String>,

    /// Optional subfolder created under each destination root
    pub organization_folder: Option<String>,

    /// What to do with files already present at a destination
    pub duplicate_policy: DuplicatePolicy,

    /// Overrides the drive-type worker heuristic for every destination (0 = heuristic)
    pub worker_override: usize,

    /// Hard cap on workers per destination
    pub max_workers_per_destination: usize,

    /// Copy buffer size in bytes
    pub copy_chunk_size: usize,

    /// Retry/backoff tuning for transient destination I/O
    pub retry: RetryPolicy,

    /// Reuse destination checksums cached by a previous run's verification pass
    pub use_checksum_cache: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        let source_root = dirs::home_dir()
            .map(|p| p.join("Pictures"))
            .unwrap_or_else(|| PathBuf::from("/home"));

        Self {
            source_root,
            destinations: Vec::new(),
            include_extensions: Vec::new(),
            include_subdirectories: true,
            cache_exclude_patterns: vec![
                r"(^|/)\.thumbnails(/|$)".to_string(),
                r"(^|/)\.cache(/|$)".to_string(),
                r"Previews\.lrdata".to_string(),
                r"\.photoslibrary/resources/derivatives".to_string(),
                r"(^|/)\.DS_Store$".to_string(),
                r"(^|/)Thumbs\.db$".to_string(),
            ],
            organization_folder: None,
            duplicate_policy: DuplicatePolicy::SkipExact,
            worker_override: 0, // Drive-type heuristic
            max_workers_per_destination: 8,
            copy_chunk_size: 1024 * 1024,
            retry: RetryPolicy::default(),
            use_checksum_cache: true,
        }
    }
}

impl BackupConfig {
    /// Load config from an optional TOML file plus environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match config_file_path() {
            Some(path) if path.exists() => config::Config::builder()
                .add_source(config::File::from(path))
                .build()?
                .try_deserialize::<BackupConfig>()?,
            _ => BackupConfig::default(),
        };

        // Override with environment variables
        if let Ok(source) = std::env::var("SHUTTERVAULT_SOURCE") {
            config.source_root = PathBuf::from(source);
        }

        if let Ok(dests) = std::env::var("SHUTTERVAULT_DESTINATIONS") {
            config.destinations = dests
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        if let Ok(folder) = std::env::var("SHUTTERVAULT_ORGANIZATION_FOLDER") {
            config.organization_folder = Some(folder);
        }

        if let Ok(policy) = std::env::var("SHUTTERVAULT_DUPLICATE_POLICY") {
            config.duplicate_policy = policy.parse().map_err(anyhow::Error::msg)?;
        }

        if let Ok(workers) = std::env::var("SHUTTERVAULT_WORKERS") {
            config.worker_override = workers.parse()?;
        }

        if let Ok(flag) = std::env::var("SHUTTERVAULT_SUBDIRECTORIES") {
            config.include_subdirectories = flag.parse()?;
        }

        // Worker cap can never be zero
        if config.max_workers_per_destination == 0 {
            config.max_workers_per_destination = num_cpus::get().max(1);
        }

        Ok(config)
    }
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("SHUTTERVAULT_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|d| d.join("shuttervault/config.toml"))
}

pub fn load_config() -> Result<BackupConfig> {
    BackupConfig::load()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BackupConfig::default();
        assert!(config.destinations.is_empty());
        assert!(config.include_subdirectories);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::SkipExact);
        assert!(config.max_workers_per_destination >= 1);
        assert!(config.copy_chunk_size >= 64 * 1024);
    }

    #[test]
    fn policy_round_trips_through_str() {
        for s in ["copy-all", "skip-exact", "skip-renamed", "skip-both"] {
            let policy: DuplicatePolicy = s.parse().unwrap();
            assert_eq!(policy.as_str(), s);
        }
        assert!("skip-everything".parse::<DuplicatePolicy>().is_err());
    }
}
