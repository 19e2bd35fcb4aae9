//! Run orchestration: validates configuration, resolves destinations, and
//! drives the phase machine from analysis through verification, returning a
//! terminal [`RunOutcome`] to the caller.

use crate::backup::checksum::ChecksumEngine;
use crate::backup::duplicates::{ChecksumCache, DuplicateAnalysis, DuplicateDetector};
use crate::backup::manifest::{Manifest, ManifestBuilder, ManifestEntry};
use crate::backup::phase::{Phase, PhaseCoordinator};
use crate::backup::progress::{
    EventSender, ProgressAggregator, ProgressEvent, ProgressSnapshot,
};
use crate::backup::quarantine::QuarantineManager;
use crate::backup::retry::RetryController;
use crate::backup::scheduler::{CopyScheduler, DestinationRun, PoolOutcome};
use crate::backup::verify::VerificationEngine;
use crate::backup::worker::CopyWorker;
use crate::backup::{DestinationTarget, DriveKind, FailedFile, RunOutcome, TaskState};
use crate::error::{EngineError, Result};
use crate::utils::config::BackupConfig;
use crate::utils::disk;
use crate::utils::log_buffer::{LogBuffer, LogEntry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct BackupManager {
    config: Arc<BackupConfig>,
    run_id: uuid::Uuid,
    progress: ProgressAggregator,
    phases: PhaseCoordinator,
    cancel: CancellationToken,
    log: LogBuffer,
}

impl BackupManager {
    pub fn new(config: BackupConfig) -> Result<Self> {
        if config.destinations.is_empty() {
            return Err(EngineError::Config(
                "at least one destination is required".to_string(),
            ));
        }
        if config.destinations.len() > 4 {
            return Err(EngineError::Config(format!(
                "at most 4 destinations are supported, got {}",
                config.destinations.len()
            )));
        }

        let run_id = uuid::Uuid::new_v4();
        let log = LogBuffer::new(1000);

        // Drive kind and worker counts are resolved when the run starts;
        // until then the snapshot shows placeholders.
        let provisional: Vec<DestinationTarget> = config
            .destinations
            .iter()
            .enumerate()
            .map(|(index, root)| DestinationTarget {
                index,
                root: root.clone(),
                effective_root: effective_root(&config, root),
                kind: DriveKind::Unknown,
                workers: 0,
            })
            .collect();

        let progress = ProgressAggregator::new(run_id, &provisional, log.clone());
        let phases = PhaseCoordinator::new(progress.sender());

        Ok(Self {
            config: Arc::new(config),
            run_id,
            progress,
            phases,
            cancel: CancellationToken::new(),
            log,
        })
    }

    pub fn run_id(&self) -> uuid::Uuid {
        self.run_id
    }

    /// Signal cancellation; every worker observes it at its next checkpoint.
    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    pub fn phase(&self) -> Phase {
        self.phases.current()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phases.watch()
    }

    pub fn logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        self.log.get_logs(limit)
    }

    /// Acknowledge a completed run, returning the machine to idle.
    pub fn acknowledge(&self) {
        self.phases.reset();
    }

    /// Execute one full backup run. Cancellation resolves to
    /// `RunOutcome::Cancelled`, not an error; only pre-copy configuration
    /// problems are fatal.
    pub async fn run(&self) -> Result<RunOutcome> {
        let events = self.progress.sender();
        match self.run_phases(&events).await {
            Ok(outcome) => {
                let _ = events.send(ProgressEvent::RunFinished {
                    outcome: outcome.clone(),
                });
                if outcome == RunOutcome::Cancelled {
                    self.phases.reset();
                }
                Ok(outcome)
            }
            Err(EngineError::Cancelled) => {
                let outcome = RunOutcome::Cancelled;
                let _ = events.send(ProgressEvent::RunFinished {
                    outcome: outcome.clone(),
                });
                self.phases.reset();
                Ok(outcome)
            }
            Err(e) => {
                warn!("Run aborted: {e}");
                self.log.add_log("error", format!("Run aborted: {e}"), None);
                self.phases.reset();
                Err(e)
            }
        }
    }

    async fn run_phases(&self, events: &EventSender) -> Result<RunOutcome> {
        let config = &self.config;
        info!("Starting backup run {}", self.run_id);

        // ---- analyzing source ------------------------------------------
        self.phases.advance(Phase::AnalyzingSource)?;

        if !config.source_root.is_dir() {
            return Err(EngineError::Source(format!(
                "source root {} is not a readable directory",
                config.source_root.display()
            )));
        }

        let targets = self.resolve_targets(events).await?;
        let builder = Arc::new(ManifestBuilder::new(config)?);

        let estimate = {
            let builder = Arc::clone(&builder);
            let source_root = config.source_root.clone();
            run_blocking(move || builder.estimate(&source_root)).await??
        };
        let _ = events.send(ProgressEvent::SourceAnalyzed {
            files: estimate.files,
            bytes: estimate.bytes,
        });
        self.preflight_free_space(&targets, estimate.bytes);

        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // ---- building manifest -----------------------------------------
        self.phases.advance(Phase::BuildingManifest)?;
        let manifest = {
            let builder = Arc::clone(&builder);
            let source_root = config.source_root.clone();
            let events = events.clone();
            let cancel = self.cancel.clone();
            run_blocking(move || builder.build(&source_root, &events, &cancel)).await??
        };
        let manifest = Arc::new(manifest);
        for warning in &manifest.warnings {
            self.log.add_log(
                "warn",
                format!("Excluded {}: {}", warning.path.display(), warning.message),
                None,
            );
        }

        // ---- copying ----------------------------------------------------
        self.phases.advance(Phase::CopyingFiles)?;
        let checksum = ChecksumEngine::new(config.copy_chunk_size);
        let (analyses, mut caches) = self.analyze_destinations(&manifest, &targets, events).await?;

        let scheduler = CopyScheduler::new(
            Arc::clone(&manifest),
            config.duplicate_policy,
            events.clone(),
            self.cancel.clone(),
        );

        let copy_runs: Vec<DestinationRun> = targets
            .iter()
            .zip(analyses)
            .map(|(target, analysis)| DestinationRun {
                target: target.clone(),
                analysis,
                processor: self.processor_for(target, checksum, events, self.cancel.clone()),
            })
            .collect();

        let copy_outcomes = scheduler.run_copy_phase(&copy_runs).await;
        let was_cancelled = self.cancel.is_cancelled();
        let completed: Vec<Vec<Arc<ManifestEntry>>> =
            copy_outcomes.iter().map(PoolOutcome::completed).collect();

        // ---- flushing ---------------------------------------------------
        // Files were fsynced as they were written; this barrier syncs the
        // directory metadata so verification never reads buffered state.
        self.phases.advance(Phase::FlushingToDisk)?;
        for (target, entries) in targets.iter().zip(&completed) {
            let dirs = parent_dirs(&target.effective_root, entries);
            run_blocking(move || sync_dirs(&dirs)).await?;
        }

        // ---- verifying --------------------------------------------------
        // Runs under its own token: files already copied are verified even
        // after a mid-run cancellation, so "completed" always means
        // "independently confirmed".
        self.phases.advance(Phase::VerifyingDestinations)?;
        let verify_cancel = CancellationToken::new();
        let verify_runs: Vec<DestinationRun> = targets
            .iter()
            .map(|target| DestinationRun {
                target: target.clone(),
                analysis: DuplicateAnalysis::default(),
                processor: self.processor_for(target, checksum, events, verify_cancel.clone()),
            })
            .collect();
        let verify_outcomes = scheduler
            .run_verify_phase(&verify_runs, completed, verify_cancel)
            .await;

        if config.use_checksum_cache {
            for (target, outcome) in targets.iter().zip(&verify_outcomes) {
                update_cache(&mut caches[target.index], target, outcome);
                if let Err(e) = caches[target.index].save(&target.effective_root) {
                    warn!(
                        "Could not persist checksum cache for {}: {e}",
                        target.label()
                    );
                }
            }
        }

        // ---- complete ---------------------------------------------------
        self.phases.advance(Phase::Complete)?;

        let mut failed_files = Vec::new();
        for (target, outcome) in targets.iter().zip(&copy_outcomes) {
            collect_failures(target, outcome, &mut failed_files);
        }
        for (target, outcome) in targets.iter().zip(&verify_outcomes) {
            collect_failures(target, outcome, &mut failed_files);
        }

        let outcome = if was_cancelled || self.cancel.is_cancelled() {
            RunOutcome::Cancelled
        } else if failed_files.is_empty() {
            RunOutcome::CompletedClean
        } else {
            RunOutcome::CompletedWithFailures { failed_files }
        };
        info!("Backup run {} finished: {:?}", self.run_id, outcome);
        Ok(outcome)
    }

    /// Classify each destination's drive, size its pool, and make sure it is
    /// actually writable. Any unwritable configured destination is fatal.
    async fn resolve_targets(&self, events: &EventSender) -> Result<Vec<DestinationTarget>> {
        let config = &self.config;
        let mut targets = Vec::with_capacity(config.destinations.len());

        for (index, root) in config.destinations.iter().enumerate() {
            let effective = effective_root(config, root);

            let writable = disk::probe_writable(&effective)
                .await
                .map_err(|e| EngineError::Config(e.to_string()))?;
            if !writable {
                return Err(EngineError::Config(format!(
                    "destination {} is not writable",
                    root.display()
                )));
            }

            let profile = {
                let probe = effective.clone();
                run_blocking(move || disk::profile_path(&probe)).await?
            };

            let workers = if config.worker_override > 0 {
                config.worker_override
            } else {
                profile.kind.default_workers()
            }
            .clamp(1, config.max_workers_per_destination);

            info!(
                "Destination {} ({}): {:?} on {}, {} worker(s)",
                index,
                root.display(),
                profile.kind,
                profile.file_system,
                workers
            );
            let _ = events.send(ProgressEvent::DestinationResolved {
                destination: index,
                kind: profile.kind,
                workers,
            });

            targets.push(DestinationTarget {
                index,
                root: root.clone(),
                effective_root: effective,
                kind: profile.kind,
                workers,
            });
        }

        Ok(targets)
    }

    /// Free space below the estimated manifest size is a warning, not an
    /// abort; per-file disk-full errors stay terminal for their tasks.
    fn preflight_free_space(&self, targets: &[DestinationTarget], needed: u64) {
        for target in targets {
            let profile = disk::profile_path(&target.effective_root);
            if profile.available_bytes > 0 && profile.available_bytes < needed {
                let message = format!(
                    "{} has {} bytes free but the source holds {} bytes",
                    target.label(),
                    profile.available_bytes,
                    needed
                );
                warn!("{message}");
                self.log.add_log("warn", message, Some(target.label()));
            }
        }
    }

    async fn analyze_destinations(
        &self,
        manifest: &Arc<Manifest>,
        targets: &[DestinationTarget],
        events: &EventSender,
    ) -> Result<(Vec<DuplicateAnalysis>, Vec<ChecksumCache>)> {
        let checksum = ChecksumEngine::new(self.config.copy_chunk_size);
        let use_cache = self.config.use_checksum_cache;

        let mut jobs = Vec::with_capacity(targets.len());
        for target in targets {
            let manifest = Arc::clone(manifest);
            let target = target.clone();
            jobs.push(tokio::task::spawn_blocking(move || {
                let mut cache = if use_cache {
                    ChecksumCache::load(&target.effective_root)
                } else {
                    ChecksumCache::default()
                };
                let analysis =
                    DuplicateDetector::new(checksum).analyze(&manifest, &target, &mut cache);
                (target.index, analysis, cache)
            }));
        }

        let mut analyses = vec![DuplicateAnalysis::default(); targets.len()];
        let mut caches: Vec<ChecksumCache> =
            (0..targets.len()).map(|_| ChecksumCache::default()).collect();
        for job in jobs {
            let (index, analysis, cache) = job
                .await
                .map_err(|e| EngineError::Source(format!("analysis task failed: {e}")))?;
            caches[index] = cache;
            match analysis {
                Ok(analysis) => {
                    let _ = events.send(ProgressEvent::AnalysisReady {
                        destination: index,
                        exact: analysis.exact.len(),
                        renamed: analysis.renamed.len(),
                        unique: analysis.unique.len(),
                        bytes_saved: analysis.potential_bytes_saved,
                    });
                    analyses[index] = analysis;
                }
                Err(e) => {
                    // Degrade to copy-everything; conflicts still go through
                    // quarantine, so correctness is unaffected.
                    warn!(
                        "Duplicate analysis failed for destination {index}: {e}; copying all files"
                    );
                    self.log.add_log(
                        "warn",
                        format!("Duplicate analysis failed: {e}"),
                        Some(targets[index].label()),
                    );
                }
            }
        }

        Ok((analyses, caches))
    }

    fn processor_for(
        &self,
        target: &DestinationTarget,
        checksum: ChecksumEngine,
        events: &EventSender,
        cancel: CancellationToken,
    ) -> Arc<CopyWorker> {
        Arc::new(CopyWorker::new(
            target.clone(),
            Arc::new(QuarantineManager::new(&target.effective_root, checksum)),
            VerificationEngine::new(checksum),
            RetryController::new(self.config.retry, cancel.clone()),
            events.clone(),
            cancel,
            self.config.copy_chunk_size,
        ))
    }
}

fn effective_root(config: &BackupConfig, root: &Path) -> PathBuf {
    match &config.organization_folder {
        Some(folder) if !folder.is_empty() => root.join(folder),
        _ => root.to_path_buf(),
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Source(format!("background task failed: {e}")))
}

/// Unique directories that received files, deepest included, for the flush
/// barrier.
fn parent_dirs(root: &Path, entries: &[Arc<ManifestEntry>]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = entries
        .iter()
        .filter_map(|e| root.join(&e.relative_path).parent().map(Path::to_path_buf))
        .collect();
    dirs.push(root.to_path_buf());
    dirs.sort();
    dirs.dedup();
    dirs
}

fn sync_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        match std::fs::File::open(dir) {
            Ok(handle) => {
                if let Err(e) = handle.sync_all() {
                    warn!("Could not sync {}: {e}", dir.display());
                }
            }
            Err(e) => warn!("Could not open {} for sync: {e}", dir.display()),
        }
    }
}

fn collect_failures(target: &DestinationTarget, outcome: &PoolOutcome, out: &mut Vec<FailedFile>) {
    for (entry, result) in &outcome.results {
        if result.state == TaskState::Failed {
            out.push(FailedFile {
                destination: target.index,
                relative_path: entry.relative_path.clone(),
                error: result
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            });
        }
    }
}

fn update_cache(cache: &mut ChecksumCache, target: &DestinationTarget, outcome: &PoolOutcome) {
    for (entry, result) in &outcome.results {
        if result.state != TaskState::Complete {
            continue;
        }
        let dest_path = target.effective_root.join(&entry.relative_path);
        if let Ok(metadata) = dest_path.metadata() {
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            cache.record(
                entry.relative_path.to_string_lossy().to_string(),
                metadata.len(),
                mtime,
                entry.checksum.clone(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_destinations_is_a_config_error() {
        let config = BackupConfig::default();
        assert!(matches!(
            BackupManager::new(config),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn five_destinations_is_a_config_error() {
        let config = BackupConfig {
            destinations: (0..5).map(|i| PathBuf::from(format!("/d{i}"))).collect(),
            ..BackupConfig::default()
        };
        assert!(matches!(
            BackupManager::new(config),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn organization_folder_nests_the_effective_root() {
        let config = BackupConfig {
            organization_folder: Some("photo-vault".to_string()),
            ..BackupConfig::default()
        };
        assert_eq!(
            effective_root(&config, Path::new("/mnt/a")),
            PathBuf::from("/mnt/a/photo-vault")
        );

        let bare = BackupConfig::default();
        assert_eq!(
            effective_root(&bare, Path::new("/mnt/a")),
            PathBuf::from("/mnt/a")
        );
    }

    #[tokio::test]
    async fn unreadable_source_fails_before_any_copying() {
        let dst = tempfile::tempdir().unwrap();
        let config = BackupConfig {
            source_root: PathBuf::from("/definitely/not/a/dir"),
            destinations: vec![dst.path().to_path_buf()],
            ..BackupConfig::default()
        };
        let manager = BackupManager::new(config).unwrap();
        assert!(matches!(manager.run().await, Err(EngineError::Source(_))));
        // The machine resets so the manager stays usable
        assert_eq!(manager.phase(), Phase::Idle);
    }
}
