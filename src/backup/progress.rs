//! Progress aggregation.
//!
//! Workers publish fire-and-forget events over an unbounded channel; a single
//! aggregator task folds them into the one piece of mutable shared state in
//! the engine, the [`ProgressSnapshot`]. Observers either poll the snapshot
//! or subscribe to the throttled broadcast. A slow observer can lag the
//! broadcast ring without ever blocking a worker.

use crate::backup::phase::Phase;
use crate::backup::{DestinationTarget, DriveKind, FailedFile, RunOutcome, SkipReason};
use crate::utils::log_buffer::LogBuffer;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

pub type EventSender = mpsc::UnboundedSender<ProgressEvent>;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    PhaseChanged(Phase),
    /// Drive classification and worker sizing resolved at run start
    DestinationResolved {
        destination: usize,
        kind: DriveKind,
        workers: usize,
    },
    SourceAnalyzed {
        files: u64,
        bytes: u64,
    },
    ManifestFileHashed {
        relative_path: PathBuf,
        size: u64,
    },
    ManifestBuilt {
        files: u64,
        bytes: u64,
        warnings: usize,
    },
    AnalysisReady {
        destination: usize,
        exact: usize,
        renamed: usize,
        unique: usize,
        bytes_saved: u64,
    },
    FileStarted {
        destination: usize,
        relative_path: PathBuf,
    },
    /// Absolute per-file byte progress; restarts from zero on a retry
    FileProgress {
        destination: usize,
        relative_path: PathBuf,
        bytes_done: u64,
    },
    FileQuarantined {
        destination: usize,
        relative_path: PathBuf,
        quarantine_path: PathBuf,
    },
    FileCompleted {
        destination: usize,
        relative_path: PathBuf,
        bytes: u64,
        retries: u32,
    },
    FileSkipped {
        destination: usize,
        relative_path: PathBuf,
        bytes: u64,
        reason: SkipReason,
    },
    FileFailed {
        destination: usize,
        relative_path: PathBuf,
        error: String,
    },
    FileVerified {
        destination: usize,
        relative_path: PathBuf,
    },
    DestinationFinished {
        destination: usize,
    },
    RunFinished {
        outcome: RunOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationState {
    Waiting,
    Copying,
    Verifying,
    Complete,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationProgress {
    pub root: PathBuf,
    pub kind: DriveKind,
    pub workers: usize,
    pub state: DestinationState,
    pub files_total: u64,
    pub bytes_total: u64,
    pub files_completed: u64,
    pub bytes_copied: u64,
    pub files_skipped: u64,
    pub bytes_skipped: u64,
    pub files_quarantined: u64,
    pub files_failed: u64,
    pub files_verified: u64,
    pub retries: u64,
    pub duplicates_exact: u64,
    pub duplicates_renamed: u64,
    pub current_file: Option<String>,
}

impl DestinationProgress {
    fn new(target: &DestinationTarget) -> Self {
        Self {
            root: target.root.clone(),
            kind: target.kind,
            workers: target.workers,
            state: DestinationState::Waiting,
            files_total: 0,
            bytes_total: 0,
            files_completed: 0,
            bytes_copied: 0,
            files_skipped: 0,
            bytes_skipped: 0,
            files_quarantined: 0,
            files_failed: 0,
            files_verified: 0,
            retries: 0,
            duplicates_exact: 0,
            duplicates_renamed: 0,
            current_file: None,
        }
    }
}

/// Plain-data view of the whole run, renderable by any front end or logged
/// headlessly. Rebuilt continuously from worker events.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub phase: Phase,
    /// 0.0..=1.0, monotonically non-decreasing within a run
    pub overall: f64,
    pub manifest_files: u64,
    pub manifest_bytes: u64,
    pub bytes_per_second: u64,
    pub eta_seconds: Option<u64>,
    pub current_file: Option<String>,
    pub last_error: Option<String>,
    pub failed_files: Vec<FailedFile>,
    pub destinations: Vec<DestinationProgress>,
    pub outcome: Option<RunOutcome>,
    pub started_at: i64,
}

/// How often at most the broadcast ring gets a fresh snapshot.
const BROADCAST_INTERVAL: Duration = Duration::from_millis(200);
/// Sliding window for the speed estimate.
const SPEED_WINDOW: Duration = Duration::from_secs(5);

pub struct ProgressAggregator {
    snapshot: Arc<RwLock<ProgressSnapshot>>,
    sender: EventSender,
    broadcast_tx: broadcast::Sender<ProgressSnapshot>,
}

impl ProgressAggregator {
    pub fn new(run_id: uuid::Uuid, destinations: &[DestinationTarget], log: LogBuffer) -> Self {
        let snapshot = Arc::new(RwLock::new(ProgressSnapshot {
            run_id: run_id.to_string(),
            phase: Phase::Idle,
            overall: 0.0,
            manifest_files: 0,
            manifest_bytes: 0,
            bytes_per_second: 0,
            eta_seconds: None,
            current_file: None,
            last_error: None,
            failed_files: Vec::new(),
            destinations: destinations.iter().map(DestinationProgress::new).collect(),
            outcome: None,
            started_at: chrono::Utc::now().timestamp(),
        }));

        let (sender, receiver) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(64);

        let mut state = AggState {
            snapshot: snapshot.clone(),
            broadcast: broadcast_tx.clone(),
            log,
            labels: destinations.iter().map(|d| d.label()).collect(),
            inflight: HashMap::new(),
            estimated_files: 0,
            hashed_files: 0,
            samples: VecDeque::new(),
            verify_totals: vec![0; destinations.len()],
            verify_processed: vec![0; destinations.len()],
            last_broadcast: Instant::now()
                .checked_sub(BROADCAST_INTERVAL)
                .unwrap_or_else(Instant::now),
        };
        tokio::spawn(async move {
            let mut receiver = receiver;
            while let Some(event) = receiver.recv().await {
                state.fold(event);
            }
        });

        Self {
            snapshot,
            sender,
            broadcast_tx,
        }
    }

    /// Channel workers publish into; a send never blocks.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.broadcast_tx.subscribe()
    }
}

struct AggState {
    snapshot: Arc<RwLock<ProgressSnapshot>>,
    broadcast: broadcast::Sender<ProgressSnapshot>,
    log: LogBuffer,
    labels: Vec<String>,
    /// (destination, relative path) -> bytes copied so far for in-flight files
    inflight: HashMap<(usize, PathBuf), u64>,
    estimated_files: u64,
    hashed_files: u64,
    /// (when, cumulative done bytes) samples for the speed window
    samples: VecDeque<(Instant, u64)>,
    verify_totals: Vec<u64>,
    verify_processed: Vec<u64>,
    last_broadcast: Instant,
}

impl AggState {
    fn fold(&mut self, event: ProgressEvent) {
        let mut force_broadcast = false;
        let snapshot = Arc::clone(&self.snapshot);
        {
            let mut snap = snapshot.write();
            match event {
                ProgressEvent::PhaseChanged(phase) => {
                    snap.phase = phase;
                    force_broadcast = true;
                    self.log
                        .add_log("info", format!("Entering phase: {phase}"), None);
                    match phase {
                        Phase::CopyingFiles => {
                            for dest in &mut snap.destinations {
                                dest.state = DestinationState::Copying;
                            }
                        }
                        Phase::VerifyingDestinations => {
                            for (i, dest) in snap.destinations.iter_mut().enumerate() {
                                dest.state = DestinationState::Verifying;
                                self.verify_totals[i] = dest.files_completed;
                            }
                        }
                        Phase::Complete => {
                            for dest in &mut snap.destinations {
                                dest.state = DestinationState::Complete;
                            }
                        }
                        _ => {}
                    }
                }
                ProgressEvent::DestinationResolved {
                    destination,
                    kind,
                    workers,
                } => {
                    if let Some(dest) = snap.destinations.get_mut(destination) {
                        dest.kind = kind;
                        dest.workers = workers;
                    }
                    self.log.add_log(
                        "info",
                        format!("Classified as {kind:?}, {workers} worker(s)"),
                        self.labels.get(destination).cloned(),
                    );
                }
                ProgressEvent::SourceAnalyzed { files, bytes } => {
                    self.estimated_files = files;
                    snap.manifest_files = files;
                    snap.manifest_bytes = bytes;
                }
                ProgressEvent::ManifestFileHashed { .. } => {
                    self.hashed_files += 1;
                }
                ProgressEvent::ManifestBuilt {
                    files,
                    bytes,
                    warnings,
                } => {
                    snap.manifest_files = files;
                    snap.manifest_bytes = bytes;
                    for dest in &mut snap.destinations {
                        dest.files_total = files;
                        dest.bytes_total = bytes;
                    }
                    if warnings > 0 {
                        self.log.add_log(
                            "warn",
                            format!("{warnings} file(s) excluded from the manifest"),
                            None,
                        );
                    }
                }
                ProgressEvent::AnalysisReady {
                    destination,
                    exact,
                    renamed,
                    unique,
                    bytes_saved,
                } => {
                    if let Some(dest) = snap.destinations.get_mut(destination) {
                        dest.duplicates_exact = exact as u64;
                        dest.duplicates_renamed = renamed as u64;
                    }
                    self.log.add_log(
                        "info",
                        format!(
                            "Duplicates: {exact} exact, {renamed} renamed, {unique} unique \
                             ({bytes_saved} bytes reclaimable)"
                        ),
                        self.labels.get(destination).cloned(),
                    );
                }
                ProgressEvent::FileStarted {
                    destination,
                    relative_path,
                } => {
                    let name = relative_path.to_string_lossy().to_string();
                    if let Some(dest) = snap.destinations.get_mut(destination) {
                        dest.current_file = Some(name.clone());
                    }
                    snap.current_file = Some(name);
                    self.inflight.insert((destination, relative_path), 0);
                }
                ProgressEvent::FileProgress {
                    destination,
                    relative_path,
                    bytes_done,
                } => {
                    self.inflight.insert((destination, relative_path), bytes_done);
                }
                ProgressEvent::FileQuarantined {
                    destination,
                    relative_path,
                    quarantine_path,
                } => {
                    if let Some(dest) = snap.destinations.get_mut(destination) {
                        dest.files_quarantined += 1;
                    }
                    self.log.add_log(
                        "warn",
                        format!(
                            "Quarantined {} -> {}",
                            relative_path.display(),
                            quarantine_path.display()
                        ),
                        self.labels.get(destination).cloned(),
                    );
                }
                ProgressEvent::FileCompleted {
                    destination,
                    relative_path,
                    bytes,
                    retries,
                } => {
                    self.inflight.remove(&(destination, relative_path));
                    if let Some(dest) = snap.destinations.get_mut(destination) {
                        dest.files_completed += 1;
                        dest.bytes_copied += bytes;
                        dest.retries += retries as u64;
                        dest.current_file = None;
                    }
                }
                ProgressEvent::FileSkipped {
                    destination,
                    relative_path,
                    bytes,
                    reason: _,
                } => {
                    self.inflight.remove(&(destination, relative_path));
                    if let Some(dest) = snap.destinations.get_mut(destination) {
                        dest.files_skipped += 1;
                        dest.bytes_skipped += bytes;
                        dest.current_file = None;
                    }
                }
                ProgressEvent::FileFailed {
                    destination,
                    relative_path,
                    error,
                } => {
                    self.inflight.remove(&(destination, relative_path.clone()));
                    if let Some(dest) = snap.destinations.get_mut(destination) {
                        dest.files_failed += 1;
                        dest.current_file = None;
                    }
                    if snap.phase == Phase::VerifyingDestinations {
                        if let Some(processed) = self.verify_processed.get_mut(destination) {
                            *processed += 1;
                        }
                    }
                    self.log.add_log(
                        "error",
                        format!("{}: {error}", relative_path.display()),
                        self.labels.get(destination).cloned(),
                    );
                    snap.last_error = Some(error.clone());
                    snap.failed_files.push(FailedFile {
                        destination,
                        relative_path,
                        error,
                    });
                }
                ProgressEvent::FileVerified { destination, .. } => {
                    if let Some(dest) = snap.destinations.get_mut(destination) {
                        dest.files_verified += 1;
                    }
                    if let Some(processed) = self.verify_processed.get_mut(destination) {
                        *processed += 1;
                    }
                }
                ProgressEvent::DestinationFinished { destination } => {
                    force_broadcast = true;
                    if let Some(dest) = snap.destinations.get_mut(destination) {
                        dest.current_file = None;
                    }
                }
                ProgressEvent::RunFinished { outcome } => {
                    force_broadcast = true;
                    let summary = match &outcome {
                        RunOutcome::CompletedClean => "Backup completed clean".to_string(),
                        RunOutcome::CompletedWithFailures { failed_files } => {
                            format!("Backup completed with {} failure(s)", failed_files.len())
                        }
                        RunOutcome::Cancelled => "Backup cancelled".to_string(),
                    };
                    self.log.add_log("info", summary, None);
                    snap.outcome = Some(outcome);
                }
            }

            self.update_rates(&mut snap);
        }

        self.maybe_broadcast(force_broadcast);
    }

    fn update_rates(&mut self, snap: &mut ProgressSnapshot) {
        let dest_count = snap.destinations.len().max(1) as u64;
        let copy_total = snap.manifest_bytes * dest_count;
        let copy_done: u64 = snap
            .destinations
            .iter()
            .map(|d| d.bytes_copied + d.bytes_skipped)
            .sum::<u64>()
            + self.inflight.values().sum::<u64>();

        // Speed over a sliding window of cumulative done-bytes samples
        let now = Instant::now();
        self.samples.push_back((now, copy_done));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > SPEED_WINDOW && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        let speed = match (self.samples.front(), self.samples.back()) {
            (Some(&(t0, b0)), Some(&(t1, b1))) if t1 > t0 => {
                let dt = t1.duration_since(t0).as_secs_f64();
                if dt > 0.1 {
                    (b1.saturating_sub(b0) as f64 / dt) as u64
                } else {
                    snap.bytes_per_second
                }
            }
            _ => 0,
        };
        snap.bytes_per_second = speed;
        snap.eta_seconds = if snap.phase == Phase::CopyingFiles && speed > 0 {
            Some(copy_total.saturating_sub(copy_done) / speed)
        } else {
            None
        };

        let fraction = match snap.phase {
            Phase::Idle | Phase::AnalyzingSource | Phase::FlushingToDisk => 0.0,
            Phase::BuildingManifest => {
                if self.estimated_files > 0 {
                    (self.hashed_files as f64 / self.estimated_files as f64).min(1.0)
                } else {
                    0.0
                }
            }
            Phase::CopyingFiles => {
                if copy_total > 0 {
                    (copy_done as f64 / copy_total as f64).min(1.0)
                } else {
                    1.0
                }
            }
            Phase::VerifyingDestinations => {
                let total: u64 = self.verify_totals.iter().sum();
                let processed: u64 = self.verify_processed.iter().sum();
                if total > 0 {
                    (processed as f64 / total as f64).min(1.0)
                } else {
                    1.0
                }
            }
            Phase::Complete => 0.0,
        };

        let computed = snap.phase.progress_base() + snap.phase.progress_span() * fraction;
        // Monotonic within a run even across phase-weight boundaries
        if computed > snap.overall {
            snap.overall = computed;
        }
    }

    fn maybe_broadcast(&mut self, force: bool) {
        if force || self.last_broadcast.elapsed() >= BROADCAST_INTERVAL {
            self.last_broadcast = Instant::now();
            let _ = self.broadcast.send(self.snapshot.read().clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::DriveKind;
    use std::time::Duration;

    fn target(index: usize) -> DestinationTarget {
        DestinationTarget {
            index,
            root: PathBuf::from(format!("/dst/{index}")),
            effective_root: PathBuf::from(format!("/dst/{index}")),
            kind: DriveKind::Ssd,
            workers: 2,
        }
    }

    async fn wait_for(
        agg: &ProgressAggregator,
        mut cond: impl FnMut(&ProgressSnapshot) -> bool,
    ) -> ProgressSnapshot {
        for _ in 0..200 {
            let snap = agg.snapshot();
            if cond(&snap) {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("aggregator never reached expected state: {:?}", agg.snapshot());
    }

    #[tokio::test]
    async fn counters_follow_worker_events() {
        let agg = ProgressAggregator::new(
            uuid::Uuid::new_v4(),
            &[target(0), target(1)],
            LogBuffer::new(100),
        );
        let tx = agg.sender();

        tx.send(ProgressEvent::ManifestBuilt {
            files: 3,
            bytes: 300,
            warnings: 0,
        })
        .unwrap();
        tx.send(ProgressEvent::PhaseChanged(Phase::CopyingFiles))
            .unwrap();
        tx.send(ProgressEvent::FileStarted {
            destination: 0,
            relative_path: "a.jpg".into(),
        })
        .unwrap();
        tx.send(ProgressEvent::FileCompleted {
            destination: 0,
            relative_path: "a.jpg".into(),
            bytes: 100,
            retries: 1,
        })
        .unwrap();
        tx.send(ProgressEvent::FileSkipped {
            destination: 1,
            relative_path: "a.jpg".into(),
            bytes: 100,
            reason: SkipReason::ExactDuplicate,
        })
        .unwrap();

        let snap = wait_for(&agg, |s| {
            s.destinations[0].files_completed == 1 && s.destinations[1].files_skipped == 1
        })
        .await;

        assert_eq!(snap.destinations[0].bytes_copied, 100);
        assert_eq!(snap.destinations[0].retries, 1);
        assert_eq!(snap.destinations[1].bytes_skipped, 100);
        assert_eq!(snap.destinations[0].files_total, 3);
    }

    #[tokio::test]
    async fn failures_accumulate_into_the_failed_list() {
        let agg =
            ProgressAggregator::new(uuid::Uuid::new_v4(), &[target(0)], LogBuffer::new(100));
        let tx = agg.sender();

        tx.send(ProgressEvent::FileFailed {
            destination: 0,
            relative_path: "bad.jpg".into(),
            error: "permission denied".into(),
        })
        .unwrap();

        let snap = wait_for(&agg, |s| !s.failed_files.is_empty()).await;
        assert_eq!(snap.failed_files[0].relative_path, PathBuf::from("bad.jpg"));
        assert_eq!(snap.last_error.as_deref(), Some("permission denied"));
        assert_eq!(snap.destinations[0].files_failed, 1);
    }

    #[tokio::test]
    async fn overall_progress_is_monotone_across_phases() {
        let agg =
            ProgressAggregator::new(uuid::Uuid::new_v4(), &[target(0)], LogBuffer::new(100));
        let tx = agg.sender();

        let mut last = 0.0f64;
        let script = [
            ProgressEvent::PhaseChanged(Phase::AnalyzingSource),
            ProgressEvent::SourceAnalyzed { files: 2, bytes: 200 },
            ProgressEvent::PhaseChanged(Phase::BuildingManifest),
            ProgressEvent::ManifestFileHashed {
                relative_path: "a.jpg".into(),
                size: 100,
            },
            ProgressEvent::ManifestBuilt {
                files: 2,
                bytes: 200,
                warnings: 0,
            },
            ProgressEvent::PhaseChanged(Phase::CopyingFiles),
            ProgressEvent::FileCompleted {
                destination: 0,
                relative_path: "a.jpg".into(),
                bytes: 100,
                retries: 0,
            },
            ProgressEvent::FileCompleted {
                destination: 0,
                relative_path: "b.jpg".into(),
                bytes: 100,
                retries: 0,
            },
            ProgressEvent::PhaseChanged(Phase::FlushingToDisk),
            ProgressEvent::PhaseChanged(Phase::VerifyingDestinations),
            ProgressEvent::FileVerified {
                destination: 0,
                relative_path: "a.jpg".into(),
            },
            ProgressEvent::FileVerified {
                destination: 0,
                relative_path: "b.jpg".into(),
            },
            ProgressEvent::PhaseChanged(Phase::Complete),
        ];

        for (i, event) in script.into_iter().enumerate() {
            tx.send(event).unwrap();
            // Give the aggregator a chance to fold before sampling
            tokio::time::sleep(Duration::from_millis(15)).await;
            let snap = agg.snapshot();
            assert!(
                snap.overall + 1e-9 >= last,
                "overall went backward at step {i}: {} < {last}",
                snap.overall
            );
            last = snap.overall;
        }

        let final_snap = wait_for(&agg, |s| s.phase == Phase::Complete).await;
        assert!(final_snap.overall >= Phase::Complete.progress_base() - 1e-9);
    }

    #[tokio::test]
    async fn verify_denominator_is_the_copy_completed_count() {
        let agg =
            ProgressAggregator::new(uuid::Uuid::new_v4(), &[target(0)], LogBuffer::new(100));
        let tx = agg.sender();

        tx.send(ProgressEvent::ManifestBuilt {
            files: 10,
            bytes: 1000,
            warnings: 0,
        })
        .unwrap();
        tx.send(ProgressEvent::PhaseChanged(Phase::CopyingFiles))
            .unwrap();
        for i in 0..2 {
            tx.send(ProgressEvent::FileCompleted {
                destination: 0,
                relative_path: format!("{i}.jpg").into(),
                bytes: 100,
                retries: 0,
            })
            .unwrap();
        }
        tx.send(ProgressEvent::PhaseChanged(Phase::FlushingToDisk))
            .unwrap();
        tx.send(ProgressEvent::PhaseChanged(Phase::VerifyingDestinations))
            .unwrap();
        tx.send(ProgressEvent::FileVerified {
            destination: 0,
            relative_path: "0.jpg".into(),
        })
        .unwrap();
        tx.send(ProgressEvent::FileVerified {
            destination: 0,
            relative_path: "1.jpg".into(),
        })
        .unwrap();

        // Both copy-completed files verified -> verify phase fully consumed
        let snap = wait_for(&agg, |s| s.destinations[0].files_verified == 2).await;
        let expected = Phase::VerifyingDestinations.progress_base()
            + Phase::VerifyingDestinations.progress_span();
        assert!((snap.overall - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn broadcast_carries_phase_transitions() {
        let agg =
            ProgressAggregator::new(uuid::Uuid::new_v4(), &[target(0)], LogBuffer::new(100));
        let mut rx = agg.subscribe();
        let tx = agg.sender();

        tx.send(ProgressEvent::PhaseChanged(Phase::AnalyzingSource))
            .unwrap();
        let snap = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("broadcast timed out")
            .expect("broadcast closed");
        assert_eq!(snap.phase, Phase::AnalyzingSource);
    }
}
