//! Copy scheduling: one bounded worker pool per destination, fed in manifest
//! order. Destinations are fully independent: each has its own queue, its
//! own workers, and its own counters, so a slow network share never throttles
//! a local SSD. Completion order within a pool is unspecified.

use crate::backup::duplicates::{DuplicateAnalysis, DuplicatePolicy};
use crate::backup::manifest::{Manifest, ManifestEntry};
use crate::backup::progress::{EventSender, ProgressEvent};
use crate::backup::worker::{TaskProcessor, TaskResult};
use crate::backup::{DestinationTarget, TaskState};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Copy,
    Verify,
}

/// Everything one destination needs for a pass.
pub struct DestinationRun {
    pub target: DestinationTarget,
    pub analysis: DuplicateAnalysis,
    pub processor: Arc<dyn TaskProcessor>,
}

/// Outcome of one pool pass over one destination.
#[derive(Default)]
pub struct PoolOutcome {
    pub results: Vec<(Arc<ManifestEntry>, TaskResult)>,
}

impl PoolOutcome {
    /// Entries that finished the copy pass and therefore enter verification.
    pub fn completed(&self) -> Vec<Arc<ManifestEntry>> {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r.state, TaskState::Complete | TaskState::Quarantined))
            .map(|(e, _)| Arc::clone(e))
            .collect()
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.results.iter().filter(|(_, r)| r.state == state).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Arc<ManifestEntry>, &TaskResult)> {
        self.results
            .iter()
            .filter(|(_, r)| r.state == TaskState::Failed)
            .map(|(e, r)| (e, r))
    }
}

/// Bounded pool of concurrent workers for a single destination. Tasks are
/// handed to idle workers strictly in queue order; the bounded channel gives
/// the feeder backpressure.
pub struct DestinationWorkerPool {
    destination: DestinationTarget,
    processor: Arc<dyn TaskProcessor>,
    events: EventSender,
    cancel: CancellationToken,
}

impl DestinationWorkerPool {
    pub fn new(
        destination: DestinationTarget,
        processor: Arc<dyn TaskProcessor>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            destination,
            processor,
            events,
            cancel,
        }
    }

    pub async fn run(&self, entries: Vec<Arc<ManifestEntry>>, pass: Pass) -> PoolOutcome {
        let workers = self.destination.workers.max(1);
        info!(
            "{:?} pass for {}: {} task(s), {} worker(s)",
            pass,
            self.destination.label(),
            entries.len(),
            workers
        );

        let (queue_tx, queue_rx) = mpsc::channel::<Arc<ManifestEntry>>(workers * 2);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let queue_rx = Arc::clone(&queue_rx);
            let processor = Arc::clone(&self.processor);
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut results = Vec::new();
                loop {
                    // Holding the lock across recv is the handout discipline:
                    // exactly one idle worker waits on the queue at a time,
                    // so tasks are taken in queue order.
                    let entry = { queue_rx.lock().await.recv().await };
                    let Some(entry) = entry else { break };
                    if cancel.is_cancelled() {
                        debug!("Worker {worker_id} stopping at cancellation checkpoint");
                        break;
                    }
                    let result = match pass {
                        Pass::Copy => processor.process_copy(worker_id, &entry).await,
                        Pass::Verify => processor.process_verify(worker_id, &entry).await,
                    };
                    results.push((entry, result));
                }
                results
            }));
        }

        // Feed in manifest order; stop offering new tasks once cancelled.
        // The select matters: workers stop pulling after cancellation, so a
        // bare send on the full queue would wait forever.
        let mut fed = true;
        for entry in entries {
            if self.cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                sent = queue_tx.send(entry) => {
                    if sent.is_err() {
                        fed = false;
                    }
                }
                _ = self.cancel.cancelled() => {
                    fed = false;
                }
            }
            if !fed {
                break;
            }
        }
        drop(queue_tx);

        let mut outcome = PoolOutcome::default();
        for handle in handles {
            if let Ok(results) = handle.await {
                outcome.results.extend(results);
            }
        }

        let _ = self.events.send(ProgressEvent::DestinationFinished {
            destination: self.destination.index,
        });
        outcome
    }
}

/// Applies the duplicate-skip policy and drives every destination's pool;
/// pools run concurrently and finish independently.
pub struct CopyScheduler {
    manifest: Arc<Manifest>,
    policy: DuplicatePolicy,
    events: EventSender,
    cancel: CancellationToken,
}

impl CopyScheduler {
    pub fn new(
        manifest: Arc<Manifest>,
        policy: DuplicatePolicy,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manifest,
            policy,
            events,
            cancel,
        }
    }

    /// The per-destination task list: manifest order, minus policy skips.
    /// Skips are reported immediately so they count toward progress.
    fn plan(&self, run: &DestinationRun) -> Vec<Arc<ManifestEntry>> {
        let mut plan = Vec::with_capacity(self.manifest.len());
        for entry in self.manifest.entries() {
            match run
                .analysis
                .skip_reason(&entry.relative_path, self.policy)
            {
                Some(reason) => {
                    let _ = self.events.send(ProgressEvent::FileSkipped {
                        destination: run.target.index,
                        relative_path: entry.relative_path.clone(),
                        bytes: entry.size,
                        reason,
                    });
                }
                None => plan.push(Arc::new(entry.clone())),
            }
        }
        plan
    }

    pub async fn run_copy_phase(&self, runs: &[DestinationRun]) -> Vec<PoolOutcome> {
        let pools = runs.iter().map(|run| {
            let plan = self.plan(run);
            let pool = DestinationWorkerPool::new(
                run.target.clone(),
                Arc::clone(&run.processor),
                self.events.clone(),
                self.cancel.clone(),
            );
            async move { pool.run(plan, Pass::Copy).await }
        });
        join_all(pools).await
    }

    /// Verify exactly the entries that completed the copy pass. Runs under
    /// its own token so files already on disk still get verified after a
    /// mid-run cancellation.
    pub async fn run_verify_phase(
        &self,
        runs: &[DestinationRun],
        completed: Vec<Vec<Arc<ManifestEntry>>>,
        cancel: CancellationToken,
    ) -> Vec<PoolOutcome> {
        let pools = runs.iter().zip(completed).map(|(run, entries)| {
            let pool = DestinationWorkerPool::new(
                run.target.clone(),
                Arc::clone(&run.processor),
                self.events.clone(),
                cancel.clone(),
            );
            async move { pool.run(entries, Pass::Verify).await }
        });
        join_all(pools).await
    }
}
