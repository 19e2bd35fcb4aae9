//! Per-file task processing: the conflict check, the streamed copy, and the
//! verification hand-off all live here. One `CopyWorker` is shared by all of
//! a destination's pool workers; per-task state stays on the stack.

use crate::backup::manifest::ManifestEntry;
use crate::backup::progress::{EventSender, ProgressEvent};
use crate::backup::quarantine::{QuarantineManager, ReconcileAction};
use crate::backup::retry::RetryController;
use crate::backup::verify::VerificationEngine;
use crate::backup::{DestinationTarget, SkipReason, TaskState};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Suffix for in-progress copies; a partial file is renamed into place only
/// after its bytes are on disk, so no destination path ever holds a torn file.
const PARTIAL_SUFFIX: &str = ".svpart";

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub state: TaskState,
    pub retries: u32,
    pub error: Option<String>,
}

impl TaskResult {
    fn done(state: TaskState, retries: u32) -> Self {
        Self {
            state,
            retries,
            error: None,
        }
    }

    fn failed(retries: u32, error: String) -> Self {
        Self {
            state: TaskState::Failed,
            retries,
            error: Some(error),
        }
    }

    /// Task was never processed (cancellation hit first)
    fn not_run() -> Self {
        Self {
            state: TaskState::Pending,
            retries: 0,
            error: None,
        }
    }
}

/// Seam between the pool and the per-file work, so the pool machinery stays
/// independent of copy semantics.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process_copy(&self, worker_id: usize, entry: &ManifestEntry) -> TaskResult;
    async fn process_verify(&self, worker_id: usize, entry: &ManifestEntry) -> TaskResult;
}

pub struct CopyWorker {
    destination: DestinationTarget,
    quarantine: Arc<QuarantineManager>,
    verifier: VerificationEngine,
    retry: RetryController,
    events: EventSender,
    cancel: CancellationToken,
    chunk_size: usize,
}

impl CopyWorker {
    pub fn new(
        destination: DestinationTarget,
        quarantine: Arc<QuarantineManager>,
        verifier: VerificationEngine,
        retry: RetryController,
        events: EventSender,
        cancel: CancellationToken,
        chunk_size: usize,
    ) -> Self {
        Self {
            destination,
            quarantine,
            verifier,
            retry,
            events,
            cancel,
            chunk_size: chunk_size.max(64 * 1024),
        }
    }

    fn destination_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.destination.effective_root.join(&entry.relative_path)
    }

    /// Conflict check through the quarantine manager, off the async threads.
    /// Once the underlying rename starts it always completes; cancellation is
    /// only observed between tasks and between copy chunks.
    async fn reconcile(&self, entry: &ManifestEntry, dest_path: &Path) -> Result<ReconcileAction> {
        let quarantine = Arc::clone(&self.quarantine);
        let dest = dest_path.to_path_buf();
        let relative = entry.relative_path.clone();
        let incoming = entry.checksum.clone();
        tokio::task::spawn_blocking(move || quarantine.reconcile(&dest, &relative, &incoming))
            .await
            .map_err(|e| {
                EngineError::io(dest_path, std::io::Error::new(std::io::ErrorKind::Other, e))
            })?
    }

    /// Stream the source file into place via a partial file and an atomic
    /// rename. Cancellation is checked per chunk; any abort removes the
    /// partial so the destination never holds torn data.
    async fn stream_copy(&self, entry: &ManifestEntry, dest_path: &Path) -> Result<()> {
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::io(parent, e))?;
        }

        let mut partial = dest_path.as_os_str().to_owned();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        if let Err(e) = self.copy_bytes(entry, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, dest_path)
            .await
            .map_err(|e| EngineError::io(dest_path, e))
    }

    async fn copy_bytes(&self, entry: &ManifestEntry, partial: &Path) -> Result<()> {
        let mut source = tokio::fs::File::open(&entry.source_path)
            .await
            .map_err(|e| EngineError::io(&entry.source_path, e))?;
        let mut out = tokio::fs::File::create(partial)
            .await
            .map_err(|e| EngineError::io(partial, e))?;

        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let mut done: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            buf.clear();
            let n = source
                .read_buf(&mut buf)
                .await
                .map_err(|e| EngineError::io(&entry.source_path, e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf)
                .await
                .map_err(|e| EngineError::io(partial, e))?;
            done += n as u64;
            let _ = self.events.send(ProgressEvent::FileProgress {
                destination: self.destination.index,
                relative_path: entry.relative_path.clone(),
                bytes_done: done,
            });
        }

        // Durable before the rename; the flush phase later syncs directories
        out.sync_all()
            .await
            .map_err(|e| EngineError::io(partial, e))
    }
}

#[async_trait]
impl TaskProcessor for CopyWorker {
    async fn process_copy(&self, worker_id: usize, entry: &ManifestEntry) -> TaskResult {
        if self.cancel.is_cancelled() {
            return TaskResult::not_run();
        }

        let dest_path = self.destination_path(entry);
        let _ = self.events.send(ProgressEvent::FileStarted {
            destination: self.destination.index,
            relative_path: entry.relative_path.clone(),
        });
        debug!(
            "Worker {} copying {} -> {}",
            worker_id,
            entry.relative_path.display(),
            dest_path.display()
        );

        // Conflict check; hash reads on a flaky share deserve retries too
        let action = match self
            .retry
            .run("conflict check", || self.reconcile(entry, &dest_path))
            .await
        {
            Ok((action, _)) => action,
            Err(EngineError::Cancelled) => return TaskResult::not_run(),
            Err(e) => {
                let _ = self.events.send(ProgressEvent::FileFailed {
                    destination: self.destination.index,
                    relative_path: entry.relative_path.clone(),
                    error: e.to_string(),
                });
                return TaskResult::failed(0, e.to_string());
            }
        };

        let mut quarantined = false;
        match action {
            ReconcileAction::Proceed => {}
            ReconcileAction::SkipIdentical => {
                let _ = self.events.send(ProgressEvent::FileSkipped {
                    destination: self.destination.index,
                    relative_path: entry.relative_path.clone(),
                    bytes: entry.size,
                    reason: SkipReason::AlreadyPresent,
                });
                return TaskResult::done(TaskState::Skipped, 0);
            }
            ReconcileAction::QuarantinedThenProceed(record) => {
                quarantined = true;
                let _ = self.events.send(ProgressEvent::FileQuarantined {
                    destination: self.destination.index,
                    relative_path: entry.relative_path.clone(),
                    quarantine_path: record.quarantine_path,
                });
            }
        }

        match self
            .retry
            .run("copy", || self.stream_copy(entry, &dest_path))
            .await
        {
            Ok(((), retries)) => {
                let _ = self.events.send(ProgressEvent::FileCompleted {
                    destination: self.destination.index,
                    relative_path: entry.relative_path.clone(),
                    bytes: entry.size,
                    retries,
                });
                let state = if quarantined {
                    TaskState::Quarantined
                } else {
                    TaskState::Complete
                };
                TaskResult::done(state, retries)
            }
            Err(EngineError::Cancelled) => TaskResult::not_run(),
            Err(e) => {
                warn!(
                    "Worker {} failed to copy {}: {e}",
                    worker_id,
                    entry.relative_path.display()
                );
                let _ = self.events.send(ProgressEvent::FileFailed {
                    destination: self.destination.index,
                    relative_path: entry.relative_path.clone(),
                    error: e.to_string(),
                });
                TaskResult::failed(0, e.to_string())
            }
        }
    }

    async fn process_verify(&self, worker_id: usize, entry: &ManifestEntry) -> TaskResult {
        if self.cancel.is_cancelled() {
            return TaskResult::not_run();
        }

        let dest_path = self.destination_path(entry);
        debug!("Worker {} verifying {}", worker_id, dest_path.display());

        let first = self
            .retry
            .run("verify", || self.verifier.verify(&dest_path, entry))
            .await;

        let outcome = match first {
            Ok(_) => Ok(0),
            Err(EngineError::ChecksumMismatch { .. }) => {
                // One re-copy-and-re-verify cycle before the mismatch is terminal
                warn!(
                    "Checksum mismatch at {}, re-copying once",
                    dest_path.display()
                );
                match self
                    .retry
                    .run("re-copy", || self.stream_copy(entry, &dest_path))
                    .await
                {
                    Ok((_, retries)) => self
                        .retry
                        .run("re-verify", || self.verifier.verify(&dest_path, entry))
                        .await
                        .map(|_| retries),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(retries) => {
                let _ = self.events.send(ProgressEvent::FileVerified {
                    destination: self.destination.index,
                    relative_path: entry.relative_path.clone(),
                });
                TaskResult::done(TaskState::Complete, retries)
            }
            Err(EngineError::Cancelled) => TaskResult::not_run(),
            Err(e) => {
                let _ = self.events.send(ProgressEvent::FileFailed {
                    destination: self.destination.index,
                    relative_path: entry.relative_path.clone(),
                    error: e.to_string(),
                });
                TaskResult::failed(0, e.to_string())
            }
        }
    }
}
