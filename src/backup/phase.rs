//! The ordered backup phase machine.

use crate::backup::progress::{EventSender, ProgressEvent};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::info;

/// Strictly ordered run phases; a run never moves backward. `Idle` is both
/// the initial state and the state after cancellation or completion
/// acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Idle,
    AnalyzingSource,
    BuildingManifest,
    CopyingFiles,
    /// Barrier: OS write buffers are forced out before verification reads,
    /// so a verify pass can never succeed on buffered-but-unpersisted data.
    FlushingToDisk,
    VerifyingDestinations,
    Complete,
}

impl Phase {
    /// Overall-progress weight base for this phase. Copy dominates
    /// wall-clock time, so it dominates the weighting; weights within a
    /// phase then interpolate to the next base.
    pub fn progress_base(self) -> f64 {
        match self {
            Phase::Idle => 0.0,
            Phase::AnalyzingSource => 0.0,
            Phase::BuildingManifest => 0.02,
            Phase::CopyingFiles => 0.12,
            Phase::FlushingToDisk => 0.80,
            Phase::VerifyingDestinations => 0.82,
            Phase::Complete => 1.0,
        }
    }

    pub fn progress_span(self) -> f64 {
        match self {
            Phase::Idle => 0.0,
            Phase::AnalyzingSource => 0.02,
            Phase::BuildingManifest => 0.10,
            Phase::CopyingFiles => 0.68,
            Phase::FlushingToDisk => 0.02,
            Phase::VerifyingDestinations => 0.18,
            Phase::Complete => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::AnalyzingSource => "analyzing-source",
            Phase::BuildingManifest => "building-manifest",
            Phase::CopyingFiles => "copying-files",
            Phase::FlushingToDisk => "flushing-to-disk",
            Phase::VerifyingDestinations => "verifying-destinations",
            Phase::Complete => "complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives the run through its phases and exposes the current one to
/// observers through a watch channel.
pub struct PhaseCoordinator {
    current: watch::Sender<Phase>,
    events: EventSender,
}

impl PhaseCoordinator {
    pub fn new(events: EventSender) -> Self {
        let (current, _) = watch::channel(Phase::Idle);
        Self { current, events }
    }

    pub fn current(&self) -> Phase {
        *self.current.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<Phase> {
        self.current.subscribe()
    }

    /// Move forward to `next`. Backward transitions are a programming error
    /// and rejected; returning to `Idle` goes through [`Self::reset`].
    pub fn advance(&self, next: Phase) -> Result<()> {
        let current = self.current();
        if next <= current {
            return Err(EngineError::Phase {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        info!("Phase: {current} -> {next}");
        let _ = self.current.send(next);
        let _ = self.events.send(ProgressEvent::PhaseChanged(next));
        Ok(())
    }

    /// Return to `Idle` after cancellation or completion acknowledgment.
    pub fn reset(&self) {
        let _ = self.current.send(Phase::Idle);
        let _ = self.events.send(ProgressEvent::PhaseChanged(Phase::Idle));
    }
}
