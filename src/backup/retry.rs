//! Bounded exponential backoff for transient destination I/O.
//!
//! Network shares and removable media time out; the retry controller wraps
//! each destination operation so those failures get a few spaced attempts
//! before counting as terminal. Backoff sleeps only ever delay the owning
//! task; no lock is held across them.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_delay_ms);
        Duration::from_millis(exp)
    }
}

#[derive(Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    /// Run `op`, retrying transient failures with backoff. Returns the value
    /// and how many retries it took; non-transient errors surface on the
    /// first occurrence.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<(T, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok((value, retries)),
                Err(e) if e.is_transient() && retries + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(retries);
                    warn!(
                        "{label}: transient failure on attempt {}: {e}; retrying in {:?}",
                        retries + 1,
                        delay
                    );
                    retries += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
