//! Depth-indexed worker pools.
//!
//! Every task in a plan tree runs on the pool assigned to its depth. A
//! sub-plan at depth N must never share a pool with its parent at depth
//! N-1: the parent holds a slot while awaiting the child, and on a shared
//! pool a full recursion level could starve its own children into
//! deadlock. Each level therefore gets its own bounded pool; depths past
//! the configured maximum either reuse the deepest pool or fail fast,
//! depending on [`DepthOverflowPolicy`].

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Errors raised when submitting a task to a depth pool.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Depth exceeds the configured maximum and the policy rejects it.
    #[error("plan depth {depth} exceeds the configured maximum {max}")]
    DepthExceeded {
        /// Requested depth.
        depth: usize,
        /// Deepest configured level.
        max: usize,
    },

    /// The pool was shut down while waiting for a slot.
    #[error("worker pool closed")]
    Closed,
}

/// Behavior for depths past the deepest configured pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthOverflowPolicy {
    /// Deeper plans share the deepest configured pool.
    #[default]
    ReuseDeepest,
    /// Submissions past the maximum depth fail fast.
    Reject,
}

#[derive(Debug)]
struct PoolLevel {
    semaphore: Arc<Semaphore>,
    size: usize,
}

/// Pool provider mapping plan depth to a bounded worker pool.
#[derive(Debug)]
pub struct DepthPools {
    levels: Vec<PoolLevel>,
    policy: DepthOverflowPolicy,
}

impl DepthPools {
    /// Create pools with the given per-depth sizes.
    ///
    /// An empty or zero size falls back to one worker so no level can be
    /// permanently starved.
    #[must_use]
    pub fn new(sizes: &[usize], policy: DepthOverflowPolicy) -> Self {
        let sizes = if sizes.is_empty() { &[1][..] } else { sizes };
        let levels = sizes
            .iter()
            .map(|&size| {
                let size = size.max(1);
                PoolLevel {
                    semaphore: Arc::new(Semaphore::new(size)),
                    size,
                }
            })
            .collect();
        Self { levels, policy }
    }

    /// Deepest configured level index.
    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Configured size of the pool serving `depth`, `None` when the depth
    /// is rejected by policy.
    #[must_use]
    pub fn pool_size(&self, depth: usize) -> Option<usize> {
        self.level(depth).ok().map(|level| level.size)
    }

    fn level(&self, depth: usize) -> Result<&PoolLevel, PoolError> {
        if depth < self.levels.len() {
            return Ok(&self.levels[depth]);
        }
        match self.policy {
            // Levels are non-empty by construction.
            DepthOverflowPolicy::ReuseDeepest => self.levels.last().ok_or(PoolError::Closed),
            DepthOverflowPolicy::Reject => Err(PoolError::DepthExceeded {
                depth,
                max: self.max_depth(),
            }),
        }
    }

    /// Submit a task to the pool for `depth`.
    ///
    /// Waits until the level has a free slot, then spawns the task holding
    /// that slot for its whole duration. Backpressure is therefore applied
    /// at submission; a caller at depth N-1 waiting here never blocks the
    /// pool serving depth N-1 itself.
    pub async fn submit<F, T>(&self, depth: usize, task: F) -> Result<JoinHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let level = self.level(depth)?;
        let permit = Arc::clone(&level.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        debug!(depth, "Submitting task to depth pool");

        Ok(tokio::spawn(async move {
            let _permit = permit;
            task.await
        }))
    }
}
