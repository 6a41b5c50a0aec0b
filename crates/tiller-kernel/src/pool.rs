use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps how many top-level rollouts run at once.
#[derive(Debug, Clone)]
pub struct RolloutPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl RolloutPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Workers currently running a rollout.
    pub fn busy(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    /// Wait for a free worker. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .context("rollout pool closed")
    }
}
