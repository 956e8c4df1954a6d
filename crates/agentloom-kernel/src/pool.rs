//! Bounded worker pool.
//!
//! Parallel workflows run their tasks as tokio tasks, but only as many at a
//! time as the pool has slots.  A slot is an owned semaphore permit; it is
//! released when the permit is dropped, whether the task finished, failed,
//! timed out or was aborted.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{KernelError, Result};

/// Shared concurrency limit for parallel task execution.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    /// Create a pool with `capacity` slots.  Zero is rejected.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(KernelError::InvalidPoolSize);
        }
        tracing::debug!(capacity, "worker pool created");
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Twice the number of available CPUs.
    pub fn default_capacity() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            * 2
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| KernelError::WorkerPoolClosed)
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop handing out slots.  Pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        let capacity = Self::default_capacity();
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }
}
