use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Error, Debug)]
pub enum LimiterError {
    #[error("limiter queue is full ({max_queue_size} requests already waiting)")]
    QueueFull { max_queue_size: usize },
}

/// Caps concurrent auto-pool provisioning with a bounded wait queue.
///
/// Up to `workers` requests run at once; up to `max_queue_size` more may
/// wait. Overflow is rejected immediately and surfaces to the caller as
/// `RetriesExhausted`.
pub struct Limiter {
    slots: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    max_queue_size: usize,
}

#[derive(Debug)]
pub struct LimiterPermit {
    _slot: OwnedSemaphorePermit,
    _worker: OwnedSemaphorePermit,
}

impl Limiter {
    pub fn new(workers: usize, max_queue_size: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(workers + max_queue_size)),
            workers: Arc::new(Semaphore::new(workers)),
            max_queue_size,
        }
    }

    /// Enter the queue; waits for a worker slot once admitted
    pub async fn acquire(&self) -> Result<LimiterPermit, LimiterError> {
        let slot = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| LimiterError::QueueFull {
                max_queue_size: self.max_queue_size,
            })?;
        // Close never happens: both semaphores live as long as self.
        let worker = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .expect("limiter semaphore closed");
        Ok(LimiterPermit {
            _slot: slot,
            _worker: worker,
        })
    }
}
