use crate::error::{Result, ServiceError};
use std::future::Future;
use tokio::sync::Semaphore;

/// Bounded-concurrency pool serialising upload submissions.
///
/// Admission is FIFO. The queue does not cancel work; callers cancel through
/// the token carried by the wrapped operation.
pub struct ActionQueue {
    slots: Semaphore,
}

impl ActionQueue {
    pub const DEFAULT_WIDTH: usize = 1;

    /// `width` is clamped to at least one slot.
    pub fn new(width: usize) -> Self {
        Self {
            slots: Semaphore::new(width.max(1)),
        }
    }

    /// Runs `operation` once a slot is free, holding the slot for its whole
    /// duration.
    pub async fn run<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| ServiceError::fatal("action queue semaphore closed"))?;
        operation.await
    }
}
