//! FIFO concurrency gate.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore as TokioSemaphore};

use crate::{FaasError, Result};

#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<TokioSemaphore>,
    max: usize,
}

impl Semaphore {
    pub fn new(max_concurrent: usize) -> Self {
        let max = max_concurrent.max(1);
        Self {
            inner: Arc::new(TokioSemaphore::new(max)),
            max,
        }
    }

    /// Sized to leave one core free for the developer's own tooling.
    pub fn for_builds() -> Self {
        Self::new(num_cpus::get().saturating_sub(1))
    }

    /// Resolves immediately while fewer than `max` permits are out, otherwise queues in FIFO order.
    pub async fn acquire(&self) -> Result<Permit> {
        let permit = self
            .inner
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FaasError::Internal("semaphore closed".to_string()))?;
        Ok(Permit { _permit: permit })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }
}

/// Held slot. Released by [`Permit::release`] or on drop, so early returns and
/// cancelled tasks cannot leak it.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    pub fn release(self) {
        drop(self);
    }
}
