//! Bounded pool for CPU-bound frame work.
//!
//! Every ingest worker submits its decrypt, decode and transcode steps here
//! and awaits the result before taking its next frame. The pool caps how
//! many of those steps run at once across all streams; the jobs themselves
//! run on tokio's blocking threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("decode pool is closed")]
    Closed,

    #[error("decode job panicked: {0}")]
    Panicked(String),
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub in_flight: usize,
    pub submitted: u64,
    pub completed: u64,
    pub panicked: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct DecodePool {
    permits: Arc<Semaphore>,
    size: usize,
    counters: Arc<PoolCounters>,
}

impl DecodePool {
    /// Create a pool running at most `size` jobs at once (minimum 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            counters: Arc::new(PoolCounters::default()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on the pool and wait for its result.
    ///
    /// The permit travels with the job, so a caller that stops waiting does
    /// not free a slot until the job has actually finished.
    pub async fn run<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await;

        match result {
            Ok(value) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(e) => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::Panicked(e.to_string()))
            }
        }
    }

    /// Stop accepting jobs. Jobs already running finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            in_flight: self.size.saturating_sub(self.permits.available_permits()),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }
}
