//! Provides a bounded pool of concurrently running tasks.
//!
//! The `pool` module bounds how much handler work may be in flight at once. A [`WorkerPool`] holds a fixed number of
//! slots. [`WorkerPool::spawn`] waits for a free slot before spawning, so the caller (the node's single input
//! reader) stops consuming input while the pool is saturated rather than growing unbounded concurrent work.
//!
//! Each task owns its slot for as long as it runs. The slot is a semaphore permit moved into the task, so it is
//! released when the task's future is dropped: on completion, on panic, and on abort alike.
//!
//! # Example
//!
//! ```
//! use murmur::pool::WorkerPool;
//!
//! # tokio_test::block_on(async {
//! let mut pool = WorkerPool::new(2);
//! for i in 0..10 {
//!     pool.spawn(async move { let _ = i * 2; }).await;
//! }
//! pool.join().await;
//! # });
//! ```

use std::{fmt, future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinSet};
use tracing::error;

use crate::error::PanicError;

/// A fixed number of execution slots for spawned tasks.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
    capacity: usize,
}

impl WorkerPool {
    /// Creates a new pool with `capacity` slots.
    ///
    /// # Panics
    ///
    /// This method panics if `capacity` is 0, as the pool could never run anything.
    pub fn new(capacity: usize) -> Self {
        assert_ne!(capacity, 0);

        WorkerPool {
            permits: Arc::new(Semaphore::new(capacity)),
            tasks: JoinSet::new(),
            capacity,
        }
    }

    /// The total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of slots currently held by running tasks.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Waits for a free slot, then spawns `task` on the Tokio runtime holding that slot.
    pub async fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();

        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            unreachable!("the pool semaphore is never closed");
        };
        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
    }

    /// Waits for every spawned task to finish.
    pub async fn join(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            log_task_result(res);
        }
    }

    fn reap(&mut self) {
        while let Some(res) = self.tasks.try_join_next() {
            log_task_result(res);
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[inline]
fn log_task_result(res: Result<(), tokio::task::JoinError>) {
    if let Err(err) = res {
        if err.is_panic() {
            let err = PanicError::new(err.into_panic());
            error!(%err, "pool task panicked");
        }
    }
}
