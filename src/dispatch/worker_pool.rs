//! Worker-pool dispatch backed by a rayon thread pool

use super::{DispatchError, DispatchMode, Dispatcher, Job};
use async_trait::async_trait;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

/// Fixed-size pool of blocking workers
#[derive(Debug)]
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` worker threads
    pub fn new(size: usize) -> Result<Self, DispatchError> {
        if size == 0 {
            return Err(DispatchError::PoolBuild(
                "worker pool needs at least one thread".into(),
            ));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|index| format!("cloud-bridge-worker-{}", index))
            .build()
            .map_err(|e| DispatchError::PoolBuild(e.to_string()))?;

        debug!(workers = size, "Worker pool started");
        Ok(Self { pool, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// True when called from one of this pool's workers
    pub fn on_worker(&self) -> bool {
        self.pool.current_thread_index().is_some()
    }
}

/// Run a job, containing any panic. Returns false if it panicked.
fn run_guarded(job: Job) -> bool {
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(()) => true,
        Err(_) => {
            error!("Blocking job panicked on worker pool");
            false
        }
    }
}

#[async_trait]
impl Dispatcher for WorkerPool {
    fn mode(&self) -> DispatchMode {
        DispatchMode::WorkerPool
    }

    async fn submit(&self, job: Job) -> Result<(), DispatchError> {
        if self.on_worker() {
            // Queuing here could wait on ourselves once every worker is busy.
            trace!("Nested submission, running inline");
            return if run_guarded(job) {
                Ok(())
            } else {
                Err(DispatchError::Panicked(DispatchMode::WorkerPool))
            };
        }

        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = tx.send(run_guarded(job));
        });

        match rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DispatchError::Panicked(DispatchMode::WorkerPool)),
            Err(_) => Err(DispatchError::Cancelled),
        }
    }

    fn detach(&self, job: Job) {
        self.pool.spawn(move || {
            run_guarded(job);
        });
    }
}
