//! Executor dispatch on tokio's blocking thread pool

use super::{DispatchError, DispatchMode, Dispatcher, Job};
use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::error;

/// Runs jobs with `spawn_blocking` on a captured runtime
#[derive(Debug, Clone)]
pub struct Executor {
    handle: Handle,
}

impl Executor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Capture the runtime of the calling thread
    pub fn current() -> Result<Self, DispatchError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| DispatchError::NoRuntime)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

#[async_trait]
impl Dispatcher for Executor {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Executor
    }

    async fn submit(&self, job: Job) -> Result<(), DispatchError> {
        self.handle.spawn_blocking(job).await.map_err(|e| {
            if e.is_panic() {
                error!("Blocking job panicked on executor");
                DispatchError::Panicked(DispatchMode::Executor)
            } else {
                DispatchError::Cancelled
            }
        })
    }

    fn detach(&self, job: Job) {
        drop(self.handle.spawn_blocking(job));
    }
}
