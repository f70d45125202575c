//! Dispatch strategies
//!
//! A [`Dispatcher`] runs blocking jobs off the async caller and reports
//! back when they finish. Two strategies exist:
//!
//! - [`WorkerPool`]: a fixed set of OS threads owned by the bridge. A job
//!   submitted from one of the pool's own workers runs inline, so nested
//!   blocking calls never wait on a saturated pool.
//! - [`Executor`]: tokio's blocking thread pool, reached through a runtime
//!   [`Handle`](tokio::runtime::Handle).

use crate::config::DispatchConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

mod executor;
mod worker_pool;

pub use executor::Executor;
pub use worker_pool::WorkerPool;

/// Unit of blocking work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Dispatch strategy selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    #[serde(alias = "fiber")]
    WorkerPool,
    Executor,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::WorkerPool => "worker_pool",
            DispatchMode::Executor => "executor",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "worker_pool" | "fiber" => Ok(DispatchMode::WorkerPool),
            "executor" => Ok(DispatchMode::Executor),
            other => Err(DispatchError::UnknownMode(other.to_string())),
        }
    }
}

/// Dispatch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Blocking job panicked on the {0} dispatcher")]
    Panicked(DispatchMode),

    #[error("Blocking job was cancelled before it produced a result")]
    Cancelled,

    #[error("No tokio runtime available for executor dispatch")]
    NoRuntime,

    #[error("Failed to build worker pool: {0}")]
    PoolBuild(String),

    #[error("Unknown dispatch mode: {0}")]
    UnknownMode(String),
}

impl DispatchError {
    /// Errors raised while constructing a dispatcher rather than running a job
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            DispatchError::NoRuntime | DispatchError::PoolBuild(_) | DispatchError::UnknownMode(_)
        )
    }
}

/// Runs blocking jobs on behalf of async callers
#[async_trait]
pub trait Dispatcher: Send + Sync + fmt::Debug {
    fn mode(&self) -> DispatchMode;

    /// Run `job` and resolve once it has finished.
    ///
    /// Only the awaiting task suspends; other tasks keep running.
    async fn submit(&self, job: Job) -> Result<(), DispatchError>;

    /// Run `job` without waiting for it
    fn detach(&self, job: Job);
}

/// Build the dispatcher described by `config`.
///
/// Executor mode captures the tokio runtime of the calling thread.
pub fn dispatcher_for(config: &DispatchConfig) -> Result<Arc<dyn Dispatcher>, DispatchError> {
    match config.mode {
        DispatchMode::WorkerPool => Ok(Arc::new(WorkerPool::new(config.workers)?)),
        DispatchMode::Executor => Ok(Arc::new(Executor::current()?)),
    }
}
