//! Blocking-call adapter
//!
//! Wraps a [`Dispatcher`] and turns any blocking closure into an awaitable
//! that yields the closure's return value.

use crate::dispatch::{DispatchError, DispatchMode, Dispatcher};
use crate::metrics;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

#[derive(Debug, Clone)]
pub struct BlockingAdapter {
    dispatcher: Arc<dyn Dispatcher>,
}

impl BlockingAdapter {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn mode(&self) -> DispatchMode {
        self.dispatcher.mode()
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Run `f` on the dispatcher and return what it returned.
    ///
    /// Errors only when the job never produced a value (panic, cancellation).
    pub async fn run<F, T>(&self, f: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let started = Instant::now();

        let submitted = self
            .dispatcher
            .submit(Box::new(move || {
                let _ = tx.send(f());
            }))
            .await;

        metrics::record_dispatch(
            self.mode(),
            submitted.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        submitted?;

        rx.await.map_err(|_| DispatchError::Cancelled)
    }

    /// Run `f` without waiting for it; its result is discarded
    pub fn detach<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher.detach(Box::new(f));
    }
}
