//! Bounded-concurrency task runner used by throttled iteration.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::task::JoinSet;

use crate::error::FeedError;

/// Runs callbacks as independent tasks, at most `max_concurrent` at a time.
///
/// Failures do not cancel siblings; the first one is kept and returned by
/// [`Throttler::all_done`].
#[derive(Debug)]
pub struct Throttler {
    max_concurrent: usize,
    permits: Arc<Semaphore>,
    tasks: JoinSet<anyhow::Result<()>>,
    first_error: Option<FeedError>,
}

impl Throttler {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            tasks: JoinSet::new(),
            first_error: None,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn run<F>(&mut self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(async move {
            let _permit = permits.acquire_owned().await?;
            task.await
        });
    }

    /// Tasks scheduled and not yet settled.
    pub fn in_flight(&mut self) -> usize {
        while let Some(result) = self.tasks.try_join_next() {
            self.record(result);
        }
        self.tasks.len()
    }

    /// Resolves as soon as any scheduled task settles; immediately when none is running.
    pub async fn wait_for_slot(&mut self) {
        if let Some(result) = self.tasks.join_next().await {
            self.record(result);
        }
    }

    pub fn has_failed(&self) -> bool {
        self.first_error.is_some()
    }

    /// Wait for every scheduled task, then report the first failure.
    pub async fn all_done(&mut self) -> Result<(), FeedError> {
        while let Some(result) = self.tasks.join_next().await {
            self.record(result);
        }
        match self.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&mut self, result: Result<anyhow::Result<()>, JoinError>) {
        let err = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => FeedError::callback(err),
            Err(join_err) => FeedError::callback(anyhow::anyhow!("callback task failed: {join_err}")),
        };
        tracing::debug!(error = %err, "throttled callback failed");
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }
}
