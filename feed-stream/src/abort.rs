//! Cooperative abort signalling.
//!
//! An [`AbortHandle`] is a node in a cancellation tree: aborting a handle
//! aborts every child created from it, never its parent. The iterator owns
//! the root; each HTTP request gets a child so the watchdog can kill a single
//! connection without stopping the feed.

use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFutureOwned;

#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this handle (or an ancestor) is aborted.
    pub async fn aborted(&self) {
        self.token.cancelled().await;
    }

    /// Owned variant of [`AbortHandle::aborted`] for `'static` contexts.
    pub fn aborted_owned(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }

    pub fn child(&self) -> AbortHandle {
        AbortHandle {
            token: self.token.child_token(),
        }
    }
}

/// Returned when a future loses the race against its abort handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

impl std::fmt::Display for Aborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("aborted")
    }
}

impl std::error::Error for Aborted {}

#[async_trait]
pub trait OrAbortExt: Sized {
    type Output;

    /// Race this future against `handle`.
    async fn or_abort(self, handle: &AbortHandle) -> Result<Self::Output, Aborted>;
}

#[async_trait]
impl<F> OrAbortExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_abort(self, handle: &AbortHandle) -> Result<Self::Output, Aborted> {
        tokio::select! {
            biased;
            _ = handle.aborted() => Err(Aborted),
            res = self => Ok(res),
        }
    }
}
