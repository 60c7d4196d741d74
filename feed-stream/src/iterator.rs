//! Pull iteration over push-style sources.
//!
//! [`StreamIterator`] pauses its source every time it hands out an item and
//! only resumes it on [`PullIterator::advance`]. That is the whole
//! backpressure contract: a slow consumer holds the producer back instead of
//! letting items pile up in memory.

use std::future::Future;

use async_trait::async_trait;

use crate::abort::AbortHandle;
use crate::abort::OrAbortExt;
use crate::error::FeedError;
use crate::error::Result;
use crate::source::BoxEventSource;
use crate::source::EventSource;
use crate::source::Notification;
use crate::throttle::Throttler;

/// Something a push-style source of `T` can be bound to.
pub trait BindSource<T: Send + 'static> {
    /// Bind the source items are pulled from. Replaces any previous source.
    fn set_source(&mut self, source: BoxEventSource<T>);
}

#[async_trait]
pub trait PullIterator<T: Send + 'static>: Send {
    /// Release the source so the next item may be delivered.
    fn advance(&mut self);

    /// Next notification. After an [`Notification::End`] this returns `None`.
    ///
    /// Asking for the next notification while the previous item was never
    /// advanced past advances implicitly.
    async fn next_notification(&mut self) -> Option<Notification<T>>;

    /// Cloneable handle that aborts this iterator, usable from inside callbacks.
    fn abort_handle(&self) -> AbortHandle;

    /// End the iteration now. Idempotent.
    fn abort(&mut self);
}

#[async_trait]
impl<T: Send + 'static> PullIterator<T> for Box<dyn PullIterator<T>> {
    fn advance(&mut self) {
        (**self).advance();
    }

    async fn next_notification(&mut self) -> Option<Notification<T>> {
        (**self).next_notification().await
    }

    fn abort_handle(&self) -> AbortHandle {
        (**self).abort_handle()
    }

    fn abort(&mut self) {
        (**self).abort();
    }
}

/// The basic pull iterator.
pub struct StreamIterator<T> {
    source: Option<BoxEventSource<T>>,
    abort: AbortHandle,
    awaiting_advance: bool,
    ended: bool,
    connections: usize,
}

impl<T: Send + 'static> Default for StreamIterator<T> {
    fn default() -> Self {
        Self::with_abort_handle(AbortHandle::new())
    }
}

impl<T: Send + 'static> StreamIterator<T> {
    pub fn new(source: BoxEventSource<T>) -> Self {
        let mut iterator = Self::default();
        iterator.set_source(source);
        iterator
    }

    /// Iterator without a source, aborted through `abort`.
    pub fn with_abort_handle(abort: AbortHandle) -> Self {
        Self {
            source: None,
            abort,
            awaiting_advance: false,
            ended: false,
            connections: 0,
        }
    }

    /// How many times the source reported a (re)connection.
    pub fn connections(&self) -> usize {
        self.connections
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn finish_aborted(&mut self) -> Option<Notification<T>> {
        if let Some(source) = self.source.as_mut() {
            source.abort();
        }
        self.end()
    }

    fn end(&mut self) -> Option<Notification<T>> {
        if self.ended {
            return None;
        }
        self.ended = true;
        self.awaiting_advance = false;
        Some(Notification::End)
    }
}

impl<T: Send + 'static> BindSource<T> for StreamIterator<T> {
    fn set_source(&mut self, source: BoxEventSource<T>) {
        self.source = Some(source);
        self.awaiting_advance = false;
    }
}

#[async_trait]
impl<T: Send + 'static> PullIterator<T> for StreamIterator<T> {
    fn advance(&mut self) {
        if !self.awaiting_advance {
            return;
        }
        self.awaiting_advance = false;
        if let Some(source) = self.source.as_mut() {
            source.resume();
        }
    }

    async fn next_notification(&mut self) -> Option<Notification<T>> {
        if self.ended {
            return None;
        }
        self.advance();
        if self.abort.is_aborted() {
            return self.finish_aborted();
        }

        let Some(source) = self.source.as_mut() else {
            // Nothing bound yet; only an abort can end this.
            self.abort.aborted().await;
            return self.finish_aborted();
        };

        let event = match source.next_event().or_abort(&self.abort).await {
            Ok(event) => event,
            Err(_) => return self.finish_aborted(),
        };

        match event {
            Some(Notification::Item(item)) => {
                source.pause();
                self.awaiting_advance = true;
                Some(Notification::Item(item))
            }
            Some(Notification::Connected) => {
                self.connections += 1;
                Some(Notification::Connected)
            }
            Some(Notification::Error(err)) => Some(Notification::Error(err)),
            Some(Notification::End) | None => self.end(),
        }
    }

    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn abort(&mut self) {
        self.abort.abort();
        if let Some(source) = self.source.as_mut() {
            source.abort();
        }
    }
}

/// Consumption helpers available on every [`PullIterator`].
pub trait PullIteratorExt<T: Send + 'static>: PullIterator<T> + Sized {
    /// Serially hand every item to `on_item`, advancing once it finishes.
    ///
    /// Resolves with whether any item was seen. Fails with the first source
    /// error or callback error. An abort resolves instead of failing.
    fn for_each<F, Fut>(&mut self, mut on_item: F) -> impl Future<Output = Result<bool>> + Send
    where
        F: FnMut(T) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        async move {
            let mut had_items = false;
            loop {
                match self.next_notification().await {
                    None | Some(Notification::End) => return Ok(had_items),
                    Some(Notification::Connected) => {}
                    Some(Notification::Error(err)) => return Err(err),
                    Some(Notification::Item(item)) => {
                        had_items = true;
                        on_item(item).await.map_err(FeedError::callback)?;
                        if !self.abort_handle().is_aborted() {
                            self.advance();
                        }
                    }
                }
            }
        }
    }

    /// Run `on_item` for every item with at most `limit` callbacks in flight.
    ///
    /// Pulling continues while callbacks run; once more than `limit` are
    /// scheduled the next advance waits for one of them to settle. After a
    /// callback failure nothing more is pulled: the rest of the feed stays
    /// unread rather than being drained before the error is reported. Every
    /// scheduled callback is awaited before resolving, then the source error
    /// (if any) or the first callback error is returned.
    fn for_each_throttled<F, Fut>(
        &mut self,
        mut on_item: F,
        limit: usize,
    ) -> impl Future<Output = Result<bool>> + Send
    where
        F: FnMut(T) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        async move {
            let mut throttler = Throttler::new(limit);
            let mut had_items = false;
            let mut source_result = Ok(());

            loop {
                match self.next_notification().await {
                    None | Some(Notification::End) => break,
                    Some(Notification::Connected) => {}
                    Some(Notification::Error(err)) => {
                        source_result = Err(err);
                        break;
                    }
                    Some(Notification::Item(item)) => {
                        had_items = true;
                        throttler.run(on_item(item));
                        if throttler.in_flight() > throttler.max_concurrent() {
                            tracing::trace!(
                                limit = throttler.max_concurrent(),
                                "throttled, waiting for a callback to finish"
                            );
                            throttler.wait_for_slot().await;
                        }
                        if throttler.has_failed() {
                            break;
                        }
                        if !self.abort_handle().is_aborted() {
                            self.advance();
                        }
                    }
                }
            }

            let callbacks = throttler.all_done().await;
            source_result?;
            callbacks?;
            Ok(had_items)
        }
    }

    /// Re-expose this iterator as a push-style source.
    fn into_event_source(self) -> IteratorSource<Self>
    where
        Self: 'static,
    {
        IteratorSource { inner: self }
    }

    /// Bind `other` to this iterator's items and return it.
    fn pipe<P>(self, mut other: P) -> P
    where
        Self: 'static,
        P: BindSource<T>,
    {
        other.set_source(Box::new(self.into_event_source()));
        other
    }
}

impl<T: Send + 'static, I: PullIterator<T>> PullIteratorExt<T> for I {}

/// A [`PullIterator`] seen as an [`EventSource`].
///
/// Resuming the source advances the wrapped iterator; aborting it aborts the
/// wrapped iterator.
pub struct IteratorSource<I> {
    inner: I,
}

impl<I> IteratorSource<I> {
    pub fn into_inner(self) -> I {
        self.inner
    }
}

#[async_trait]
impl<T, I> EventSource<T> for IteratorSource<I>
where
    T: Send + 'static,
    I: PullIterator<T>,
{
    async fn next_event(&mut self) -> Option<Notification<T>> {
        self.inner.next_notification().await
    }

    fn resume(&mut self) {
        self.inner.advance();
    }

    fn abort(&mut self) {
        self.inner.abort();
    }
}
