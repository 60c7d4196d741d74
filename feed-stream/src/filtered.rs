//! Item transform/filter decorator for pull iterators.

use std::future::Future;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::abort::AbortHandle;
use crate::error::FeedError;
use crate::iterator::BindSource;
use crate::iterator::PullIterator;
use crate::source::BoxEventSource;
use crate::source::Notification;

/// Outcome of a transform: a replacement item, or drop the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter<U> {
    Keep(U),
    Skip,
}

impl<U> From<Option<U>> for Filter<U> {
    fn from(value: Option<U>) -> Self {
        match value {
            Some(value) => Filter::Keep(value),
            None => Filter::Skip,
        }
    }
}

type Transform<T, U> = Box<dyn FnMut(T) -> BoxFuture<'static, anyhow::Result<Filter<U>>> + Send>;

/// Applies a transform to every item of `upstream`, dropping skipped ones.
///
/// Skipped items are advanced past immediately, so the consumer only ever
/// sees kept items. A failing transform surfaces as a callback error.
pub struct FilteredStreamIterator<I, T, U = T> {
    upstream: I,
    transform: Transform<T, U>,
}

impl<I, T, U> FilteredStreamIterator<I, T, U>
where
    I: PullIterator<T>,
    T: Send + 'static,
    U: Send + 'static,
{
    pub fn new<F, Fut>(upstream: I, mut transform: F) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Filter<U>>> + Send + 'static,
    {
        Self {
            upstream,
            transform: Box::new(move |item| transform(item).boxed()),
        }
    }

    pub fn from_fn<F>(upstream: I, mut transform: F) -> Self
    where
        F: FnMut(T) -> anyhow::Result<Filter<U>> + Send + 'static,
    {
        Self {
            upstream,
            transform: Box::new(move |item| futures::future::ready(transform(item)).boxed()),
        }
    }

    pub fn into_inner(self) -> I {
        self.upstream
    }
}

impl<I, T> FilteredStreamIterator<I, T, T>
where
    I: PullIterator<T>,
    T: Send + 'static,
{
    /// No transform: every item passes through unchanged.
    pub fn passthrough(upstream: I) -> Self {
        Self::from_fn(upstream, |item| Ok(Filter::Keep(item)))
    }
}

/// Binding a filtered iterator binds its upstream.
impl<I, T, U> BindSource<T> for FilteredStreamIterator<I, T, U>
where
    I: BindSource<T>,
    T: Send + 'static,
{
    fn set_source(&mut self, source: BoxEventSource<T>) {
        self.upstream.set_source(source);
    }
}

#[async_trait]
impl<I, T, U> PullIterator<U> for FilteredStreamIterator<I, T, U>
where
    I: PullIterator<T>,
    T: Send + 'static,
    U: Send + 'static,
{
    fn advance(&mut self) {
        self.upstream.advance();
    }

    async fn next_notification(&mut self) -> Option<Notification<U>> {
        loop {
            match self.upstream.next_notification().await? {
                Notification::Item(item) => match (self.transform)(item).await {
                    Ok(Filter::Keep(item)) => return Some(Notification::Item(item)),
                    Ok(Filter::Skip) => self.upstream.advance(),
                    Err(err) => return Some(Notification::Error(FeedError::callback(err))),
                },
                Notification::Error(err) => return Some(Notification::Error(err)),
                Notification::End => return Some(Notification::End),
                Notification::Connected => return Some(Notification::Connected),
            }
        }
    }

    fn abort_handle(&self) -> AbortHandle {
        self.upstream.abort_handle()
    }

    fn abort(&mut self) {
        self.upstream.abort();
    }
}
