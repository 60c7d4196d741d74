//! Push-style event sources.
//!
//! A source delivers [`Notification`]s. Nothing happens until it is polled
//! with [`EventSource::next_event`], so a consumer can never miss an error
//! that was raised before it started listening.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::error::FeedError;

/// Everything a source can report.
#[derive(Debug, Clone)]
pub enum Notification<T> {
    Item(T),
    Error(FeedError),
    End,
    /// A (re)connection was established.
    Connected,
}

#[async_trait]
pub trait EventSource<T: Send + 'static>: Send {
    /// Next notification, or `None` once the source is exhausted.
    async fn next_event(&mut self) -> Option<Notification<T>>;

    /// Hint that the consumer is busy. Sources that buffer nothing may ignore it.
    fn pause(&mut self) {}

    fn resume(&mut self) {}

    /// Tear down whatever the source holds. Idempotent.
    fn abort(&mut self) {}
}

pub type BoxEventSource<T> = Box<dyn EventSource<T>>;

#[async_trait]
impl<T: Send + 'static> EventSource<T> for BoxEventSource<T> {
    async fn next_event(&mut self) -> Option<Notification<T>> {
        (**self).next_event().await
    }

    fn pause(&mut self) {
        (**self).pause();
    }

    fn resume(&mut self) {
        (**self).resume();
    }

    fn abort(&mut self) {
        (**self).abort();
    }
}

/// Producer half of a [`ChannelSource`].
///
/// Sends wait while the consumer side is paused, so a producer task never
/// runs ahead of the pull iterator by more than one notification.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: mpsc::Sender<Notification<T>>,
    flowing: watch::Receiver<bool>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            flowing: self.flowing.clone(),
        }
    }
}

impl<T: Send> EventSender<T> {
    /// Returns `false` once the receiving side is gone.
    pub async fn send(&self, notification: Notification<T>) -> bool {
        let mut flowing = self.flowing.clone();
        if flowing.wait_for(|flowing| *flowing).await.is_err() {
            return false;
        }
        self.tx.send(notification).await.is_ok()
    }

    pub async fn item(&self, item: T) -> bool {
        self.send(Notification::Item(item)).await
    }

    pub async fn error(&self, err: FeedError) -> bool {
        self.send(Notification::Error(err)).await
    }

    pub async fn end(&self) -> bool {
        self.send(Notification::End).await
    }

    pub fn is_flowing(&self) -> bool {
        *self.flowing.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Event source fed by any task through an [`EventSender`].
#[derive(Debug)]
pub struct ChannelSource<T> {
    rx: mpsc::Receiver<Notification<T>>,
    flowing: watch::Sender<bool>,
    aborted: bool,
}

impl<T: Send + 'static> ChannelSource<T> {
    pub fn new() -> (EventSender<T>, Self) {
        let (tx, rx) = mpsc::channel(1);
        let (flowing_tx, flowing_rx) = watch::channel(true);
        (
            EventSender {
                tx,
                flowing: flowing_rx,
            },
            ChannelSource {
                rx,
                flowing: flowing_tx,
                aborted: false,
            },
        )
    }

    pub fn boxed(self) -> BoxEventSource<T> {
        Box::new(self)
    }
}

#[async_trait]
impl<T: Send + 'static> EventSource<T> for ChannelSource<T> {
    async fn next_event(&mut self) -> Option<Notification<T>> {
        if self.aborted {
            return None;
        }
        self.rx.recv().await
    }

    fn pause(&mut self) {
        self.flowing.send_replace(false);
    }

    fn resume(&mut self) {
        self.flowing.send_replace(true);
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.rx.close();
    }
}
