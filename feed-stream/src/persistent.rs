//! Reconnecting event source.
//!
//! [`PersistentStream`] owns a factory of physical connections. Startup
//! failures are retried through [`Backoff::attempt`]; runtime errors are
//! classified and either absorbed by reconnecting or surfaced. A
//! [`FeedError::ForcedReconnect`] is a routine recycle and costs no retry
//! credit.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::abort::AbortHandle;
use crate::abort::OrAbortExt;
use crate::backoff::Backoff;
use crate::backoff::BackoffConfig;
use crate::classify::ErrorClass;
use crate::error::FeedError;
use crate::error::Result;
use crate::source::BoxEventSource;
use crate::source::EventSource;
use crate::source::Notification;

/// Produces a fresh physical connection on every call.
///
/// `Ok(None)` means the connection was abandoned because an abort raced it.
pub type StreamFactory<T> =
    Box<dyn FnMut() -> BoxFuture<'static, Result<Option<BoxEventSource<T>>>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Ended,
    /// Terminal. No factory call happens once here.
    Aborted,
}

pub struct PersistentStream<T> {
    backoff: Backoff,
    indefinite: bool,
    aborted: AbortHandle,
    factory: Option<StreamFactory<T>>,
    stream: Option<BoxEventSource<T>>,
    state: ConnectionState,
    paused: bool,
    error_sink: Option<mpsc::UnboundedSender<FeedError>>,
}

impl<T: Send + 'static> PersistentStream<T> {
    /// With `indefinite`, a clean end of the feed reconnects immediately
    /// instead of ending the stream.
    pub fn new(indefinite: bool, backoff: &BackoffConfig) -> Self {
        Self::with_abort_handle(indefinite, backoff, AbortHandle::new())
    }

    /// Share an abort handle, typically the one of the iterator pulling from this stream.
    pub fn with_abort_handle(indefinite: bool, backoff: &BackoffConfig, aborted: AbortHandle) -> Self {
        Self {
            backoff: Backoff::new(backoff.clone()),
            indefinite,
            aborted,
            factory: None,
            stream: None,
            state: ConnectionState::Unconnected,
            paused: false,
            error_sink: None,
        }
    }

    /// Store the factory. The first connection is made on the next poll.
    pub fn set_stream_factory(&mut self, factory: StreamFactory<T>) {
        self.factory = Some(factory);
        if !self.aborted.is_aborted() {
            self.state = ConnectionState::Connecting;
        }
    }

    /// Forward fatal errors to `sink` as well. Retryable errors never leave
    /// this stream.
    pub fn pipe_errors_to(&mut self, sink: mpsc::UnboundedSender<FeedError>) {
        self.error_sink = Some(sink);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.aborted.clone()
    }

    pub fn boxed(self) -> BoxEventSource<T> {
        Box::new(self)
    }

    async fn connect(&mut self) -> Option<Notification<T>> {
        let Some(factory) = self.factory.as_mut() else {
            self.state = ConnectionState::Unconnected;
            return None;
        };
        let aborted = self.aborted.clone();

        let attempt = self
            .backoff
            .attempt(|| -> BoxFuture<'static, Result<Option<BoxEventSource<T>>>> {
                if aborted.is_aborted() {
                    return futures::future::ready(Ok(None)).boxed();
                }
                factory()
            })
            .or_abort(&self.aborted)
            .await;

        match attempt {
            Ok(Ok(Some(mut stream))) => {
                if self.paused {
                    stream.pause();
                }
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                tracing::debug!("feed connected");
                Some(Notification::Connected)
            }
            Ok(Ok(None)) | Err(_) => self.mark_aborted(),
            Ok(Err(err)) => self.surface(err),
        }
    }

    fn on_end(&mut self) -> Option<Notification<T>> {
        self.stream = None;
        if self.indefinite && !self.aborted.is_aborted() {
            tracing::debug!("feed ended, reconnecting");
            self.state = ConnectionState::Connecting;
            return None;
        }
        self.state = ConnectionState::Ended;
        Some(Notification::End)
    }

    /// The watchdog killed a healthy connection. Reconnects right away,
    /// finite feed or not, without touching the failure count.
    fn on_recycled(&mut self) -> Option<Notification<T>> {
        if self.aborted.is_aborted() {
            return self.mark_aborted();
        }
        if let Some(mut stream) = self.stream.take() {
            stream.abort();
        }
        tracing::debug!("feed connection recycled, reconnecting");
        self.state = ConnectionState::Connecting;
        None
    }

    fn on_error(&mut self, err: FeedError) -> Option<Notification<T>> {
        if self.aborted.is_aborted() {
            return self.mark_aborted();
        }

        match err.class() {
            ErrorClass::Retryable => {
                if let Some(mut stream) = self.stream.take() {
                    stream.abort();
                }
                self.backoff.failure();
                if self.backoff.reached_max_retries() {
                    let exhausted = self.backoff.exhausted(err);
                    return self.surface(exhausted);
                }
                tracing::warn!(
                    error = %err,
                    failures = self.backoff.failures(),
                    "feed connection lost, reconnecting"
                );
                self.state = ConnectionState::Connecting;
                None
            }
            ErrorClass::Fatal => self.surface(err),
        }
    }

    /// Emit a fatal error and stop.
    fn surface(&mut self, err: FeedError) -> Option<Notification<T>> {
        if let Some(mut stream) = self.stream.take() {
            stream.abort();
        }
        self.state = ConnectionState::Ended;
        tracing::error!(error = %err, "feed failed");
        if let Some(sink) = &self.error_sink
            && sink.send(err.clone()).is_err()
        {
            self.error_sink = None;
        }
        Some(Notification::Error(err))
    }

    fn mark_aborted(&mut self) -> Option<Notification<T>> {
        if let Some(mut stream) = self.stream.take() {
            stream.abort();
        }
        let finished = matches!(
            self.state,
            ConnectionState::Aborted | ConnectionState::Ended
        );
        self.state = ConnectionState::Aborted;
        (!finished).then_some(Notification::End)
    }
}

#[async_trait]
impl<T: Send + 'static> EventSource<T> for PersistentStream<T> {
    async fn next_event(&mut self) -> Option<Notification<T>> {
        loop {
            if self.aborted.is_aborted() {
                return self.mark_aborted();
            }

            match self.state {
                ConnectionState::Aborted | ConnectionState::Ended => return None,
                ConnectionState::Unconnected => {
                    self.aborted.aborted().await;
                }
                ConnectionState::Connecting => {
                    if let Some(notification) = self.connect().await {
                        return Some(notification);
                    }
                }
                ConnectionState::Connected => {
                    let Some(stream) = self.stream.as_mut() else {
                        self.state = ConnectionState::Connecting;
                        continue;
                    };
                    let next = match stream.next_event().await {
                        Some(Notification::Item(item)) => return Some(Notification::Item(item)),
                        // Announced by connect() already.
                        Some(Notification::Connected) => None,
                        Some(Notification::Error(FeedError::ForcedReconnect)) => self.on_recycled(),
                        Some(Notification::Error(err)) => self.on_error(err),
                        Some(Notification::End) | None => self.on_end(),
                    };
                    if next.is_some() {
                        return next;
                    }
                }
            }
        }
    }

    fn pause(&mut self) {
        self.paused = true;
        if let Some(stream) = self.stream.as_mut() {
            stream.pause();
        }
    }

    fn resume(&mut self) {
        self.paused = false;
        if let Some(stream) = self.stream.as_mut() {
            stream.resume();
        }
    }

    /// Sticky. Also tears down the live connection, if any.
    fn abort(&mut self) {
        self.aborted.abort();
        if let Some(stream) = self.stream.as_mut() {
            stream.abort();
        }
    }
}
