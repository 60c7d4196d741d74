//! Decoded, reconnecting feed iterator.
//!
//! Glues the pieces together: a [`Transport`] request per connection, a
//! [`SelectorDecoder`] per response body, a [`PersistentStream`] to reconnect,
//! and a [`StreamIterator`] on top for pull semantics.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Sleep;

use crate::abort::AbortHandle;
use crate::backoff::BackoffConfig;
use crate::decoder::Decoder;
use crate::decoder::Selector;
use crate::decoder::SelectorDecoder;
use crate::error::DecodeError;
use crate::error::FeedError;
use crate::error::Result;
use crate::iterator::BindSource;
use crate::iterator::PullIterator;
use crate::iterator::StreamIterator;
use crate::persistent::PersistentStream;
use crate::persistent::StreamFactory;
use crate::source::BoxEventSource;
use crate::source::EventSource;
use crate::source::Notification;
use crate::transport::ByteStream;
use crate::transport::RequestOptions;
use crate::transport::Transport;
use crate::transport::TransportResponse;

#[derive(Debug, Clone)]
pub struct PersistentStreamOptions {
    pub request: RequestOptions,
    /// See [`Selector`].
    pub selector: String,
    /// Reconnect when the server ends the feed cleanly.
    pub indefinite: bool,
    /// Recycle a connection this long after it first produced data.
    pub force_reconnect_after: Option<Duration>,
    pub backoff: BackoffConfig,
}

impl Default for PersistentStreamOptions {
    fn default() -> Self {
        Self {
            request: RequestOptions::default(),
            selector: "*".to_string(),
            indefinite: false,
            force_reconnect_after: None,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Pull iterator over a decoded feed that survives connection loss.
pub struct PersistentStreamIterator<T = Value> {
    base: StreamIterator<T>,
    requests: Arc<AtomicUsize>,
    forced_reconnects: Arc<AtomicUsize>,
}

impl<T: DeserializeOwned + Send + 'static> PersistentStreamIterator<T> {
    /// Fails only on an invalid selector. Nothing is sent until the first pull.
    pub fn new(transport: Arc<dyn Transport>, options: PersistentStreamOptions) -> Result<Self> {
        let selector = Selector::parse(&options.selector)?;
        let abort = AbortHandle::new();
        let requests = Arc::new(AtomicUsize::new(0));
        let forced_reconnects = Arc::new(AtomicUsize::new(0));

        let connector = Connector {
            transport,
            request: options.request.clone(),
            selector,
            force_after: options.force_reconnect_after,
            requests: Arc::clone(&requests),
            forced_reconnects: Arc::clone(&forced_reconnects),
        };
        let factory: StreamFactory<T> = {
            let abort = abort.clone();
            Box::new(move || connector.clone().open::<T>(abort.child()).boxed())
        };

        let mut stream =
            PersistentStream::with_abort_handle(options.indefinite, &options.backoff, abort.clone());
        stream.set_stream_factory(factory);

        let mut base = StreamIterator::with_abort_handle(abort);
        base.set_source(stream.boxed());

        Ok(Self {
            base,
            requests,
            forced_reconnects,
        })
    }

    /// Physical requests issued so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Connections recycled by the watchdog.
    pub fn forced_reconnects(&self) -> usize {
        self.forced_reconnects.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.base.connections()
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> PullIterator<T> for PersistentStreamIterator<T> {
    fn advance(&mut self) {
        self.base.advance();
    }

    async fn next_notification(&mut self) -> Option<Notification<T>> {
        self.base.next_notification().await
    }

    fn abort_handle(&self) -> AbortHandle {
        self.base.abort_handle()
    }

    /// Cancels the live request (and its watchdog) along with the iteration.
    fn abort(&mut self) {
        self.base.abort();
    }
}

/// Everything needed to open one physical connection.
#[derive(Clone)]
struct Connector {
    transport: Arc<dyn Transport>,
    request: RequestOptions,
    selector: Selector,
    force_after: Option<Duration>,
    requests: Arc<AtomicUsize>,
    forced_reconnects: Arc<AtomicUsize>,
}

impl Connector {
    async fn open<T: DeserializeOwned + Send + 'static>(
        self,
        cancel: AbortHandle,
    ) -> Result<Option<BoxEventSource<T>>> {
        if cancel.is_aborted() {
            return Ok(None);
        }
        let attempt = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(attempt, url = %self.request.url, "opening feed connection");
        let response = self.transport.send(&self.request, cancel.clone()).await?;
        let connection = DecodedConnection::new(
            response,
            SelectorDecoder::new(self.selector),
            cancel,
            self.force_after,
            self.forced_reconnects,
        );
        Ok(Some(Box::new(connection) as BoxEventSource<T>))
    }
}

enum Step {
    Cancelled,
    Watchdog,
    Chunk(Option<Result<bytes::Bytes>>),
}

/// One physical connection: response body in, decoded items out.
struct DecodedConnection<T> {
    status: Option<u16>,
    body: Option<ByteStream>,
    decoder: SelectorDecoder,
    cancel: AbortHandle,
    force_after: Option<Duration>,
    watchdog: Option<Pin<Box<Sleep>>>,
    received_data: bool,
    forced: bool,
    forced_reconnects: Arc<AtomicUsize>,
    pending: VecDeque<T>,
    /// Reported once the items decoded before it are drained.
    failure: Option<FeedError>,
    done: bool,
}

impl<T: DeserializeOwned + Send + 'static> DecodedConnection<T> {
    fn new(
        response: TransportResponse,
        decoder: SelectorDecoder,
        cancel: AbortHandle,
        force_after: Option<Duration>,
        forced_reconnects: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            status: Some(response.status),
            body: Some(response.body),
            decoder,
            cancel,
            force_after,
            watchdog: None,
            received_data: false,
            forced: false,
            forced_reconnects,
            pending: VecDeque::new(),
            failure: None,
            done: false,
        }
    }

    fn first_data(&mut self) {
        self.received_data = true;
        if let Some(after) = self.force_after {
            self.watchdog = Some(Box::pin(tokio::time::sleep(after)));
        }
    }

    fn queue(&mut self, values: Vec<Value>) -> std::result::Result<(), DecodeError> {
        for value in values {
            let item = serde_json::from_value(value)
                .map_err(|err| DecodeError::Convert(err.to_string()))?;
            self.pending.push_back(item);
        }
        Ok(())
    }

    /// Tear down and report `notification` as the last word of this connection.
    fn close(&mut self, notification: Notification<T>) -> Option<Notification<T>> {
        self.done = true;
        self.body = None;
        self.watchdog = None;
        Some(notification)
    }

    /// Stop reading; `err` follows the items already queued.
    fn fail(&mut self, err: FeedError) {
        self.body = None;
        self.watchdog = None;
        self.failure = Some(err);
    }

    async fn status_error(&mut self, status: u16) -> FeedError {
        let mut text = Vec::new();
        if let Some(mut body) = self.body.take() {
            while let Some(Ok(chunk)) = body.next().await {
                text.extend_from_slice(&chunk);
            }
        }
        FeedError::Status {
            status,
            body: String::from_utf8_lossy(&text).trim().to_string(),
        }
    }
}

async fn watchdog_fired(watchdog: &mut Option<Pin<Box<Sleep>>>) {
    match watchdog {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> EventSource<T> for DecodedConnection<T> {
    async fn next_event(&mut self) -> Option<Notification<T>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(Notification::Item(item));
            }
            if let Some(err) = self.failure.take() {
                return self.close(Notification::Error(err));
            }
            if self.done {
                return None;
            }
            if let Some(status) = self.status.take()
                && !(200..300).contains(&status)
            {
                let err = self.status_error(status).await;
                return self.close(Notification::Error(err));
            }
            let Some(body) = self.body.as_mut() else {
                return self.close(Notification::End);
            };

            let step = tokio::select! {
                biased;
                _ = self.cancel.aborted() => Step::Cancelled,
                _ = watchdog_fired(&mut self.watchdog) => Step::Watchdog,
                chunk = body.next() => Step::Chunk(chunk),
            };

            match step {
                Step::Cancelled => {
                    if self.forced && self.received_data {
                        return self.close(Notification::Error(FeedError::ForcedReconnect));
                    }
                    // Nothing to recover from a request killed before it
                    // produced data; end it so the reconnect loop moves on.
                    return self.close(Notification::End);
                }
                Step::Watchdog => {
                    self.forced = true;
                    self.watchdog = None;
                    self.forced_reconnects.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(after = ?self.force_after, "forcing feed reconnect");
                    self.cancel.abort();
                }
                Step::Chunk(Some(Ok(chunk))) => {
                    if !self.received_data {
                        self.first_data();
                    }
                    let decoded = self
                        .decoder
                        .decode(&chunk)
                        .and_then(|values| self.queue(values));
                    if let Err(err) = decoded {
                        self.fail(err.into());
                    } else if let Some(err) = self.decoder.error().cloned() {
                        self.fail(err.into());
                    }
                }
                Step::Chunk(Some(Err(err))) => {
                    return self.close(Notification::Error(err));
                }
                Step::Chunk(None) => {
                    self.body = None;
                    self.watchdog = None;
                    let finished = self.decoder.finish().and_then(|values| self.queue(values));
                    if let Err(err) = finished {
                        self.fail(err.into());
                    }
                }
            }
        }
    }

    fn abort(&mut self) {
        self.cancel.abort();
        self.watchdog = None;
    }
}
