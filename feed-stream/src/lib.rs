//! Resilient consumption of long-lived, chunked JSON feeds.
//!
//! A continuous change feed is delivered as an endless HTTP body. This crate
//! turns that body into a pull-based iterator with explicit backpressure,
//! reconnects through exponential backoff when the connection fails for a
//! retryable reason, and can run the per-item callback with bounded
//! concurrency.
//!
//! ```text
//! factory -> EventSource -> PersistentStream -> StreamIterator
//!         -> (FilteredStreamIterator) -> for_each / for_each_throttled
//! ```

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod abort;
pub mod backoff;
pub mod classify;
pub mod config;
pub mod decoder;
pub mod error;
pub mod filtered;
pub mod iterator;
pub mod persistent;
pub mod persistent_iterator;
pub mod source;
pub mod throttle;
pub mod transport;

pub use abort::{AbortHandle, Aborted, OrAbortExt};
pub use backoff::{Backoff, BackoffConfig};
pub use classify::{ErrorClass, classify};
pub use crate::config::{ConfigError, ConfigLoader, FeedConfig};
pub use decoder::{Decoder, Selector, SelectorDecoder};
pub use error::{DecodeError, FeedError, Result};
pub use filtered::{Filter, FilteredStreamIterator};
pub use iterator::{BindSource, IteratorSource, PullIterator, PullIteratorExt, StreamIterator};
pub use persistent::{ConnectionState, PersistentStream, StreamFactory};
pub use persistent_iterator::{PersistentStreamIterator, PersistentStreamOptions};
pub use source::{BoxEventSource, ChannelSource, EventSender, EventSource, Notification};
pub use throttle::Throttler;
pub use transport::{ByteStream, HttpTransport, RequestOptions, Transport, TransportResponse};
