//! HTTP transport for feed requests.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use reqwest::Method;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::abort::AbortHandle;
use crate::error::FeedError;
use crate::error::Result;

/// Parameters of the feed request, passed through unchanged on every reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    /// Sent as JSON when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Whole-request timeout. Leave unset for continuous feeds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout_ms: None,
        }
    }
}

impl RequestOptions {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

pub struct TransportResponse {
    pub status: u16,
    /// Ends early (cleanly) once the request's abort handle fires.
    pub body: ByteStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Issues one physical request per call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestOptions, cancel: AbortHandle) -> Result<TransportResponse>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, request: &RequestOptions) -> Result<reqwest::RequestBuilder> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| FeedError::InvalidRequest(format!("bad method {:?}", request.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FeedError::InvalidRequest(format!("bad header name {name:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| FeedError::InvalidRequest(format!("bad value for header {name}")))?;
            headers.insert(name, value);
        }

        let mut builder = self
            .client
            .request(method, &request.url)
            .headers(headers)
            .query(&request.query);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout_ms) = request.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        Ok(builder)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &RequestOptions, cancel: AbortHandle) -> Result<TransportResponse> {
        let builder = self.build(request)?;
        tracing::debug!(url = %request.url, method = %request.method, "sending feed request");

        let response = tokio::select! {
            biased;
            _ = cancel.aborted() => {
                return Err(FeedError::Transport {
                    code: None,
                    message: "request aborted".to_string(),
                });
            }
            response = builder.send() => response?,
        };

        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map_err(FeedError::from)
            .take_until(cancel.aborted_owned())
            .boxed();
        Ok(TransportResponse { status, body })
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string();
        FeedError::Transport {
            code: error_code(&err).map(str::to_string),
            message,
        }
    }
}

/// OS-style code for a reqwest failure, looking through its source chain.
fn error_code(err: &reqwest::Error) -> Option<&'static str> {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>()
            && let Some(code) = io_code(io_err.kind())
        {
            return Some(code);
        }
        if cause.to_string().to_ascii_lowercase().contains("chunk size") {
            return Some("HPE_INVALID_CHUNK_SIZE");
        }
        source = cause.source();
    }

    if err.is_timeout() {
        Some("ETIMEDOUT")
    } else if err.is_connect() {
        Some("ECONNREFUSED")
    } else if err.is_body() || err.is_decode() {
        Some("ECONNRESET")
    } else {
        None
    }
}

fn io_code(kind: io::ErrorKind) -> Option<&'static str> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Some("ECONNRESET"),
        io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => Some("ENETUNREACH"),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Some("ECONNRESET"),
        _ => None,
    }
}
