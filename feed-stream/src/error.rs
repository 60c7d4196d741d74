//! Error types for feed consumption

use std::sync::Arc;

use thiserror::Error;

use crate::classify::{ErrorClass, classify};

/// Feed result type alias
pub type Result<T> = std::result::Result<T, FeedError>;

/// Everything that can end or interrupt a feed.
///
/// Cloneable so the same fatal error can be handed to the pulling iterator and
/// to any sink registered with [`crate::PersistentStream::pipe_errors_to`].
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// Connection-level failure. `code` carries the OS-style code
    /// (`ECONNRESET`, ...) when one could be determined.
    #[error("{message}")]
    Transport {
        code: Option<String>,
        message: String,
    },

    /// Server answered with a non-success status.
    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The watchdog recycled a connection that had been open too long.
    #[error("socket hang up (forced reconnect)")]
    ForcedReconnect,

    #[error("gave up reconnecting after {attempts} failed attempts")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<FeedError>,
    },

    /// The consumer's item callback or transform failed.
    #[error("{0}")]
    Callback(Arc<anyhow::Error>),

    #[error("Invalid request options: {0}")]
    InvalidRequest(String),
}

impl FeedError {
    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        FeedError::Transport {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn callback(err: anyhow::Error) -> Self {
        FeedError::Callback(Arc::new(err))
    }

    /// OS-style error code, when the failure has one.
    pub fn code(&self) -> Option<&str> {
        match self {
            FeedError::Transport { code, .. } => code.as_deref(),
            FeedError::ForcedReconnect => Some("ECONNRESET"),
            _ => None,
        }
    }

    /// Retryable errors trigger a reconnect; fatal ones reach the consumer.
    pub fn class(&self) -> ErrorClass {
        match self {
            FeedError::RetriesExhausted { .. }
            | FeedError::Status { .. }
            | FeedError::Callback(_)
            | FeedError::InvalidRequest(_) => ErrorClass::Fatal,
            _ => classify(self.code(), &self.to_string()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// Errors raised by the incremental JSON decoder.
///
/// Lexical errors carry the `Invalid JSON` prefix, structural errors do not;
/// the classification of the two differs accordingly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Invalid JSON (Unexpected {found} at position {position} in state {state})")]
    InvalidCharacter {
        found: String,
        position: usize,
        state: &'static str,
    },

    /// `value` is the offending token as JSON text, e.g. `STRING(" }, { ")`.
    #[error("Unexpected {token}{} in state {state}", token_value(.value))]
    UnexpectedToken {
        token: &'static str,
        value: Option<String>,
        state: &'static str,
    },

    #[error("Invalid JSON ({0})")]
    Malformed(String),

    #[error("Invalid selector {0:?}")]
    InvalidSelector(String),

    /// Decoded JSON did not fit the item type requested by the caller.
    #[error("Cannot convert decoded item: {0}")]
    Convert(String),
}

fn token_value(value: &Option<String>) -> String {
    value
        .as_deref()
        .map(|value| format!("({value})"))
        .unwrap_or_default()
}
