//! Error classification for reconnect decisions
//!
//! A total function from an error's code and message to [`ErrorClass`].
//! Retryable errors are absorbed by reconnecting; everything else surfaces.

/// Codes seen when the remote end restarts, the host sleeps/wakes, or many
/// simultaneous connections are open.
const RETRYABLE_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ENETUNREACH",
    "ECONNRESET",
    "ETIMEDOUT",
    "HPE_INVALID_CHUNK_SIZE",
];

/// Matched case-insensitively against the message.
///
/// "Invalid JSON" shows up on continuous feeds when the server is restarted
/// mid-response.
// No "timeout": a server-side timeout response stays fatal.
const RETRYABLE_MESSAGES: &[&str] = &[
    "invalid json",
    "emfile",
    "socket hang up",
    "hpe_invalid_chunk_size",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reconnect through the backoff policy.
    Retryable,
    /// Surface to the consumer without reconnecting.
    Fatal,
}

pub fn classify(code: Option<&str>, message: &str) -> ErrorClass {
    if code.is_some_and(|code| RETRYABLE_CODES.contains(&code)) {
        return ErrorClass::Retryable;
    }

    let message = message.to_ascii_lowercase();
    if RETRYABLE_MESSAGES
        .iter()
        .any(|pattern| message.contains(pattern))
    {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}
