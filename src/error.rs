//! Error types for SSE stream and server operations.
//!
//! The [`Result`] type alias provides a convenient shorthand for operations
//! that may fail.
//!
//! # Error Categories
//!
//! | Category | Variants | Retried by the stream |
//! |----------|----------|-----------------------|
//! | Transport | `Transport`, `Eof` | Yes |
//! | HTTP status | `Subscription` | Yes (unless the handler stops it) |
//! | Read deadline | `ReadTimeout` | Yes |
//! | Encoding | `Encode` | No (the subscriber is dropped) |
//! | Configuration | `Config` | No (construction fails) |

use http::{HeaderMap, StatusCode};
use std::io;
use thiserror::Error;

/// Result type for SSE operations.
pub type Result<T> = std::result::Result<T, EventSourceError>;

/// Error returned when the server answers a subscription request with a
/// non-200 status.
///
/// Carries the status code, the response body (if any) and the response
/// headers, so callers can distinguish e.g. an expired token from an outage.
#[derive(Debug)]
pub struct SubscriptionError {
    /// HTTP status code of the rejected subscription request.
    pub code: StatusCode,
    /// Response body, read in full before the connection was closed.
    pub message: String,
    /// Response headers.
    pub header: HeaderMap,
}

impl std::fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}", self.code.as_u16())?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for SubscriptionError {}

/// Errors that can occur while streaming or serving Server-Sent Events.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EventSourceError {
    /// No data arrived on the stream within the configured read timeout.
    ///
    /// The connection is dropped and, for a [`Stream`](crate::Stream), a
    /// reconnect is scheduled.
    #[error("read timeout on stream")]
    ReadTimeout,

    /// The server ended the event stream.
    ///
    /// SSE connections are expected to stay open indefinitely; a clean end of
    /// stream is reported so the stream can reconnect.
    #[error("end of stream")]
    Eof,

    /// Transport-level failure from the HTTP client (DNS, connect, TLS,
    /// broken body stream).
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server rejected the subscription request with a non-200 status.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// Writing an encoded frame to the wire failed.
    #[error("encode error: {0}")]
    Encode(#[from] io::Error),

    /// Invalid parameters were provided when building a stream or server.
    #[error("configuration error: {0}")]
    Config(String),
}
