//! eventsource_rs: Server-Sent Events client and server for Rust.
//!
//! This crate implements both sides of the SSE protocol, streaming data
//! one-way over an HTTP connection:
//!
//! - **client**: [`Stream`] subscribes to an SSE endpoint, decodes the event
//!   stream, and transparently reconnects with configurable backoff and
//!   jitter. The last seen event id is sent back on reconnect in the
//!   `Last-Event-ID` header so the server can replay missed events.
//! - **server**: [`Server`] fans published events out to any number of
//!   concurrent HTTP subscribers per named channel, evicting subscribers
//!   that fall too far behind. A pluggable [`Repository`] replays history to
//!   late subscribers.
//! - **protocol**: the wire codec used by both — a pull-based [`Decoder`]
//!   with a read deadline and an [`Encoder`] with optional gzip compression.
//!
//! # Subscribing to a stream
//!
//! ```no_run
//! use eventsource_rs::StreamBuilder;
//!
//! # async fn run() -> eventsource_rs::Result<()> {
//! let stream = StreamBuilder::new("http://example.com/events")?
//!     .with_backoff(true)
//!     .with_jitter(true)
//!     .subscribe()
//!     .await?;
//! while let Ok(event) = stream.events().recv().await {
//!     println!("{}: {}", event.id(), event.data());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Serving channels
//!
//! ```no_run
//! use eventsource_rs::{Event, Server};
//!
//! # async fn run() {
//! let server = Server::new();
//! let app: axum::Router = axum::Router::new()
//!     .route("/articles", server.handler("articles"));
//! // ... bind and serve `app` with axum ...
//! server.publish(&["articles"], Event::new("breaking").with_id("1")).await;
//! # }
//! ```

mod client;
mod error;
pub mod protocol;
mod server;
mod types;

pub use client::{
    ErrorAction, QueryParamsFn, Stream, StreamBuilder, StreamErrorHandler, DEFAULT_INITIAL_RETRY,
    DEFAULT_MAX_RETRY, DEFAULT_RETRY_RESET_INTERVAL,
};
pub use error::{EventSourceError, Result, SubscriptionError};
pub use protocol::{Decoder, Encoder};
pub use server::{
    Repository, Server, ServerConfig, SliceRepository, DEFAULT_BUFFER_SIZE,
};
pub use types::{Comment, Event, EventOrComment};
