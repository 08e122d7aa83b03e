//! Pull-based decoder for the SSE wire format.
//!
//! The decoder is split into two layers, so the parsing rules can be
//! exercised without any I/O:
//!
//! - [`EventParser`] is a pure incremental parser. It is fed raw byte chunks
//!   and yields complete events as records terminate.
//! - [`Decoder`] pulls chunks from a byte stream (typically an HTTP response
//!   body), enforcing an optional per-read deadline, and hands them to the
//!   parser.
//!
//! Parsing rules follow the SSE processing model:
//!
//! - a record is terminated by a blank line; records with no `data`, no
//!   `event` and no `id` are not emitted;
//! - an `id` value containing a NUL byte is ignored entirely;
//! - an empty `id` value clears the running last-event-id, and an absent
//!   `id` field leaves it untouched;
//! - multiple `data` lines are joined with `\n` (no trailing newline);
//! - `retry` must parse as a non-negative integer, otherwise it is ignored;
//! - comment lines (leading `:`) and unknown field names are skipped.

use crate::error::{EventSourceError, Result};
use crate::types::Event;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use http::HeaderMap;
use std::collections::VecDeque;
use std::time::Duration;

/// Incremental SSE record parser.
///
/// Feed it byte chunks as they arrive; it buffers partial lines and returns
/// every event completed by the chunk.
pub struct EventParser {
    buf: Vec<u8>,
    // record under construction
    id: Option<String>,
    name: String,
    data: Vec<String>,
    retry: Option<u64>,
    last_event_id: String,
}

impl EventParser {
    /// Create a parser whose running last-event-id starts at `last_event_id`.
    pub fn new(last_event_id: impl Into<String>) -> Self {
        EventParser {
            buf: Vec::new(),
            id: None,
            name: String::new(),
            data: Vec::new(),
            retry: None,
            last_event_id: last_event_id.into(),
        }
    }

    /// Consume a chunk and return the events it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<Event> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // Comment: read activity only, no state change.
            return None;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "id" => {
                if !value.contains('\0') {
                    self.id = Some(value.to_string());
                }
            }
            "event" => self.name = value.to_string(),
            "data" => self.data.push(value.to_string()),
            "retry" => {
                if let Ok(millis) = value.parse::<u64>() {
                    self.retry = Some(millis);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Event> {
        if self.id.is_none() && self.name.is_empty() && self.data.is_empty() {
            // Stray blank lines and records carrying only unusable fields.
            self.retry = None;
            return None;
        }
        let id = self.id.take();
        if let Some(ref id) = id {
            self.last_event_id = id.clone();
        }
        let event = Event::from_wire(
            id.unwrap_or_default(),
            std::mem::take(&mut self.name),
            self.data.join("\n"),
            self.last_event_id.clone(),
            self.retry.take(),
        );
        self.data.clear();
        Some(event)
    }
}

/// Decoder for an SSE byte stream.
///
/// [`decode`](Decoder::decode) blocks until one complete record has been
/// parsed or an error occurs. Between records, arrival of any bytes —
/// including comments — counts as activity and restarts the read deadline.
pub struct Decoder {
    chunks: BoxStream<'static, Result<Bytes>>,
    parser: EventParser,
    ready: VecDeque<Event>,
    read_timeout: Option<Duration>,
    headers: HeaderMap,
    eof: bool,
}

impl Decoder {
    /// Create a decoder over a stream of byte chunks.
    pub fn new<S>(chunks: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Decoder {
            chunks: chunks.boxed(),
            parser: EventParser::new(""),
            ready: VecDeque::new(),
            read_timeout: None,
            headers: HeaderMap::new(),
            eof: false,
        }
    }

    /// Create a decoder over a fixed byte buffer. Mostly useful in tests.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new(futures::stream::iter([Ok(data.into())]))
    }

    /// Fail a [`decode`](Decoder::decode) call with
    /// [`EventSourceError::ReadTimeout`] if no bytes arrive within `timeout`.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Seed the running last-event-id, reported on events that do not carry
    /// their own id.
    #[must_use]
    pub fn with_last_event_id(mut self, last_event_id: impl Into<String>) -> Self {
        self.parser.last_event_id = last_event_id.into();
        self
    }

    /// Attach the response headers of the connection this decoder reads.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Headers of the response this decoder was attached to.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Read until one complete event is available and return it.
    ///
    /// Returns [`EventSourceError::Eof`] once the underlying stream ends, and
    /// [`EventSourceError::ReadTimeout`] if a read deadline is configured and
    /// expires.
    pub async fn decode(&mut self) -> Result<Event> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(event);
            }
            if self.eof {
                return Err(EventSourceError::Eof);
            }
            let next = match self.read_timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.chunks.next())
                    .await
                    .map_err(|_| EventSourceError::ReadTimeout)?,
                None => self.chunks.next().await,
            };
            match next {
                Some(Ok(chunk)) => self.ready.extend(self.parser.feed(&chunk)),
                Some(Err(err)) => return Err(err),
                None => self.eof = true,
            }
        }
    }
}
