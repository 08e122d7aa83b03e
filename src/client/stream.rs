//! A resilient SSE stream: connects, decodes, and transparently reconnects.
//!
//! The public [`Stream`] handle exposes the events channel (and the errors
//! channel, unless an error handler was installed) plus the [`restart`]
//! and [`close`] signals. All streaming work happens on a worker task:
//!
//! - **Streaming** — a helper task reads the decoder and hands results to
//!   the worker, which multiplexes them with restart/close signals;
//! - **Reconnecting** — the previous connection has been discarded and a
//!   timer scheduled from the retry-delay strategy will fire the next
//!   attempt;
//! - **Terminated** — the worker has exited and closed both public channels.
//!
//! [`restart`]: Stream::restart
//! [`close`]: Stream::close

use crate::client::config::{ErrorAction, FirstConnectionRetry, QueryParamsFn, StreamBuilder, StreamErrorHandler};
use crate::client::retry::{Backoff, Jitter, RetryDelayStrategy};
use crate::error::{EventSourceError, Result, SubscriptionError};
use crate::protocol::Decoder;
use crate::types::Event;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::time::{Duration, Instant};

const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Handle to a running SSE subscription.
///
/// Created by [`StreamBuilder::subscribe`]. Receiving from
/// [`events`](Stream::events) drives consumption; the stream reconnects on
/// its own when the connection fails, carrying the last seen event id so the
/// server can replay missed events.
///
/// Dropping the handle closes the stream.
pub struct Stream {
    events: async_channel::Receiver<Event>,
    errors: Option<async_channel::Receiver<EventSourceError>>,
    restarter: async_channel::Sender<()>,
    closer: async_channel::Sender<()>,
}

impl Stream {
    /// The channel on which decoded events are delivered.
    ///
    /// The channel is closed exactly once, when the stream terminates. A
    /// consumer that stops receiving exerts backpressure all the way down to
    /// the connection.
    pub fn events(&self) -> async_channel::Receiver<Event> {
        self.events.clone()
    }

    /// The channel on which streaming errors are delivered, or `None` if an
    /// error handler was installed instead.
    ///
    /// Errors during the initial connection are never delivered here; they
    /// are returned by [`StreamBuilder::subscribe`].
    pub fn errors(&self) -> Option<async_channel::Receiver<EventSourceError>> {
        self.errors.clone()
    }

    /// Drop the current connection and reconnect after the usual retry
    /// delay, as if the connection had failed (but without reporting an
    /// error).
    ///
    /// Non-blocking and coalescing: if a restart is already pending, this
    /// call has no additional effect. The restart is asynchronous — events
    /// from the old connection may still arrive after it returns. After
    /// [`close`](Stream::close), restarting is a no-op.
    pub fn restart(&self) {
        let _ = self.restarter.try_send(());
    }

    /// Close the stream permanently.
    ///
    /// Idempotent and safe to call from any task. The worker observes the
    /// signal, discards any connection, and closes the events (and errors)
    /// channels exactly once. In-flight events are not guaranteed to be
    /// delivered.
    pub fn close(&self) {
        self.closer.close();
    }
}

struct Connection {
    rx: async_channel::Receiver<Result<Event>>,
    handle: tokio::task::JoinHandle<()>,
}

/// Receive the next decoder result, or park forever when there is no active
/// connection (the worker is then only interested in its other signals).
async fn next_decoded(conn: &Option<Connection>) -> Result<Event> {
    match conn {
        Some(connection) => match connection.rx.recv().await {
            Ok(result) => result,
            // The helper exits right after delivering a terminal error, so a
            // closed channel here carries no information.
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Close the response body and drain the helper task so nothing leaks.
async fn discard(conn: Option<Connection>) {
    if let Some(connection) = conn {
        connection.handle.abort();
        connection.rx.close();
        while connection.rx.try_recv().is_ok() {}
        let _ = connection.handle.await;
    }
}

struct Worker {
    client: reqwest::Client,
    request: reqwest::Request,
    query_params_fn: Option<QueryParamsFn>,
    last_event_id: String,
    read_timeout: Option<Duration>,
    retry: RetryDelayStrategy,
    connections: u64,
    events_tx: async_channel::Sender<Event>,
    errors_tx: Option<async_channel::Sender<EventSourceError>>,
    error_handler: Option<StreamErrorHandler>,
    restarter_rx: async_channel::Receiver<()>,
    closer_rx: async_channel::Receiver<()>,
}

impl Worker {
    /// Issue one connection attempt and return the response headers and
    /// body stream.
    async fn connect(&mut self) -> Result<(HeaderMap, ByteStream)> {
        let mut request = self.request.try_clone().ok_or_else(|| {
            EventSourceError::Config(
                "request body must be reproducible to support reconnection".into(),
            )
        })?;
        let headers = request.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        if !self.last_event_id.is_empty() {
            let value = HeaderValue::from_str(&self.last_event_id).map_err(|err| {
                EventSourceError::Config(format!("invalid last event id: {err}"))
            })?;
            headers.insert(LAST_EVENT_ID, value);
        }
        if let Some(params_fn) = &self.query_params_fn {
            let url = request.url_mut();
            let existing = url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            let replaced = params_fn(existing);
            if replaced.is_empty() {
                url.set_query(None);
            } else {
                url.query_pairs_mut().clear().extend_pairs(replaced);
            }
        }

        let response = self.client.execute(request).await?;
        self.connections += 1;
        tracing::debug!(connection = self.connections, status = %response.status(), "connected");
        if response.status() != StatusCode::OK {
            let code = response.status();
            let header = response.headers().clone();
            let message = response.text().await.unwrap_or_default();
            return Err(SubscriptionError {
                code,
                message,
                header,
            }
            .into());
        }
        let headers = response.headers().clone();
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(EventSourceError::from))
            .boxed();
        Ok((headers, bytes))
    }

    /// Spawn the helper task that pulls the decoder and forwards results.
    fn start_reader(&self, headers: HeaderMap, bytes: ByteStream) -> Connection {
        let mut decoder = Decoder::new(bytes)
            .with_last_event_id(self.last_event_id.clone())
            .with_headers(headers);
        if let Some(timeout) = self.read_timeout {
            decoder = decoder.with_read_timeout(timeout);
        }
        let (tx, rx) = async_channel::bounded(1);
        let handle = tokio::spawn(async move {
            loop {
                let result = decoder.decode().await;
                let is_err = result.is_err();
                if tx.send(result).await.is_err() || is_err {
                    return;
                }
            }
        });
        Connection { rx, handle }
    }

    fn schedule_retry(&mut self, retry_tx: &async_channel::Sender<()>) {
        let delay = self.retry.next_retry_delay(Instant::now());
        tracing::info!(delay = ?delay, "reconnecting after delay");
        let retry_tx = retry_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = retry_tx.try_send(());
        });
    }

    /// Route an error to the handler or the errors channel. Returns `false`
    /// if the stream must stop.
    async fn report_error(&self, err: EventSourceError) -> bool {
        if let Some(handler) = &self.error_handler {
            if handler(&err) == ErrorAction::Stop {
                return false;
            }
        } else if let Some(errors_tx) = &self.errors_tx {
            tokio::select! {
                result = errors_tx.send(err) => {
                    if result.is_err() {
                        return false;
                    }
                }
                _ = self.closer_rx.recv() => return false,
            }
        }
        true
    }

    /// Bookkeep a decoded event and forward it to the consumer. Returns
    /// `false` if the stream was closed (or abandoned) while sending.
    async fn dispatch_event(&mut self, event: Event) -> bool {
        if let Some(retry_ms) = event.retry() {
            if retry_ms > 0 {
                self.retry.set_base_delay(Duration::from_millis(retry_ms));
            }
        }
        self.last_event_id = event.last_event_id().to_string();
        self.retry.set_good_since(Instant::now());
        tokio::select! {
            result = self.events_tx.send(event) => result.is_ok(),
            _ = self.closer_rx.recv() => false,
        }
    }

    async fn run(mut self, headers: HeaderMap, bytes: ByteStream) {
        let (retry_tx, retry_rx) = async_channel::bounded::<()>(1);
        let mut conn = Some(self.start_reader(headers, bytes));
        loop {
            tokio::select! {
                _ = self.closer_rx.recv() => {
                    discard(conn.take()).await;
                    break;
                }
                restart = self.restarter_rx.recv() => match restart {
                    Ok(()) => {
                        discard(conn.take()).await;
                        self.schedule_retry(&retry_tx);
                    }
                    // The handle was dropped without an explicit close.
                    Err(_) => {
                        discard(conn.take()).await;
                        break;
                    }
                },
                result = next_decoded(&conn) => match result {
                    Ok(event) => {
                        if !self.dispatch_event(event).await {
                            discard(conn.take()).await;
                            break;
                        }
                    }
                    Err(err) => {
                        let proceed = self.report_error(err).await;
                        discard(conn.take()).await;
                        if !proceed {
                            break;
                        }
                        self.schedule_retry(&retry_tx);
                    }
                },
                _ = retry_rx.recv() => match self.connect().await {
                    Ok((headers, bytes)) => conn = Some(self.start_reader(headers, bytes)),
                    Err(err) => {
                        if !self.report_error(err).await {
                            break;
                        }
                        self.schedule_retry(&retry_tx);
                    }
                },
            }
        }
        if let Some(errors_tx) = &self.errors_tx {
            errors_tx.close();
        }
        self.events_tx.close();
    }
}

/// Perform the initial connection for `builder`, retrying per its
/// first-connection policy, then hand the connection to a spawned worker.
pub(crate) async fn subscribe(builder: StreamBuilder) -> Result<Stream> {
    let backoff = builder
        .use_backoff
        .then(|| Backoff::new(builder.max_retry));
    let jitter = builder
        .use_jitter
        .then(|| Jitter::new(Jitter::DEFAULT_RATIO));
    let retry = RetryDelayStrategy::new(
        builder.initial_retry,
        builder.retry_reset_interval,
        backoff,
        jitter,
    );

    let (events_tx, events_rx) = async_channel::bounded(1);
    let (errors_tx, errors_rx) = if builder.error_handler.is_none() {
        let (tx, rx) = async_channel::bounded(1);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let (restarter_tx, restarter_rx) = async_channel::bounded(1);
    let (closer_tx, closer_rx) = async_channel::bounded::<()>(1);

    let first_connection_retry = builder.first_connection_retry;
    let mut worker = Worker {
        client: builder.http_client.unwrap_or_default(),
        request: builder.request,
        query_params_fn: builder.query_params_fn,
        last_event_id: builder.last_event_id,
        read_timeout: builder.read_timeout,
        retry,
        connections: 0,
        events_tx,
        errors_tx,
        error_handler: builder.error_handler,
        restarter_rx,
        closer_rx,
    };

    let deadline = match first_connection_retry {
        FirstConnectionRetry::Deadline(timeout) => Some(tokio::time::Instant::now() + timeout),
        _ => None,
    };
    loop {
        match worker.connect().await {
            Ok((headers, bytes)) => {
                tokio::spawn(worker.run(headers, bytes));
                return Ok(Stream {
                    events: events_rx,
                    errors: errors_rx,
                    restarter: restarter_tx,
                    closer: closer_tx,
                });
            }
            Err(err) => {
                if first_connection_retry == FirstConnectionRetry::Never {
                    return Err(err);
                }
                if let Some(handler) = &worker.error_handler {
                    if handler(&err) == ErrorAction::Stop {
                        return Err(err);
                    }
                }
                let delay = worker.retry.next_retry_delay(Instant::now());
                tracing::info!(error = %err, delay = ?delay, "initial connection failed, retrying");
                match deadline {
                    Some(deadline) => tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => return Err(err),
                        _ = tokio::time::sleep(delay) => {}
                    },
                    None => tokio::time::sleep(delay).await,
                }
            }
        }
    }
}
