//! Configuration for the streaming client.
//!
//! [`StreamBuilder`] collects every knob of a [`Stream`](crate::Stream)
//! before the initial connection is attempted:
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `with_initial_retry` | 3 s | base reconnection delay |
//! | `with_max_retry` | 30 s | backoff cap |
//! | `with_retry_reset_interval` | 60 s | stable-connection threshold that resets backoff |
//! | `with_backoff` | off | exponential delay growth |
//! | `with_jitter` | off | randomized delay reduction (up to 50%) |
//! | `with_last_event_id` | `""` | seed for the `Last-Event-ID` header |
//! | `with_read_timeout` | none | per-record read deadline |
//! | `with_http_client` | fresh client | transport override |
//! | `with_error_handler` | none | callback replacing the errors channel |
//! | `with_first_connection_retry` | off | apply the retry policy to the initial connect, up to a deadline |
//! | `with_unlimited_first_connection_retry` | off | as above, with no deadline |
//! | `with_dynamic_query_params` | none | rewrite URL query values on every connect |

use crate::client::stream::{self, Stream};
use crate::error::{EventSourceError, Result};
use std::sync::Arc;
use std::time::Duration;

/// Default base reconnection delay.
pub const DEFAULT_INITIAL_RETRY: Duration = Duration::from_secs(3);
/// Default cap on the reconnection delay when backoff is enabled.
pub const DEFAULT_MAX_RETRY: Duration = Duration::from_secs(30);
/// Default interval a connection must stay healthy before backoff resets.
pub const DEFAULT_RETRY_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// Decision returned by a stream error handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Handle the error normally: retry the connection (or, during the
    /// initial connect, keep retrying if first-connection retry is enabled).
    Proceed,
    /// Stop immediately and permanently, as if the stream had been closed.
    Stop,
}

/// Callback invoked for every stream error.
///
/// When a handler is installed the errors channel is never used; the
/// handler's return value drives the reconnect decision. It is called on the
/// stream's worker task and should return promptly.
pub type StreamErrorHandler = Arc<dyn Fn(&EventSourceError) -> ErrorAction + Send + Sync>;

/// Callback rewriting the request's query parameters on every connection
/// attempt. Receives the current query pairs; its return value replaces
/// them. Enables e.g. token rotation without rebuilding the request.
pub type QueryParamsFn =
    Arc<dyn Fn(Vec<(String, String)>) -> Vec<(String, String)> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FirstConnectionRetry {
    /// An initial connection failure is returned to the caller unretried.
    Never,
    /// Retry the initial connection until the deadline elapses.
    Deadline(Duration),
    /// Retry the initial connection indefinitely.
    Indefinite,
}

/// Builder for a [`Stream`].
pub struct StreamBuilder {
    pub(crate) request: reqwest::Request,
    pub(crate) http_client: Option<reqwest::Client>,
    pub(crate) initial_retry: Duration,
    pub(crate) max_retry: Duration,
    pub(crate) retry_reset_interval: Duration,
    pub(crate) use_backoff: bool,
    pub(crate) use_jitter: bool,
    pub(crate) last_event_id: String,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) first_connection_retry: FirstConnectionRetry,
    pub(crate) error_handler: Option<StreamErrorHandler>,
    pub(crate) query_params_fn: Option<QueryParamsFn>,
}

impl StreamBuilder {
    /// Subscribe to the events emitted from the given URL with a GET
    /// request.
    pub fn new(url: &str) -> Result<Self> {
        let url = reqwest::Url::parse(url)
            .map_err(|err| EventSourceError::Config(format!("invalid url: {err}")))?;
        Self::for_request(reqwest::Request::new(reqwest::Method::GET, url))
    }

    /// Subscribe using a caller-built request, allowing custom methods,
    /// headers, authentication or a body.
    ///
    /// A request body must be reproducible (set from bytes, not a one-shot
    /// stream), since it is re-sent on every reconnection attempt.
    pub fn for_request(request: reqwest::Request) -> Result<Self> {
        if request.try_clone().is_none() {
            return Err(EventSourceError::Config(
                "request body must be reproducible to support reconnection".into(),
            ));
        }
        Ok(StreamBuilder {
            request,
            http_client: None,
            initial_retry: DEFAULT_INITIAL_RETRY,
            max_retry: DEFAULT_MAX_RETRY,
            retry_reset_interval: DEFAULT_RETRY_RESET_INTERVAL,
            use_backoff: false,
            use_jitter: false,
            last_event_id: String::new(),
            read_timeout: None,
            first_connection_retry: FirstConnectionRetry::Never,
            error_handler: None,
            query_params_fn: None,
        })
    }

    /// Set the base reconnection delay.
    #[must_use]
    pub fn with_initial_retry(mut self, initial_retry: Duration) -> Self {
        self.initial_retry = initial_retry;
        self
    }

    /// Set the maximum reconnection delay. Only relevant with backoff.
    #[must_use]
    pub fn with_max_retry(mut self, max_retry: Duration) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Set how long a connection must stay healthy before the backoff delay
    /// resets to the base value.
    #[must_use]
    pub fn with_retry_reset_interval(mut self, interval: Duration) -> Self {
        self.retry_reset_interval = interval;
        self
    }

    /// Double the reconnection delay after each consecutive failure, up to
    /// the maximum. Recommended together with jitter to avoid thundering
    /// herds after an outage.
    #[must_use]
    pub fn with_backoff(mut self, use_backoff: bool) -> Self {
        self.use_backoff = use_backoff;
        self
    }

    /// Randomly reduce each reconnection delay by up to 50%.
    #[must_use]
    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    /// Seed the last event id sent to the server in the `Last-Event-ID`
    /// header, in case it can replay missed events.
    #[must_use]
    pub fn with_last_event_id(mut self, last_event_id: impl Into<String>) -> Self {
        self.last_event_id = last_event_id.into();
        self
    }

    /// Restart the connection if no data arrives within `timeout`. There is
    /// no read timeout by default.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Override the HTTP client used for all connection attempts.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Install an error handler. The errors channel is then never used; the
    /// handler decides whether the stream retries or stops.
    #[must_use]
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&EventSourceError) -> ErrorAction + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Apply the retry policy to the initial connection attempt instead of
    /// failing fast, giving up once `timeout` has elapsed.
    #[must_use]
    pub fn with_first_connection_retry(mut self, timeout: Duration) -> Self {
        self.first_connection_retry = FirstConnectionRetry::Deadline(timeout);
        self
    }

    /// Apply the retry policy to the initial connection attempt and keep
    /// retrying indefinitely until it succeeds.
    #[must_use]
    pub fn with_unlimited_first_connection_retry(mut self) -> Self {
        self.first_connection_retry = FirstConnectionRetry::Indefinite;
        self
    }

    /// Rewrite the URL query parameters on every connection attempt.
    #[must_use]
    pub fn with_dynamic_query_params<F>(mut self, params_fn: F) -> Self
    where
        F: Fn(Vec<(String, String)>) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.query_params_fn = Some(Arc::new(params_fn));
        self
    }

    /// Perform the initial connection and return the running [`Stream`].
    ///
    /// Initial connection errors are reported here (and to the error
    /// handler, if any) — never on the errors channel, which the caller
    /// cannot consume yet.
    pub async fn subscribe(self) -> Result<Stream> {
        stream::subscribe(self).await
    }
}
