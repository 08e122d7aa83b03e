//! The resilient SSE streaming client.

mod config;
mod retry;
mod stream;

pub use config::{
    ErrorAction, QueryParamsFn, StreamBuilder, StreamErrorHandler, DEFAULT_INITIAL_RETRY,
    DEFAULT_MAX_RETRY, DEFAULT_RETRY_RESET_INTERVAL,
};
pub use stream::Stream;

pub(crate) use retry::Jitter;
