//! Shared fixtures: tiny axum apps that speak just enough SSE to exercise
//! the client, plus a spawner for ephemeral-port test servers.

#![allow(dead_code)]

use async_stream::stream;
use axum::body::Body;
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use std::convert::Infallible;
use std::sync::Once;
use std::time::Duration;

static TRACING: Once = Once::new();

/// Install a test-writer tracing subscriber once, honoring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Serve `router` on an ephemeral port and return the base URL.
pub async fn spawn_app(router: Router) -> String {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve test app");
    });
    format!("http://{addr}")
}

/// An SSE response around the given body.
pub fn sse_response(body: Body) -> Response {
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(body)
        .expect("build sse response")
}

/// A body that delivers `data` and then ends, dropping the connection.
pub fn body_once(data: impl Into<String>) -> Body {
    Body::from(data.into())
}

/// A body that delivers `data` and then stays open forever.
pub fn body_then_hang(data: impl Into<String>) -> Body {
    let data = data.into();
    Body::from_stream(stream! {
        yield Ok::<_, Infallible>(Bytes::from(data));
        std::future::pending::<()>().await;
    })
}

/// A body that delivers `data` and then keeps the connection alive with a
/// comment every `interval`.
pub fn body_with_heartbeats(data: impl Into<String>, interval: Duration) -> Body {
    let data = data.into();
    Body::from_stream(stream! {
        yield Ok::<_, Infallible>(Bytes::from(data));
        loop {
            tokio::time::sleep(interval).await;
            yield Ok::<_, Infallible>(Bytes::from_static(b":keep-alive\n"));
        }
    })
}

/// Drain a stream's errors channel so the worker never blocks reporting.
pub fn drain_errors(stream: &eventsource_rs::Stream) {
    if let Some(errors) = stream.errors() {
        tokio::spawn(async move { while errors.recv().await.is_ok() {} });
    }
}

/// Receive one event within `timeout`, panicking otherwise.
pub async fn expect_event(
    events: &async_channel::Receiver<eventsource_rs::Event>,
    timeout: Duration,
) -> eventsource_rs::Event {
    tokio::time::timeout(timeout, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("events channel closed")
}
