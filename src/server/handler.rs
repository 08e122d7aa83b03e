//! Per-subscriber HTTP handler: attaches to the server, streams encoded
//! frames to the response, and detaches on client close, server shutdown,
//! or encode failure.

use crate::protocol::Encoder;
use crate::server::{Server, SubscriptionKey};
use async_stream::stream;
use axum::body::Body;
use axum::response::Response;
use axum::routing::{get, MethodRouter};
use bytes::Bytes;
use http::{header, HeaderMap};
use std::convert::Infallible;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

pub(crate) fn channel_handler(server: Server, channel: String) -> MethodRouter {
    get(move |request_headers: HeaderMap| {
        let server = server.clone();
        let channel = channel.clone();
        async move { serve(server, channel, request_headers).await }
    })
}

async fn serve(server: Server, channel: String, request_headers: HeaderMap) -> Response {
    let config = server.config();
    let use_gzip = config.gzip
        && request_headers
            .get(header::ACCEPT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("gzip"));

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::CONNECTION, "keep-alive");
    if config.allow_cors {
        response = response.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
    }
    if use_gzip {
        response = response.header(header::CONTENT_ENCODING, "gzip");
    }

    // A closed server no longer reads its subscription intake; subscribing
    // now would block forever.
    if server.is_closed() {
        return response.body(Body::empty()).unwrap();
    }

    let last_event_id = request_headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let Some((out_rx, key, unsubscriptions)) = server.attach(channel, last_event_id).await
    else {
        return response.body(Body::empty()).unwrap();
    };

    let max_conn_time = config.max_conn_time;
    let body = stream! {
        // Unsubscribes on every exit path except "queue closed", where the
        // owner has already dropped this subscriber. A client disconnect
        // drops this stream mid-await, which also runs the guard.
        let mut guard = UnsubscribeGuard {
            unsubscriptions,
            key: Some(key),
        };
        let buffer = ChunkBuffer::default();
        let mut encoder = Encoder::new(buffer.clone(), use_gzip);
        let deadline = async move {
            match max_conn_time {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                // Treated the same as a client disconnect.
                _ = &mut deadline => break,
                item = out_rx.recv() => match item {
                    Err(_) => {
                        guard.disarm();
                        break;
                    }
                    Ok(item) => match encoder.encode(&item) {
                        Ok(()) => {
                            let chunk = buffer.take();
                            if !chunk.is_empty() {
                                yield Ok::<Bytes, Infallible>(chunk);
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping subscriber after encode failure");
                            break;
                        }
                    },
                },
            }
        }
    };
    response.body(Body::from_stream(body)).unwrap()
}

struct UnsubscribeGuard {
    unsubscriptions: async_channel::Sender<SubscriptionKey>,
    key: Option<SubscriptionKey>,
}

impl UnsubscribeGuard {
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            // Unbounded queue; only fails once the owner is gone.
            let _ = self.unsubscriptions.try_send(key);
        }
    }
}

/// Accumulates encoder output so each encoded record can be taken as one
/// body chunk. Cloned handles share the same buffer.
#[derive(Clone, Default)]
struct ChunkBuffer(Arc<Mutex<Vec<u8>>>);

impl ChunkBuffer {
    fn take(&self) -> Bytes {
        let mut buffer = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        Bytes::from(std::mem::take(&mut *buffer))
    }
}

impl Write for ChunkBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
