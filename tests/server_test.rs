//! Server behavior: fan-out, slow-consumer eviction, acknowledgment
//! ordering, repository replay, shutdown, and the jittered variant.

mod common;

use axum::Router;
use common::*;
use eventsource_rs::{Event, Server, ServerConfig, SliceRepository, StreamBuilder};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const WAIT: Duration = Duration::from_secs(2);

async fn spawn_channel(server: &Server, channel: &str) -> String {
    let app = Router::new().route("/events", server.handler(channel));
    let base = spawn_app(app).await;
    format!("{base}/events")
}

async fn connect(url: &str) -> eventsource_rs::Stream {
    let stream = StreamBuilder::new(url)
        .unwrap()
        .with_initial_retry(Duration::from_millis(20))
        .subscribe()
        .await
        .unwrap();
    drain_errors(&stream);
    stream
}

#[tokio::test]
async fn fans_out_to_all_subscribers_in_order() {
    let server = Server::new();
    let url = spawn_channel(&server, "test").await;

    let first = connect(&url).await;
    let second = connect(&url).await;

    for i in 1..=5 {
        server
            .publish(&["test"], Event::new(format!("m{i}")).with_id(i.to_string()))
            .await;
    }

    for subscriber in [&first, &second] {
        let events = subscriber.events();
        for i in 1..=5 {
            let event = expect_event(&events, WAIT).await;
            assert_eq!(event.data(), format!("m{i}"));
        }
    }
    first.close();
    second.close();
    server.close().await;
}

#[tokio::test]
async fn channels_are_isolated() {
    let server = Server::new();
    let news_url = spawn_channel(&server, "news").await;
    let sports_url = spawn_channel(&server, "sports").await;

    let news = connect(&news_url).await;
    let sports = connect(&sports_url).await;

    server.publish(&["news"], Event::new("headline")).await;
    server.publish(&["sports"], Event::new("score")).await;

    assert_eq!(expect_event(&news.events(), WAIT).await.data(), "headline");
    assert_eq!(expect_event(&sports.events(), WAIT).await.data(), "score");
    news.close();
    sports.close();
    server.close().await;
}

#[tokio::test]
async fn acknowledgment_orders_publish_before_close() {
    let server = Server::new();
    let url = spawn_channel(&server, "test").await;
    let subscriber = connect(&url).await;
    let events = subscriber.events();

    let ack = server
        .publish_with_acknowledgment(&["test"], Event::new("last words"))
        .await;
    ack.await.expect("dispatch acknowledged");
    server.close().await;

    // The acknowledged event made it into the subscriber queue before the
    // shutdown closed it.
    assert_eq!(expect_event(&events, WAIT).await.data(), "last words");
    subscriber.close();
}

#[tokio::test]
async fn comments_reach_subscribers() {
    let server = Server::new();
    let url = spawn_channel(&server, "test").await;

    let response = reqwest::get(&url).await.unwrap();
    server.publish_comment(&["test"], "tick").await;
    let ack = server
        .publish_with_acknowledgment(&["test"], Event::new("payload"))
        .await;
    ack.await.unwrap();
    server.close().await;

    let body = response.bytes().await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains(":tick\n"), "body was {text:?}");
    assert!(text.contains("data: payload\n"), "body was {text:?}");
}

#[tokio::test]
async fn repository_replays_history_to_late_subscribers() {
    let server = Server::new();
    let repository = Arc::new(SliceRepository::new());
    for i in [2, 1, 3] {
        repository.add("articles", Event::new(format!("a{i}")).with_id(i.to_string()));
    }
    server.register("articles", repository).await;
    let url = spawn_channel(&server, "articles").await;

    // A subscriber advertising a last event id catches up from there.
    let resuming = StreamBuilder::new(&url)
        .unwrap()
        .with_last_event_id("2")
        .subscribe()
        .await
        .unwrap();
    drain_errors(&resuming);
    let events = resuming.events();
    assert_eq!(expect_event(&events, WAIT).await.id(), "2");
    assert_eq!(expect_event(&events, WAIT).await.id(), "3");

    // A fresh subscriber gets no replay, only live events.
    let fresh = connect(&url).await;
    server.publish(&["articles"], Event::new("live").with_id("4")).await;
    assert_eq!(expect_event(&fresh.events(), WAIT).await.id(), "4");

    resuming.close();
    fresh.close();
    server.close().await;
}

#[tokio::test]
async fn replay_all_replays_to_every_subscriber() {
    let server = Server::with_config(ServerConfig {
        replay_all: true,
        ..ServerConfig::default()
    });
    let repository = Arc::new(SliceRepository::new());
    repository.add("articles", Event::new("a1").with_id("1"));
    repository.add("articles", Event::new("a2").with_id("2"));
    server.register("articles", repository).await;
    let url = spawn_channel(&server, "articles").await;

    let subscriber = connect(&url).await;
    let events = subscriber.events();
    assert_eq!(expect_event(&events, WAIT).await.id(), "1");
    assert_eq!(expect_event(&events, WAIT).await.id(), "2");
    subscriber.close();
    server.close().await;
}

#[tokio::test]
async fn slow_subscriber_is_evicted_and_its_connection_terminates() {
    let server = Server::with_config(ServerConfig {
        buffer_size: 1,
        ..ServerConfig::default()
    });
    let url = spawn_channel(&server, "test").await;
    let host = url
        .strip_prefix("http://")
        .and_then(|rest| rest.strip_suffix("/events"))
        .unwrap()
        .to_string();

    // A subscriber that never reads its socket.
    let mut socket = tokio::net::TcpStream::connect(&host).await.unwrap();
    socket
        .write_all(
            b"GET /events HTTP/1.1\r\nHost: test\r\nAccept: text/event-stream\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The first event is huge, so the handler is stuck flushing it into the
    // unread socket; the second fills the queue; the third overflows it.
    server
        .publish(&["test"], Event::new("x".repeat(8 * 1024 * 1024)))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.publish(&["test"], Event::new("second")).await;
    server.publish(&["test"], Event::new("third")).await;

    // Eviction closed the queue; once we drain the socket, the handler winds
    // down and the connection reaches EOF.
    let mut total = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) => break,
            Err(_) => panic!("evicted handler did not terminate"),
        }
    }
    assert!(total > 0);

    // The server is still healthy for other subscribers.
    let survivor = connect(&url).await;
    server.publish(&["test"], Event::new("after")).await;
    assert_eq!(expect_event(&survivor.events(), WAIT).await.data(), "after");
    survivor.close();
    server.close().await;
}

#[tokio::test]
async fn unregister_with_force_disconnect_closes_subscribers() {
    let server = Server::new();
    let url = spawn_channel(&server, "test").await;

    let response = reqwest::get(&url).await.unwrap();
    let ack = server
        .publish_with_acknowledgment(&["test"], Event::new("hello"))
        .await;
    ack.await.unwrap();
    server.unregister("test", true).await;

    // The body completes because the subscription queue was closed.
    let body = tokio::time::timeout(WAIT, response.bytes())
        .await
        .expect("connection did not terminate")
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("data: hello\n"));
    server.close().await;
}

#[tokio::test]
async fn closed_server_returns_empty_response_without_subscribing() {
    let server = Server::new();
    let url = spawn_channel(&server, "test").await;
    server.close().await;

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream; charset=utf-8"
    );
    let body = tokio::time::timeout(WAIT, response.bytes()).await.unwrap().unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn cors_and_cache_headers_are_set() {
    let server = Server::with_config(ServerConfig {
        allow_cors: true,
        ..ServerConfig::default()
    });
    let url = spawn_channel(&server, "test").await;

    let response = reqwest::get(&url).await.unwrap();
    let headers = response.headers();
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(
        headers.get("cache-control").unwrap(),
        "no-cache, no-store, must-revalidate"
    );
    server.close().await;
}

#[tokio::test]
async fn gzip_is_negotiated_and_decodable() {
    let server = Server::with_config(ServerConfig {
        gzip: true,
        ..ServerConfig::default()
    });
    let url = spawn_channel(&server, "test").await;

    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .header("accept-encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");

    let ack = server
        .publish_with_acknowledgment(&["test"], Event::new("hello").with_id("1"))
        .await;
    ack.await.unwrap();
    server.close().await;

    let raw = response.bytes().await.unwrap();
    // The stream is flushed per record but never finished, so decode what is
    // there rather than expecting a gzip trailer.
    let mut decoder = flate2::read::GzDecoder::new(raw.as_ref());
    let mut decoded = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => decoded.extend_from_slice(&chunk[..n]),
        }
    }
    let text = String::from_utf8(decoded).unwrap();
    assert_eq!(text, "id: 1\ndata: hello\n\n");
}

#[tokio::test]
async fn plain_subscriber_is_not_gzipped() {
    let server = Server::with_config(ServerConfig {
        gzip: true,
        ..ServerConfig::default()
    });
    let url = spawn_channel(&server, "test").await;

    // No Accept-Encoding: the response must stay uncompressed.
    let subscriber = connect(&url).await;
    server.publish(&["test"], Event::new("clear")).await;
    assert_eq!(expect_event(&subscriber.events(), WAIT).await.data(), "clear");
    subscriber.close();
    server.close().await;
}

#[derive(serde::Serialize)]
struct NewsArticle {
    title: String,
    content: String,
}

#[tokio::test]
async fn structured_payloads_round_trip_as_json() {
    let server = Server::new();
    let url = spawn_channel(&server, "articles").await;
    let subscriber = connect(&url).await;

    let article = NewsArticle {
        title: "Tomorrow is another day".into(),
        content: "And so is the day after.".into(),
    };
    let payload = serde_json::to_string(&article).unwrap();
    server
        .publish(
            &["articles"],
            Event::new(payload).with_id("1").with_name("News Article"),
        )
        .await;

    let event = expect_event(&subscriber.events(), WAIT).await;
    assert_eq!(event.name(), "News Article");
    let decoded: serde_json::Value = serde_json::from_str(event.data()).unwrap();
    assert_eq!(decoded["title"], "Tomorrow is another day");
    subscriber.close();
    server.close().await;
}

#[tokio::test]
async fn jittered_delivery_is_delayed() {
    let server = Server::with_jitter(Duration::from_millis(200));
    let url = spawn_channel(&server, "test").await;
    let subscriber = connect(&url).await;

    let start = Instant::now();
    server.publish(&["test"], Event::new("delayed")).await;
    let event = expect_event(&subscriber.events(), WAIT).await;
    let elapsed = start.elapsed();

    assert_eq!(event.data(), "delayed");
    assert!(
        elapsed >= Duration::from_millis(100),
        "delivered after {elapsed:?}, expected at least half the jitter window"
    );
    subscriber.close();
    server.close().await;
}

#[tokio::test]
async fn jittered_events_coalesce_to_the_latest() {
    let server = Server::with_jitter(Duration::from_millis(150));
    let url = spawn_channel(&server, "test").await;
    let subscriber = connect(&url).await;
    let events = subscriber.events();

    server.publish(&["test"], Event::new("event-1")).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    server.publish(&["test"], Event::new("event-2")).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    server.publish(&["test"], Event::new("event-3")).await;

    // Only the latest of the burst survives the jitter window.
    assert_eq!(expect_event(&events, WAIT).await.data(), "event-3");
    let extra = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(extra.is_err(), "burst should have coalesced to one event");

    // The next cycle delivers normally.
    server.publish(&["test"], Event::new("event-4")).await;
    assert_eq!(expect_event(&events, WAIT).await.data(), "event-4");
    subscriber.close();
    server.close().await;
}

#[tokio::test]
async fn zero_jitter_behaves_like_a_normal_server() {
    let server = Server::with_jitter(Duration::ZERO);
    let url = spawn_channel(&server, "test").await;
    let subscriber = connect(&url).await;

    let start = Instant::now();
    server.publish(&["test"], Event::new("immediate")).await;
    let event = expect_event(&subscriber.events(), WAIT).await;

    assert_eq!(event.data(), "immediate");
    assert!(start.elapsed() < Duration::from_millis(100));
    subscriber.close();
    server.close().await;
}
