//! Multi-channel SSE server.
//!
//! A [`Server`] manages any number of event-publishing channels and fans
//! published events out to every HTTP subscriber of those channels. All
//! subscriber and repository state is owned by a single task — publishers
//! and handlers only ever talk to it through its intake queues, so there is
//! no shared mutable state to lock.
//!
//! # Usage
//!
//! ```ignore
//! use eventsource_rs::{Event, Server};
//!
//! let server = Server::new();
//! let app = axum::Router::new().route("/articles", server.handler("articles"));
//! // ... serve `app` ...
//! server.publish(&["articles"], Event::new("hello").with_id("1")).await;
//! ```

mod handler;
mod repository;

pub use repository::{Repository, SliceRepository};

use crate::client::Jitter;
use crate::types::{Comment, Event, EventOrComment};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Default bound on a subscriber's outbound queue.
pub const DEFAULT_BUFFER_SIZE: usize = 128;

/// Configuration for a [`Server`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Make every handler accessible from any origin.
    pub allow_cors: bool,
    /// Replay the registered repository to new subscribers even if they did
    /// not send a `Last-Event-ID`.
    pub replay_all: bool,
    /// How many outbound items a subscriber may fall behind before it is
    /// disconnected.
    pub buffer_size: usize,
    /// Compress responses for subscribers that accept gzip.
    pub gzip: bool,
    /// Close subscriber connections after this long, if set.
    pub max_conn_time: Option<Duration>,
    /// Delay each delivery by a random amount up to this window, per
    /// subscriber, coalescing events that arrive while one is in flight.
    /// Smooths bursty fan-out.
    pub jitter: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            allow_cors: false,
            replay_all: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            gzip: false,
            max_conn_time: None,
            jitter: None,
        }
    }
}

/// Per-subscriber state held by the owner. The owner is the only writer of
/// `out`; the HTTP handler holding the receiving end is its only reader.
struct Subscription {
    id: u64,
    channel: String,
    last_event_id: String,
    out: async_channel::Sender<EventOrComment>,
}

#[derive(Clone, Debug)]
pub(crate) struct SubscriptionKey {
    channel: String,
    id: u64,
}

struct Registration {
    channel: String,
    repository: Arc<dyn Repository>,
}

struct Unregistration {
    channel: String,
    force_disconnect: bool,
}

struct Outbound {
    channels: Vec<String>,
    item: EventOrComment,
    ack: Option<oneshot::Sender<()>>,
}

struct ServerInner {
    config: ServerConfig,
    registrations: async_channel::Sender<Registration>,
    unregistrations: async_channel::Sender<Unregistration>,
    publications: async_channel::Sender<Outbound>,
    subscriptions: async_channel::Sender<Subscription>,
    unsubscriptions: async_channel::Sender<SubscriptionKey>,
    quit: async_channel::Sender<()>,
    closed: AtomicBool,
    next_subscription_id: AtomicU64,
}

/// A multi-channel SSE publisher.
///
/// Cheap to clone; all clones share the same owner task. To serve a channel
/// over HTTP, mount [`handler`](Server::handler) on an axum router. Channels
/// do not have to be registered: registration only matters when a
/// [`Repository`] should replay history to late subscribers.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server with default configuration. Must be called within a
    /// tokio runtime: the owner task is spawned immediately.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create a server that delays each delivery by a random amount up to
    /// `window` per subscriber, coalescing bursts.
    pub fn with_jitter(window: Duration) -> Self {
        Self::with_config(ServerConfig {
            jitter: Some(window),
            ..ServerConfig::default()
        })
    }

    /// Create a server with the given configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        let (registrations_tx, registrations_rx) = async_channel::bounded(1);
        let (unregistrations_tx, unregistrations_rx) = async_channel::bounded(1);
        let (publications_tx, publications_rx) = async_channel::bounded(1);
        let (subscriptions_tx, subscriptions_rx) = async_channel::bounded(1);
        // Unbounded so eviction bookkeeping and handler drop-guards never block.
        let (unsubscriptions_tx, unsubscriptions_rx) = async_channel::unbounded();
        let (quit_tx, quit_rx) = async_channel::bounded(1);
        let (flush_tx, flush_rx) = async_channel::unbounded();

        let owner = Owner {
            replay_all: config.replay_all,
            jitter: config.jitter.filter(|window| !window.is_zero()),
            registrations: registrations_rx,
            unregistrations: unregistrations_rx,
            publications: publications_rx,
            subscriptions: subscriptions_rx,
            unsubscriptions: unsubscriptions_rx,
            quit: quit_rx,
            flush_tx,
            flush_rx,
            subs: HashMap::new(),
            repos: HashMap::new(),
            pending: HashMap::new(),
        };
        tokio::spawn(owner.run());

        Server {
            inner: Arc::new(ServerInner {
                config,
                registrations: registrations_tx,
                unregistrations: unregistrations_tx,
                publications: publications_tx,
                subscriptions: subscriptions_tx,
                unsubscriptions: unsubscriptions_tx,
                quit: quit_tx,
                closed: AtomicBool::new(false),
                next_subscription_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a repository for a channel. New subscribers to the channel
    /// may then receive replayed history, depending on
    /// [`replay_all`](ServerConfig::replay_all) and their `Last-Event-ID`.
    pub async fn register(&self, channel: &str, repository: Arc<dyn Repository>) {
        let _ = self
            .inner
            .registrations
            .send(Registration {
                channel: channel.to_string(),
                repository,
            })
            .await;
    }

    /// Remove a channel registration. With `force_disconnect`, every active
    /// subscriber of the channel is disconnected; otherwise existing
    /// connections stay open but receive no further events.
    pub async fn unregister(&self, channel: &str, force_disconnect: bool) {
        let _ = self
            .inner
            .unregistrations
            .send(Unregistration {
                channel: channel.to_string(),
                force_disconnect,
            })
            .await;
    }

    /// Publish an event to one or more channels.
    pub async fn publish(&self, channels: &[&str], event: Event) {
        self.publish_item(channels, event.into(), None).await;
    }

    /// Publish a comment to one or more channels.
    pub async fn publish_comment(&self, channels: &[&str], text: impl Into<String>) {
        self.publish_item(channels, Comment::new(text).into(), None)
            .await;
    }

    /// Publish an event and receive a signal once the owner has finished
    /// dispatching it — every current subscriber has either received the
    /// event or been evicted.
    ///
    /// Awaiting the returned receiver before e.g. [`close`](Server::close)
    /// gives a happens-before ordering between the publication and the
    /// later operation.
    pub async fn publish_with_acknowledgment(
        &self,
        channels: &[&str],
        event: Event,
    ) -> oneshot::Receiver<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.publish_item(channels, event.into(), Some(ack_tx)).await;
        ack_rx
    }

    async fn publish_item(
        &self,
        channels: &[&str],
        item: EventOrComment,
        ack: Option<oneshot::Sender<()>>,
    ) {
        let _ = self
            .inner
            .publications
            .send(Outbound {
                channels: channels.iter().map(|channel| channel.to_string()).collect(),
                item,
                ack,
            })
            .await;
    }

    /// Shut the server down permanently. Every subscriber queue is closed
    /// and new subscription attempts are refused. Idempotent.
    pub async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let _ = self.inner.quit.send(()).await;
        }
    }

    /// An axum handler serving the given channel as an SSE endpoint.
    pub fn handler(&self, channel: impl Into<String>) -> axum::routing::MethodRouter {
        handler::channel_handler(self.clone(), channel.into())
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Create a subscription and hand it to the owner. Returns the queue's
    /// receiving end and what the handler needs to unsubscribe later, or
    /// `None` if the owner is gone.
    pub(crate) async fn attach(
        &self,
        channel: String,
        last_event_id: String,
    ) -> Option<(
        async_channel::Receiver<EventOrComment>,
        SubscriptionKey,
        async_channel::Sender<SubscriptionKey>,
    )> {
        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (out_tx, out_rx) = async_channel::bounded(self.inner.config.buffer_size.max(1));
        let subscription = Subscription {
            id,
            channel: channel.clone(),
            last_event_id,
            out: out_tx,
        };
        self.inner.subscriptions.send(subscription).await.ok()?;
        Some((
            out_rx,
            SubscriptionKey { channel, id },
            self.inner.unsubscriptions.clone(),
        ))
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// An event held back by the jitter window, waiting for its flush timer.
struct PendingDelivery {
    channel: String,
    item: EventOrComment,
}

/// The owner task: the sole mutator of the subscriber and repository maps.
struct Owner {
    replay_all: bool,
    jitter: Option<Duration>,
    registrations: async_channel::Receiver<Registration>,
    unregistrations: async_channel::Receiver<Unregistration>,
    publications: async_channel::Receiver<Outbound>,
    subscriptions: async_channel::Receiver<Subscription>,
    unsubscriptions: async_channel::Receiver<SubscriptionKey>,
    quit: async_channel::Receiver<()>,
    flush_tx: async_channel::Sender<SubscriptionKey>,
    flush_rx: async_channel::Receiver<SubscriptionKey>,
    subs: HashMap<String, HashMap<u64, Subscription>>,
    repos: HashMap<String, Arc<dyn Repository>>,
    pending: HashMap<u64, PendingDelivery>,
}

impl Owner {
    async fn run(mut self) {
        loop {
            tokio::select! {
                registration = self.registrations.recv() => match registration {
                    Ok(registration) => {
                        self.repos.insert(registration.channel, registration.repository);
                    }
                    Err(_) => break,
                },
                unregistration = self.unregistrations.recv() => match unregistration {
                    Ok(unregistration) => self.handle_unregister(unregistration),
                    Err(_) => break,
                },
                subscription = self.subscriptions.recv() => match subscription {
                    Ok(subscription) => self.handle_subscribe(subscription),
                    Err(_) => break,
                },
                key = self.unsubscriptions.recv() => match key {
                    Ok(key) => self.handle_unsubscribe(key),
                    Err(_) => break,
                },
                outbound = self.publications.recv() => match outbound {
                    Ok(outbound) => self.handle_publish(outbound),
                    Err(_) => break,
                },
                key = self.flush_rx.recv() => {
                    if let Ok(key) = key {
                        self.flush_pending(key);
                    }
                },
                _ = self.quit.recv() => break,
            }
        }
        self.shutdown();
    }

    fn handle_publish(&mut self, outbound: Outbound) {
        let Outbound {
            channels,
            item,
            ack,
        } = outbound;
        for channel in channels {
            let Some(channel_subs) = self.subs.get(&channel) else {
                continue;
            };
            let targets: Vec<u64> = channel_subs.keys().copied().collect();
            for id in targets {
                match self.jitter {
                    Some(window) => self.delay_delivery(window, &channel, id, item.clone()),
                    None => self.deliver_now(&channel, id, item.clone()),
                }
            }
        }
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    /// Hold the item in the subscriber's single in-flight slot. A later item
    /// arriving inside the window replaces the one in flight; the flush
    /// timer is only started when the slot was empty.
    fn delay_delivery(&mut self, window: Duration, channel: &str, id: u64, item: EventOrComment) {
        let replaced = self.pending.insert(
            id,
            PendingDelivery {
                channel: channel.to_string(),
                item,
            },
        );
        if replaced.is_none() {
            let delay = Jitter::new(Jitter::DEFAULT_RATIO).apply(window);
            let flush_tx = self.flush_tx.clone();
            let key = SubscriptionKey {
                channel: channel.to_string(),
                id,
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = flush_tx.send(key).await;
            });
        }
    }

    fn flush_pending(&mut self, key: SubscriptionKey) {
        if let Some(pending) = self.pending.remove(&key.id) {
            self.deliver_now(&pending.channel, key.id, pending.item);
        }
    }

    /// Non-blocking enqueue; a subscriber whose queue is full is evicted so
    /// it cannot stall the fan-out or hold unbounded memory.
    fn deliver_now(&mut self, channel: &str, id: u64, item: EventOrComment) {
        let evict = {
            let Some(subscription) = self.subs.get(channel).and_then(|subs| subs.get(&id))
            else {
                return;
            };
            match subscription.out.try_send(item) {
                Ok(()) => false,
                Err(async_channel::TrySendError::Full(_)) => {
                    tracing::warn!(channel, subscriber = id, "subscriber fell behind, disconnecting");
                    subscription.out.close();
                    true
                }
                Err(async_channel::TrySendError::Closed(_)) => true,
            }
        };
        if evict {
            self.remove_subscription(channel, id);
        }
    }

    fn handle_subscribe(&mut self, subscription: Subscription) {
        let channel = subscription.channel.clone();
        let id = subscription.id;
        let last_event_id = subscription.last_event_id.clone();
        let out = subscription.out.clone();
        self.subs
            .entry(channel.clone())
            .or_default()
            .insert(id, subscription);

        if self.replay_all || !last_event_id.is_empty() {
            // A replay must never interleave with an unflushed jittered item.
            self.flush_pending(SubscriptionKey {
                channel: channel.clone(),
                id,
            });
            if let Some(repository) = self.repos.get(&channel) {
                let mut history = repository.replay(&channel, &last_event_id);
                tokio::spawn(async move {
                    use futures::StreamExt;
                    while let Some(event) = history.next().await {
                        // The subscriber may have been evicted mid-replay.
                        if out.send(EventOrComment::Event(event)).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
    }

    fn handle_unsubscribe(&mut self, key: SubscriptionKey) {
        self.remove_subscription(&key.channel, key.id);
    }

    fn handle_unregister(&mut self, unregistration: Unregistration) {
        self.repos.remove(&unregistration.channel);
        if let Some(removed) = self.subs.remove(&unregistration.channel) {
            for (id, subscription) in removed {
                self.pending.remove(&id);
                if unregistration.force_disconnect {
                    subscription.out.close();
                }
            }
        }
    }

    fn remove_subscription(&mut self, channel: &str, id: u64) {
        self.pending.remove(&id);
        if let Some(channel_subs) = self.subs.get_mut(channel) {
            channel_subs.remove(&id);
        }
    }

    fn shutdown(&mut self) {
        // Flush in-flight jittered items before the queues close.
        let pending: Vec<(u64, PendingDelivery)> = self.pending.drain().collect();
        for (id, delivery) in pending {
            self.deliver_now(&delivery.channel, id, delivery.item);
        }
        for channel_subs in self.subs.values() {
            for subscription in channel_subs.values() {
                subscription.out.close();
            }
        }
        self.subs.clear();
    }
}
