//! History replay for late subscribers.

use crate::types::Event;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// A source of historical events, used with
/// [`Server::register`](crate::Server::register) to let subscribers catch up
/// on events published before they attached.
pub trait Repository: Send + Sync {
    /// Produce the events that should follow on from the given channel and
    /// event id, in order. The stream must be finite.
    ///
    /// Called from multiple tasks concurrently; implementations must be safe
    /// for shared access.
    fn replay(&self, channel: &str, last_event_id: &str) -> BoxStream<'static, Event>;
}

/// An in-memory [`Repository`] that keeps every added event, ordered by id.
///
/// Replaying starts at the first event whose id is not smaller than the
/// requested id (ids compare lexicographically); an empty id replays
/// everything.
#[derive(Default)]
pub struct SliceRepository {
    events: RwLock<HashMap<String, Vec<Event>>>,
}

impl SliceRepository {
    pub fn new() -> Self {
        SliceRepository::default()
    }

    /// Record an event on a channel, keeping the channel's history sorted by
    /// event id.
    pub fn add(&self, channel: &str, event: Event) {
        let mut channels = self
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let events = channels.entry(channel.to_string()).or_default();
        let at = events.partition_point(|existing| existing.id() < event.id());
        events.insert(at, event);
    }
}

impl Repository for SliceRepository {
    fn replay(&self, channel: &str, last_event_id: &str) -> BoxStream<'static, Event> {
        let channels = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let replayed: Vec<Event> = channels
            .get(channel)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.id() >= last_event_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        futures::stream::iter(replayed).boxed()
    }
}
