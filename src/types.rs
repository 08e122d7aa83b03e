//! Core data types shared by the client and the server.

/// A single Server-Sent Event.
///
/// Events are immutable after construction. The `id` and `name` fields are
/// optional (empty string means absent); the payload may span multiple lines.
///
/// Events decoded from the wire additionally carry the *last event id* that
/// was in effect when the event was produced — which may differ from the
/// event's own id, since ids persist across events that do not set one — and
/// an optional `retry:` hint in milliseconds.
///
/// # Examples
///
/// ```
/// use eventsource_rs::Event;
///
/// let event = Event::new("This is a test").with_id("1").with_name("Add");
/// assert_eq!(event.id(), "1");
/// assert_eq!(event.name(), "Add");
/// assert_eq!(event.data(), "This is a test");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    id: String,
    name: String,
    data: String,
    last_event_id: String,
    retry: Option<u64>,
}

impl Event {
    /// Create an event with the given payload and no id or name.
    pub fn new(data: impl Into<String>) -> Self {
        Event {
            data: data.into(),
            ..Event::default()
        }
    }

    /// Set the event id. Clients echo the most recent id back to the server
    /// in the `Last-Event-ID` header when reconnecting.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the event name (the `event:` field).
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Identifier of this event, or an empty string if it has none.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of this event, or an empty string if it has none.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload of this event. May contain newlines.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// The last event id that was current when this event was decoded.
    ///
    /// Equals [`id()`](Event::id) when the event carried its own id;
    /// otherwise the id inherited from an earlier event (or the decoder's
    /// configured seed). Always empty on events that were not produced by a
    /// decoder.
    pub fn last_event_id(&self) -> &str {
        &self.last_event_id
    }

    /// Reconnection delay advised by the server via the `retry:` field, in
    /// milliseconds. Only present on decoded events.
    pub fn retry(&self) -> Option<u64> {
        self.retry
    }

    pub(crate) fn from_wire(
        id: String,
        name: String,
        data: String,
        last_event_id: String,
        retry: Option<u64>,
    ) -> Self {
        Event {
            id,
            name,
            data,
            last_event_id,
            retry,
        }
    }
}

/// A comment line, serialized as `:<value>` on the wire.
///
/// Comments carry no data; servers publish them as keep-alives so that idle
/// connections produce read activity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Comment {
    value: String,
}

impl Comment {
    /// Create a comment with the given text.
    pub fn new(value: impl Into<String>) -> Self {
        Comment {
            value: value.into(),
        }
    }

    /// The comment text, without the leading colon.
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Either an event or a comment — the unit carried on subscriber queues and
/// accepted by the wire encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOrComment {
    Event(Event),
    Comment(Comment),
}

impl From<Event> for EventOrComment {
    fn from(event: Event) -> Self {
        EventOrComment::Event(event)
    }
}

impl From<Comment> for EventOrComment {
    fn from(comment: Comment) -> Self {
        EventOrComment::Comment(comment)
    }
}
