//! Encoder for the SSE wire format, with optional gzip compression.

use crate::error::Result;
use crate::types::{Comment, Event, EventOrComment};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

enum Sink<W: Write> {
    Plain(W),
    // Flushed after every record so subscribers receive timely frames.
    Gzip(GzEncoder<W>),
}

impl<W: Write> Write for Sink<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

/// Writes events and comments to a stream in the format specified by the
/// server-sent events protocol.
///
/// Works against any [`io::Write`](std::io::Write). When `compressed` is
/// set the output is wrapped in a streaming gzip encoder and flushed after
/// each record.
pub struct Encoder<W: Write> {
    sink: Sink<W>,
    compressed: bool,
}

impl<W: Write> Encoder<W> {
    /// Create an encoder for the given writer, optionally gzip-compressing
    /// its output.
    pub fn new(writer: W, compressed: bool) -> Self {
        let sink = if compressed {
            Sink::Gzip(GzEncoder::new(writer, Compression::default()))
        } else {
            Sink::Plain(writer)
        };
        Encoder { sink, compressed }
    }

    /// Write one event or comment, including the terminating blank line.
    pub fn encode(&mut self, item: &EventOrComment) -> Result<()> {
        match item {
            EventOrComment::Event(event) => self.write_event(event)?,
            EventOrComment::Comment(comment) => self.write_comment(comment)?,
        }
        if self.compressed {
            self.sink.flush()?;
        }
        Ok(())
    }

    fn write_event(&mut self, event: &Event) -> std::io::Result<()> {
        for (prefix, value) in [("id: ", event.id()), ("event: ", event.name())] {
            if value.is_empty() {
                continue;
            }
            for segment in value.split('\n') {
                self.sink.write_all(prefix.as_bytes())?;
                self.sink.write_all(segment.as_bytes())?;
                self.sink.write_all(b"\n")?;
            }
        }
        // A record always has a data field, even with an empty payload. A
        // trailing newline in the payload yields a final empty segment.
        for segment in event.data().split('\n') {
            self.sink.write_all(b"data: ")?;
            self.sink.write_all(segment.as_bytes())?;
            self.sink.write_all(b"\n")?;
        }
        self.sink.write_all(b"\n")
    }

    fn write_comment(&mut self, comment: &Comment) -> std::io::Result<()> {
        self.sink.write_all(b":")?;
        self.sink.write_all(comment.value().as_bytes())?;
        self.sink.write_all(b"\n")
    }
}
