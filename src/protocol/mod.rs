//! Wire codec for the SSE text framing.
//!
//! ```text
//! event-stream = *(record / blank)
//! record       = 1*field blank
//! field        = name [":" [SP] value] LF
//! name         = "id" | "event" | "data" | "retry"
//! comment      = ":" value LF
//! blank        = LF
//! ```

mod decoder;
mod encoder;

pub use decoder::{Decoder, EventParser};
pub use encoder::Encoder;
