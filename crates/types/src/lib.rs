//! SSELine wire vocabulary
//!
//! Shared types for the Server-Sent Events transport. This crate holds no
//! runtime state: it maps one [`Event`] to one SSE frame and back.
//!
//! - [`Event`] - the unit exchanged between a sink and a source
//! - [`encode`] - serialize one event into one frame
//! - [`LineSplitter`] - split raw byte chunks into lines (CRLF, CR or LF)
//! - [`FrameDecoder`] - fold lines into events, tracking the last event id
//! - [`EventDecoder`] - both stages together, fed with byte chunks
//!
//! # Wire format
//!
//! ```text
//! :keep-alive
//! event:hello
//! data:first line
//! data:second line
//! id:1
//! retry:2000
//!
//! ```
//!
//! Fields are written in that order, each on its own line, and a blank line
//! terminates the frame.

pub mod decode;
pub mod encode;
pub mod event;

pub use decode::{DecodedLine, EventDecoder, FrameDecoder, LineSplitter};
pub use encode::{encode, encode_comment};
pub use event::{CodecError, DEFAULT_EVENT_TYPE, Event};
