//! SSELine Source
//!
//! The consuming half of the transport: issue a request, validate the
//! handshake and decode the `text/event-stream` body into events.
//!
//! # Overview
//!
//! Two flavours share the same handshake rules and decoder:
//!
//! - [`EventSource`] - one connection, consumed by pulling with `next()`;
//!   any failure is terminal
//! - [`ReconnectingEventSource`] - broadcasts [`SourceEvent`]s to subscribers
//!   and reconnects after network failures, replaying `Last-Event-Id`
//!
//! The transport is injectable through the [`Fetch`] trait. [`ReqwestFetch`]
//! is the default; any `Fn(Request<()>) -> impl Future<Output = Result<FetchResponse>>`
//! closure works too.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use sseline_source::{EventSource, SourceOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = SourceOptions::new().with_keep_alive_timeout(Duration::from_secs(10));
//!     let source = EventSource::new("http://127.0.0.1:8080/events", options)?;
//!
//!     while let Some(event) = source.next().await? {
//!         println!("{}: {}", event.event_type(), event.data.unwrap_or_default());
//!     }
//!     Ok(())
//! }
//! ```

mod connection;
pub mod error;
pub mod fetch;
pub mod reconnecting;
pub mod source;
pub mod types;

// Re-export commonly used items
pub use error::{Result, SourceError};
pub use fetch::{ByteStream, Fetch, FetchResponse, ReqwestFetch};
pub use reconnecting::ReconnectingEventSource;
pub use source::EventSource;
pub use types::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_RECONNECTION_TIME, IntoRequestTarget, MessageEvent,
    ReadyState, ReconnectOptions, RequestTarget, SourceEvent, SourceOptions,
};
