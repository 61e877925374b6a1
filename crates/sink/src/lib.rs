//! SSELine Sink
//!
//! The producing half of the transport: an [`EventSink`] accepts events,
//! serializes them with the shared wire codec and exposes the result as the
//! body of a `text/event-stream` response.
//!
//! # Features
//!
//! - **Ordered frames**: events are written in the order they were sent
//! - **Keep-alive**: a `:keep-alive` comment frame every 3 seconds by default
//! - **Close notification**: observers learn when either side ends the stream
//! - **Cancellation-aware**: dropping the response body closes the sink
//!
//! # Example
//!
//! ```rust,no_run
//! use axum::{Router, response::IntoResponse, routing::get};
//! use sseline_sink::EventSink;
//! use sseline_types::Event;
//!
//! async fn events() -> impl IntoResponse {
//!     let sink = EventSink::new();
//!     let response = sink.response().expect("fresh sink");
//!
//!     let producer = sink.clone();
//!     tokio::spawn(async move {
//!         producer
//!             .send_message(Event::message("hello").with_event("greeting"))
//!             .ok();
//!         producer.close();
//!     });
//!
//!     response
//! }
//!
//! let app: Router = Router::new().route("/events", get(events));
//! ```

pub mod config;
pub mod error;
pub mod response;
pub mod sink;

// Re-export commonly used items
pub use config::{DEFAULT_KEEP_ALIVE_INTERVAL, KEEP_ALIVE_COMMENT, SinkConfig};
pub use error::{Result, SinkError};
pub use response::{EventBody, SinkResponse, sse_headers};
pub use sink::{CloseReason, EventSink};
