use sseline_types::CodecError;
use thiserror::Error;

/// Errors raised by an [`EventSink`](crate::EventSink)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink was closed, by the producer or by the consumer dropping the body
    #[error("Sink is already closed")]
    Closed,

    /// The consumer is too far behind; the event was not queued
    #[error("Consumer is {0} frames behind, refusing to queue more")]
    Backlogged(usize),

    /// The event has no field set and would encode to an empty frame
    #[error("Refusing to send an event with no fields set")]
    EmptyEvent,

    /// The response body was already handed out
    #[error("The event stream was already taken")]
    StreamTaken,

    /// The event cannot be written as a single frame
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Result type alias for sink operations
pub type Result<T> = std::result::Result<T, SinkError>;
