//! Sink configuration.

use std::time::Duration;

/// Interval between heartbeat comments.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(3000);

/// Comment text carried by heartbeat frames.
pub const KEEP_ALIVE_COMMENT: &str = "keep-alive";

/// Configuration for an [`EventSink`](crate::EventSink)
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Delay between heartbeat comments, `None` disables them
    pub keep_alive_interval: Option<Duration>,

    /// Frames the consumer may lag behind before sends are refused.
    /// `None` queues without limit, so a stalled consumer grows memory.
    pub max_buffered_frames: Option<usize>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Some(DEFAULT_KEEP_ALIVE_INTERVAL),
            max_buffered_frames: None,
        }
    }
}

impl SinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat interval
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Refuse sends with [`SinkError::Backlogged`](crate::SinkError::Backlogged)
    /// once this many frames wait for the consumer
    pub fn with_max_buffered_frames(mut self, max: usize) -> Self {
        self.max_buffered_frames = Some(max);
        self
    }

    /// Never send heartbeats
    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive_interval = None;
        self
    }
}
