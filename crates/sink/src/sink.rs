//! The producing end of an event stream.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use sseline_types::Event;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    config::{KEEP_ALIVE_COMMENT, SinkConfig},
    error::{Result, SinkError},
    response::{EventBody, SinkResponse},
};

type CloseCallback = Box<dyn FnOnce(CloseReason) + Send>;

/// Why a sink stopped accepting events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The producer called [`EventSink::close`]
    Closed,
    /// The consumer dropped the response body
    Cancelled,
    /// Every sink handle was dropped without an explicit close
    Dropped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Closed => write!(f, "closed"),
            CloseReason::Cancelled => write!(f, "cancelled"),
            CloseReason::Dropped => write!(f, "dropped"),
        }
    }
}

/// Event sink - the producer side of one `text/event-stream` response.
///
/// Owns exactly one outbound stream. Handles are cheap to clone and all
/// refer to the same stream. The sink must be created inside a Tokio
/// runtime because it spawns its keep-alive task.
///
/// Frames queue without limit by default, so a consumer that stops reading
/// lets memory grow. Set [`SinkConfig::with_max_buffered_frames`] to refuse
/// sends past a backlog instead.
///
/// # Example
///
/// ```ignore
/// let sink = EventSink::new();
/// let response = sink.response()?;
///
/// sink.send_message(Event::message("X").with_event("hello").with_id("1"))?;
/// sink.close();
/// ```
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

pub(crate) struct SinkInner {
    /// Single mutation point of the stream; `None` once closed
    tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,

    /// Receiving half, handed out once as the response body
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,

    /// Frames queued but not yet taken by the body
    queued: Arc<AtomicUsize>,

    /// Backlog at which sends are refused, unbounded when `None`
    max_buffered: Option<usize>,

    /// Cancelled exactly once, when the sink closes
    closed: CancellationToken,

    /// Observers run once on close
    on_close: Mutex<Vec<CloseCallback>>,
}

impl EventSink {
    /// Create a sink with the default 3 second keep-alive
    pub fn new() -> Self {
        Self::with_config(SinkConfig::default())
    }

    /// Create a sink with the given configuration
    pub fn with_config(config: SinkConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SinkInner {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            queued: Arc::new(AtomicUsize::new(0)),
            max_buffered: config.max_buffered_frames,
            closed: CancellationToken::new(),
            on_close: Mutex::new(Vec::new()),
        });

        if let Some(interval) = config.keep_alive_interval {
            tokio::spawn(keep_alive_loop(
                Arc::downgrade(&inner),
                inner.closed.clone(),
                interval,
            ));
        }

        Self { inner }
    }

    /// Enqueue one event.
    ///
    /// # Errors
    ///
    /// - [`SinkError::Closed`] once the sink is closed
    /// - [`SinkError::Backlogged`] when a backlog limit is configured and the
    ///   consumer has fallen that far behind
    /// - [`SinkError::EmptyEvent`] when no field is set
    /// - [`SinkError::Codec`] when a single-line field contains a line break
    pub fn send_message(&self, event: Event) -> Result<()> {
        if event.is_empty() {
            return Err(SinkError::EmptyEvent);
        }
        event.validate()?;
        self.inner.enqueue(event)
    }

    /// Close the stream.
    ///
    /// Idempotent: the keep-alive task is stopped, frames already queued are
    /// still delivered, then the body ends. Close observers run on the first
    /// call only.
    pub fn close(&self) {
        self.inner.shutdown(CloseReason::Closed);
    }

    /// Whether the sink is closed, from either side
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the sink is closed, from either side
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.closed.clone().cancelled_owned()
    }

    /// Register an observer run once when the sink closes.
    ///
    /// Registering on a closed sink runs the observer immediately with
    /// [`CloseReason::Closed`].
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce(CloseReason) + Send + 'static,
    {
        let mut callbacks = self.inner.on_close.lock();
        if self.inner.closed.is_cancelled() {
            drop(callbacks);
            callback(CloseReason::Closed);
            return;
        }
        callbacks.push(Box::new(callback));
    }

    /// Take the response carrying the encoded stream.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::StreamTaken`] if called more than once.
    pub fn response(&self) -> Result<SinkResponse> {
        let rx = self.inner.rx.lock().take().ok_or(SinkError::StreamTaken)?;
        let body = EventBody::new(
            rx,
            Arc::clone(&self.inner.queued),
            Arc::downgrade(&self.inner),
        );
        Ok(SinkResponse::new(body))
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SinkInner {
    fn enqueue(&self, event: Event) -> Result<()> {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(SinkError::Closed)?;

        let queued = self.queued.load(Ordering::Acquire);
        if let Some(max) = self.max_buffered
            && queued >= max
        {
            return Err(SinkError::Backlogged(queued));
        }
        // Counted before the send so the body never sees the frame uncounted
        self.queued.fetch_add(1, Ordering::AcqRel);
        tx.send(event).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            SinkError::Closed
        })
    }

    /// The one cleanup path, shared by explicit close, body cancellation and drop
    pub(crate) fn shutdown(&self, reason: CloseReason) {
        let Some(tx) = self.tx.lock().take() else {
            return;
        };
        drop(tx);
        self.closed.cancel();
        debug!(reason = %reason, "Event sink closed");

        let callbacks = std::mem::take(&mut *self.on_close.lock());
        for callback in callbacks {
            callback(reason);
        }
    }
}

impl Drop for SinkInner {
    fn drop(&mut self) {
        self.shutdown(CloseReason::Dropped);
    }
}

/// Heartbeat task.
///
/// Sleeps a full interval after each heartbeat rather than ticking at a
/// fixed rate, and checks the sink is still open before every send.
async fn keep_alive_loop(sink: Weak<SinkInner>, closed: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(inner) = sink.upgrade() else {
            break;
        };
        match inner.enqueue(Event::comment(KEEP_ALIVE_COMMENT)) {
            Ok(()) => trace!("Keep-alive comment sent"),
            // The consumer has frames to read; a heartbeat adds nothing
            Err(SinkError::Backlogged(_)) => {}
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::*;

    async fn collect_body(body: EventBody) -> String {
        let chunks: Vec<_> = body.collect().await;
        let bytes: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        String::from_utf8(bytes).unwrap()
    }

    fn quiet_sink() -> EventSink {
        EventSink::with_config(SinkConfig::new().without_keep_alive())
    }

    #[tokio::test]
    async fn test_send_and_close() {
        let sink = quiet_sink();
        let (_, body) = sink.response().unwrap().into_parts();

        sink.send_message(
            Event::message("X")
                .with_event("hello")
                .with_id("1")
                .with_retry(2),
        )
        .unwrap();
        sink.send_message(Event::message("Y").with_event("hello2").with_id("2"))
            .unwrap();
        sink.close();

        assert_eq!(
            collect_body(body).await,
            "event:hello\ndata:X\nid:1\nretry:2\n\nevent:hello2\ndata:Y\nid:2\n\n"
        );
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let sink = quiet_sink();
        sink.close();
        assert_eq!(
            sink.send_message(Event::message("late")),
            Err(SinkError::Closed)
        );
    }

    #[tokio::test]
    async fn test_rejects_empty_and_invalid_events() {
        let sink = quiet_sink();
        assert_eq!(sink.send_message(Event::new()), Err(SinkError::EmptyEvent));
        assert!(matches!(
            sink.send_message(Event::message("x").with_event("a\nb")),
            Err(SinkError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_response_taken_once() {
        let sink = quiet_sink();
        assert!(sink.response().is_ok());
        assert_eq!(sink.response().err(), Some(SinkError::StreamTaken));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let sink = quiet_sink();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        sink.on_close(move |reason| {
            assert_eq!(reason, CloseReason::Closed);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sink.close();
        sink.close();

        assert!(sink.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_close_after_close_runs_immediately() {
        let sink = quiet_sink();
        sink.close();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        sink.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_body_closes_sink() {
        let sink = quiet_sink();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        sink.on_close(move |reason| {
            assert_eq!(reason, CloseReason::Cancelled);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let response = sink.response().unwrap();
        drop(response);

        sink.closed().await;
        assert!(sink.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(sink.send_message(Event::message("x")), Err(SinkError::Closed));

        // A later explicit close does not fire observers again
        sink.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_every_handle_ends_body() {
        let sink = quiet_sink();
        let (_, body) = sink.response().unwrap().into_parts();
        sink.send_message(Event::message("last")).unwrap();
        drop(sink);

        assert_eq!(collect_body(body).await, "data:last\n\n");
    }

    #[tokio::test]
    async fn test_backlog_limit() {
        let sink = EventSink::with_config(
            SinkConfig::new()
                .without_keep_alive()
                .with_max_buffered_frames(2),
        );
        let (_, mut body) = sink.response().unwrap().into_parts();

        sink.send_message(Event::message("1")).unwrap();
        sink.send_message(Event::message("2")).unwrap();
        assert_eq!(
            sink.send_message(Event::message("3")),
            Err(SinkError::Backlogged(2))
        );

        // Reading a frame makes room again
        let frame = body.next().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"data:1\n\n");
        sink.send_message(Event::message("3")).unwrap();
        sink.close();

        assert_eq!(collect_body(body).await, "data:2\n\ndata:3\n\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_rearms() {
        let sink = EventSink::with_config(
            SinkConfig::new().with_keep_alive_interval(Duration::from_millis(3000)),
        );
        let (_, body) = sink.response().unwrap().into_parts();

        tokio::time::sleep(Duration::from_millis(6500)).await;
        sink.close();

        assert_eq!(
            collect_body(body).await,
            ":keep-alive\n\n:keep-alive\n\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_keep_alive_after_close() {
        let sink = EventSink::new();
        let (_, body) = sink.response().unwrap().into_parts();
        sink.close();

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(collect_body(body).await, "");
    }
}
