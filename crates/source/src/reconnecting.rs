//! Auto-reconnecting, push-based event source.

use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use sseline_types::FrameDecoder;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    connection::{StreamEnd, pump, validate_response},
    error::{Result, SourceError},
    types::{
        IntoRequestTarget, MessageEvent, ReadyState, ReconnectOptions, RequestTarget, SourceEvent,
        build_request,
    },
};

/// Event source that reconnects after network failures.
///
/// Events are broadcast to every subscriber as [`SourceEvent`]s. A lost
/// connection or a normally ended stream is reported as
/// [`SourceEvent::Error`] and followed by a new attempt after the
/// reconnection time, replaying the cursor as `Last-Event-Id`. A handshake
/// the server rejects (bad status, wrong content type, no body) fails the
/// connection for good.
pub struct ReconnectingEventSource {
    target: RequestTarget,

    /// Configuration
    options: ReconnectOptions,

    /// Lifecycle of the current attempt
    state: Arc<RwLock<ReadyState>>,

    /// Cursor replayed on every reconnection
    last_event_id: Arc<RwLock<String>>,

    /// Event broadcaster for distributing events to multiple subscribers
    event_tx: broadcast::Sender<SourceEvent>,

    /// Shutdown signal
    abort: CancellationToken,

    /// Reconnection attempt counter
    reconnect_attempts: Arc<RwLock<u32>>,

    /// Cancelled once the source reaches `Closed` for good
    finished: CancellationToken,

    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingEventSource {
    /// Create a source; no request is issued until [`connect`](Self::connect)
    pub fn new(target: impl IntoRequestTarget, options: ReconnectOptions) -> Result<Self> {
        let target = target.into_request_target()?;
        // A zero-capacity broadcast channel panics
        let (event_tx, _) = broadcast::channel(options.channel_capacity.max(1));
        let last_event_id = options.last_event_id.clone().unwrap_or_default();
        let abort = options.source.abort_token();

        Ok(Self {
            target,
            options,
            state: Arc::new(RwLock::new(ReadyState::Connecting)),
            last_event_id: Arc::new(RwLock::new(last_event_id)),
            event_tx,
            abort,
            reconnect_attempts: Arc::new(RwLock::new(0)),
            finished: CancellationToken::new(),
            driver: Mutex::new(None),
        })
    }

    pub fn url(&self) -> String {
        self.target.url()
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state.read()
    }

    pub fn last_event_id(&self) -> String {
        self.last_event_id.read().clone()
    }

    /// Subscribe to events from this source
    ///
    /// Multiple subscribers can be created; subscribe before
    /// [`connect`](Self::connect) to observe the first `Open`.
    ///
    /// Each subscriber has [`ReconnectOptions::channel_capacity`] slots. One
    /// that falls further behind loses the oldest events and its next `recv`
    /// returns [`RecvError::Lagged`](broadcast::error::RecvError::Lagged)
    /// with the number skipped; receiving again resumes from the oldest
    /// retained event. The driver never waits on slow subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.event_tx.subscribe()
    }

    /// Resolves once the source is closed: by [`close`](Self::close), a
    /// rejected handshake or running out of reconnection attempts.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        self.finished.clone().cancelled_owned()
    }

    /// Start the connection task. Calling it again while the task runs is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// [`SourceError::Aborted`] once the source was closed, or
    /// [`SourceError::InvalidRequest`] if the first request cannot be built.
    pub fn connect(&self) -> Result<()> {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return Ok(());
        }
        if self.abort.is_cancelled() || self.ready_state() == ReadyState::Closed {
            return Err(SourceError::Aborted);
        }

        // Surface a malformed target or cursor to the caller
        build_request(
            &self.target,
            &self.options.source.headers,
            Some(&self.last_event_id()),
        )?;

        let task = ConnectionTask {
            target: self.target.clone(),
            options: self.options.clone(),
            url: self.target.url(),
            state: Arc::clone(&self.state),
            last_event_id: Arc::clone(&self.last_event_id),
            event_tx: self.event_tx.clone(),
            abort: self.abort.clone(),
            reconnect_attempts: Arc::clone(&self.reconnect_attempts),
            finished: self.finished.clone(),
        };
        *driver = Some(tokio::spawn(task.run()));
        Ok(())
    }

    /// Stop reconnecting, abort the current request and wait for the task.
    ///
    /// Idempotent; safe before [`connect`](Self::connect).
    pub async fn close(&self) {
        self.abort.cancel();
        *self.state.write() = ReadyState::Closed;

        let driver = self.driver.lock().take();
        if let Some(driver) = driver
            && let Err(e) = driver.await
        {
            warn!(url = %self.target.url(), error = %e, "Event source task failed");
        }
        self.finished.cancel();
    }
}

impl Drop for ReconnectingEventSource {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}

struct ConnectionTask {
    target: RequestTarget,
    options: ReconnectOptions,
    url: String,
    state: Arc<RwLock<ReadyState>>,
    last_event_id: Arc<RwLock<String>>,
    event_tx: broadcast::Sender<SourceEvent>,
    abort: CancellationToken,
    reconnect_attempts: Arc<RwLock<u32>>,
    finished: CancellationToken,
}

impl ConnectionTask {
    fn set_state(&self, new_state: ReadyState) {
        *self.state.write() = new_state;
    }

    fn dispatch(&self, event: SourceEvent) {
        // No subscribers is not an error
        let _ = self.event_tx.send(event);
    }

    async fn run(self) {
        let mut reconnection_time = self.options.reconnection_time;

        loop {
            let result = self.connect_once(&mut reconnection_time).await;

            if self.abort.is_cancelled() {
                break;
            }

            let error = match result {
                Ok(()) => SourceError::StreamEnded,
                Err(error) => error,
            };
            warn!(url = %self.url, error = %error, "Event stream error");
            let fatal = error.is_handshake_failure() || matches!(error, SourceError::InvalidRequest(_));
            self.dispatch(SourceEvent::Error(error));

            if fatal {
                error!(url = %self.url, "Handshake rejected, not reconnecting");
                break;
            }

            // Check max attempts
            {
                let mut attempts = self.reconnect_attempts.write();
                *attempts += 1;
                let max = self.options.max_reconnect_attempts;
                if max > 0 && *attempts > max {
                    error!(
                        url = %self.url,
                        attempts = *attempts - 1,
                        "Max reconnection attempts reached"
                    );
                    break;
                }
            }

            self.set_state(ReadyState::Connecting);
            info!(
                url = %self.url,
                delay_ms = reconnection_time.as_millis() as u64,
                "Scheduling reconnection"
            );

            tokio::select! {
                _ = self.abort.cancelled() => break,
                _ = tokio::time::sleep(reconnection_time) => {}
            }
        }

        self.set_state(ReadyState::Closed);
        self.finished.cancel();
        info!(url = %self.url, "Event source closed");
    }

    /// One attempt: handshake, then read the body until it ends or fails.
    /// Resolves `Ok` when the server ends the stream.
    async fn connect_once(&self, reconnection_time: &mut Duration) -> Result<()> {
        let cursor = self.last_event_id.read().clone();
        let request = build_request(&self.target, &self.options.source.headers, Some(&cursor))?;
        info!(url = %self.url, last_event_id = %cursor, "Connecting to event stream");

        let response = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Err(SourceError::Aborted),
            response = self.options.source.fetch.fetch(request) => response?,
        };
        let origin = response.url().unwrap_or(&self.url).to_string();
        let body = validate_response(response)?;

        self.set_state(ReadyState::Open);
        *self.reconnect_attempts.write() = 0;
        info!(url = %self.url, "Event stream open");
        self.dispatch(SourceEvent::Open);

        let mut frames = FrameDecoder::with_last_event_id(cursor);
        let keep_alive = self.options.source.keep_alive_timeout;
        let end = pump(body, &mut frames, &self.abort, keep_alive, |event, cursor| {
            debug!(
                url = %self.url,
                event_type = %event.event_type(),
                id = ?event.id,
                "Event received"
            );
            *self.last_event_id.write() = cursor.to_string();
            self.dispatch(SourceEvent::Message(MessageEvent {
                event_type: event.event_type().to_string(),
                event,
                last_event_id: cursor.to_string(),
                origin: origin.clone(),
            }));
        })
        .await;

        if let Some(retry) = frames.reconnection_time() {
            *reconnection_time = Duration::from_millis(retry);
        }
        *self.last_event_id.write() = frames.last_event_id().to_string();

        match end {
            StreamEnd::Ended => Ok(()),
            StreamEnd::Failed(error) => Err(error),
            StreamEnd::Aborted => Err(SourceError::Aborted),
            StreamEnd::TimedOut => Err(SourceError::KeepAliveTimeout),
        }
    }
}
