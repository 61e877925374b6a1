//! One-shot, pull-based event source.

use std::{sync::Arc, time::Duration};

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use sseline_types::{Event, FrameDecoder};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::{StreamEnd, pump, validate_response},
    error::{Result, SourceError},
    fetch::Fetch,
    types::{IntoRequestTarget, ReadyState, SourceOptions, build_request},
};

/// Everything a consumer can observe, in arrival order
#[derive(Debug)]
pub(crate) enum Occurrence {
    Event(Event),
    Error(SourceError),
    Close,
}

/// Outcome of the first handshake
#[derive(Debug, Clone)]
enum Handshake {
    Pending,
    Open,
    Failed(SourceError),
}

/// Single entry point turning occurrences into queued items
#[derive(Clone)]
struct Dispatcher {
    url: Arc<str>,
    tx: mpsc::UnboundedSender<Occurrence>,
}

impl Dispatcher {
    fn dispatch(&self, occurrence: Occurrence) {
        match &occurrence {
            Occurrence::Event(event) => debug!(
                url = %self.url,
                event_type = %event.event_type(),
                id = ?event.id,
                "Event received"
            ),
            Occurrence::Error(error) => warn!(url = %self.url, error = %error, "Event stream error"),
            Occurrence::Close => debug!(url = %self.url, "Event stream closed"),
        }
        // The receiver lives as long as the source; a send failure means
        // nobody can observe the occurrence anymore.
        let _ = self.tx.send(occurrence);
    }
}

/// Event source - one connection, consumed by pulling.
///
/// The request is issued as soon as the source is created. Every failure is
/// terminal: the source goes `Connecting → Open → Closed` at most once and
/// never reconnects (see [`ReconnectingEventSource`](crate::ReconnectingEventSource)
/// for that policy).
///
/// # Example
///
/// ```ignore
/// use sseline_source::{EventSource, SourceOptions};
///
/// let source = EventSource::new("http://127.0.0.1:8080/events", SourceOptions::default())?;
/// source.connected().await?;
///
/// while let Some(event) = source.next().await? {
///     println!("{}: {:?}", event.event_type(), event.data);
/// }
/// source.close().await;
/// ```
pub struct EventSource {
    url: Arc<str>,
    state: Arc<RwLock<ReadyState>>,
    last_event_id: Arc<RwLock<String>>,
    occurrences: AsyncMutex<mpsc::UnboundedReceiver<Occurrence>>,
    handshake: watch::Receiver<Handshake>,
    abort: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl EventSource {
    /// Create a source and start connecting.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidRequest`] if the target cannot be turned
    /// into a request.
    pub fn new(target: impl IntoRequestTarget, options: SourceOptions) -> Result<Self> {
        let target = target.into_request_target()?;
        let request = build_request(&target, &options.headers, None)?;
        let url: Arc<str> = Arc::from(target.url());

        let (tx, rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = watch::channel(Handshake::Pending);
        let state = Arc::new(RwLock::new(ReadyState::Connecting));
        let last_event_id = Arc::new(RwLock::new(String::new()));
        let abort = options.abort_token();

        let driver = Driver {
            dispatcher: Dispatcher {
                url: Arc::clone(&url),
                tx,
            },
            fetch: Arc::clone(&options.fetch),
            handshake: handshake_tx,
            state: Arc::clone(&state),
            last_event_id: Arc::clone(&last_event_id),
            abort: abort.clone(),
            keep_alive: options.keep_alive_timeout,
        };
        let driver = tokio::spawn(driver.run(request));

        Ok(Self {
            url,
            state,
            last_event_id,
            occurrences: AsyncMutex::new(rx),
            handshake: handshake_rx,
            abort,
            driver: Mutex::new(Some(driver)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state.read()
    }

    /// Most recent event id received, empty if none
    pub fn last_event_id(&self) -> String {
        self.last_event_id.read().clone()
    }

    /// Resolves once the handshake succeeds, or fails with the reason the
    /// first (and only) attempt failed. Settles exactly once.
    pub async fn connected(&self) -> Result<()> {
        let mut handshake = self.handshake.clone();
        let settled = handshake
            .wait_for(|h| !matches!(h, Handshake::Pending))
            .await
            .map(|h| h.clone());

        match settled {
            Ok(Handshake::Open) => Ok(()),
            Ok(Handshake::Failed(error)) => Err(error),
            Ok(Handshake::Pending) | Err(_) => Err(SourceError::Aborted),
        }
    }

    /// Pull the next event.
    ///
    /// Returns `Ok(None)` once the stream is over, and the terminal error if
    /// the connection failed. Waits for the handshake to settle first.
    ///
    /// # Errors
    ///
    /// [`SourceError::AlreadyWaiting`] if another `next()` is still pending;
    /// otherwise the error that ended the connection.
    pub async fn next(&self) -> Result<Option<Event>> {
        let mut occurrences = self
            .occurrences
            .try_lock()
            .map_err(|_| SourceError::AlreadyWaiting)?;

        // A failed handshake is queued as an error occurrence below
        let _ = self.connected().await;

        match occurrences.recv().await {
            Some(Occurrence::Event(event)) => Ok(Some(event)),
            Some(Occurrence::Error(error)) => Err(error),
            Some(Occurrence::Close) | None => Ok(None),
        }
    }

    /// Consume the source as a finite stream.
    ///
    /// Yields events until the end of the stream, or yields the terminal
    /// error once and stops.
    pub fn into_stream(self) -> impl Stream<Item = Result<Event>> + Send {
        async_stream::stream! {
            loop {
                match self.next().await {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => break,
                    Err(error) => {
                        yield Err(error);
                        break;
                    }
                }
            }
            self.close().await;
        }
    }

    /// Abort the request and wait for the connection task to finish.
    ///
    /// Safe to call at any time and any number of times.
    pub async fn close(&self) {
        self.abort.cancel();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver
            && let Err(e) = driver.await
        {
            warn!(url = %self.url, error = %e, "Event source task failed");
        }
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}

/// Background task owning the one connection attempt
struct Driver {
    dispatcher: Dispatcher,
    fetch: Arc<dyn Fetch>,
    handshake: watch::Sender<Handshake>,
    state: Arc<RwLock<ReadyState>>,
    last_event_id: Arc<RwLock<String>>,
    abort: CancellationToken,
    keep_alive: Option<Duration>,
}

impl Driver {
    async fn run(self, request: http::Request<()>) {
        if let Err(error) = self.connect(request).await {
            self.handshake.send_if_modified(|h| {
                if matches!(h, Handshake::Pending) {
                    *h = Handshake::Failed(error.clone());
                    true
                } else {
                    false
                }
            });
            self.dispatcher.dispatch(Occurrence::Error(error));
        }

        *self.state.write() = ReadyState::Closed;
        self.dispatcher.dispatch(Occurrence::Close);
    }

    async fn connect(&self, request: http::Request<()>) -> Result<()> {
        let url = &self.dispatcher.url;
        info!(url = %url, "Connecting to event stream");

        let response = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Err(SourceError::Aborted),
            response = self.fetch.fetch(request) => response?,
        };
        let body = validate_response(response)?;

        *self.state.write() = ReadyState::Open;
        self.handshake.send_replace(Handshake::Open);
        info!(url = %url, "Event stream open");

        let mut frames = FrameDecoder::new();
        let end = pump(body, &mut frames, &self.abort, self.keep_alive, |event, cursor| {
            *self.last_event_id.write() = cursor.to_string();
            self.dispatcher.dispatch(Occurrence::Event(event));
        })
        .await;
        // An id in a frame without data still moves the cursor
        *self.last_event_id.write() = frames.last_event_id().to_string();

        match end {
            StreamEnd::Ended => {
                info!(url = %url, "Event stream ended");
                Ok(())
            }
            StreamEnd::Failed(error) => Err(error),
            StreamEnd::Aborted => Err(SourceError::Aborted),
            StreamEnd::TimedOut => {
                self.abort.cancel();
                Err(SourceError::KeepAliveTimeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::{StreamExt, stream};
    use http::{HeaderMap, HeaderValue, Request, StatusCode, header};

    use super::*;
    use crate::fetch::FetchResponse;

    fn event_stream_response(body: &'static str) -> FetchResponse {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        FetchResponse::new(StatusCode::OK, headers).with_body(stream::once(async move {
            Ok::<_, SourceError>(Bytes::from_static(body.as_bytes()))
        }))
    }

    fn static_source(body: &'static str) -> EventSource {
        let options = SourceOptions::new().with_fetch(move |_: Request<()>| async move {
            Ok::<_, SourceError>(event_stream_response(body))
        });
        EventSource::new("http://localhost/sse", options).unwrap()
    }

    #[tokio::test]
    async fn test_events_then_done() {
        let source = static_source("data:one\n\nevent:tick\ndata:two\nid:9\n\n");

        assert_eq!(source.next().await.unwrap(), Some(Event::message("one")));
        assert_eq!(
            source.next().await.unwrap(),
            Some(Event::message("two").with_event("tick").with_id("9"))
        );
        assert_eq!(source.next().await.unwrap(), None);
        // Iteration stays finished
        assert_eq!(source.next().await.unwrap(), None);

        assert_eq!(source.ready_state(), ReadyState::Closed);
        assert_eq!(source.last_event_id(), "9");
    }

    #[tokio::test]
    async fn test_cursor_follows_every_id_line() {
        let source = static_source("id:5\ndata:a\n\nid:6\n\ndata:b\n\nid:7\n\n");

        assert_eq!(
            source.next().await.unwrap(),
            Some(Event::message("a").with_id("5"))
        );
        // The data-less frame moved the cursor, the next frame carries no id
        assert_eq!(source.next().await.unwrap(), Some(Event::message("b")));
        assert_eq!(source.last_event_id(), "6");

        assert_eq!(source.next().await.unwrap(), None);
        assert_eq!(source.last_event_id(), "7");
    }

    fn rejected_source(status: StatusCode, content_type: &'static str) -> EventSource {
        let options = SourceOptions::new().with_fetch(move |_: Request<()>| async move {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            Ok::<_, SourceError>(FetchResponse::new(status, headers).with_body(stream::once(
                async { Ok::<_, SourceError>(Bytes::from_static(b"data:ignored\n\n")) },
            )))
        });
        EventSource::new("http://localhost/sse", options).unwrap()
    }

    #[tokio::test]
    async fn test_bad_status_rejected() {
        let source = rejected_source(StatusCode::BAD_REQUEST, "text/event-stream");

        let err = source.next().await.unwrap_err();
        assert_eq!(err, SourceError::UnexpectedStatus(400));
        assert_eq!(err.to_string(), "Unexpected status code: 400");
        assert_eq!(source.next().await, Ok(None));
        assert_eq!(source.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_wrong_content_type_rejected() {
        let source = rejected_source(StatusCode::OK, "application/json");

        let err = source.next().await.unwrap_err();
        assert_eq!(
            err,
            SourceError::UnexpectedContentType("application/json".to_string())
        );
        assert_eq!(err.to_string(), "Unexpected content type: application/json");
        assert_eq!(source.next().await, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_timeout_rejected() {
        let options = SourceOptions::new()
            .with_keep_alive_timeout(Duration::from_millis(500))
            .with_fetch(|_: Request<()>| async {
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/event-stream"),
                );
                let body = stream::once(async {
                    Ok::<_, SourceError>(Bytes::from_static(b"data:first\n\n"))
                })
                .chain(stream::pending());
                Ok::<_, SourceError>(FetchResponse::new(StatusCode::OK, headers).with_body(body))
            });
        let source = EventSource::new("http://localhost/sse", options).unwrap();

        assert_eq!(source.next().await.unwrap(), Some(Event::message("first")));
        let err = source.next().await.unwrap_err();
        assert_eq!(err, SourceError::KeepAliveTimeout);
        assert_eq!(err.to_string(), "Keep-alive timeout");
        assert_eq!(source.next().await, Ok(None));
        assert_eq!(source.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let source = static_source("data:a\n\ndata:b\n\n");
        let events: Vec<_> = source.into_stream().collect().await;
        assert_eq!(
            events,
            vec![Ok(Event::message("a")), Ok(Event::message("b"))]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_is_terminal() {
        let options = SourceOptions::new().with_fetch(|_: Request<()>| async {
            Err::<FetchResponse, _>(SourceError::Transport("connection refused".to_string()))
        });
        let source = EventSource::new("http://localhost/sse", options).unwrap();

        assert_eq!(
            source.connected().await,
            Err(SourceError::Transport("connection refused".to_string()))
        );
        assert_eq!(
            source.next().await,
            Err(SourceError::Transport("connection refused".to_string()))
        );
        assert_eq!(source.next().await, Ok(None));
        assert_eq!(source.ready_state(), ReadyState::Closed);
        source.close().await;
    }

    #[tokio::test]
    async fn test_second_pull_is_rejected() {
        let options = SourceOptions::new().with_fetch(|_: Request<()>| async {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            Ok::<_, SourceError>(FetchResponse::new(StatusCode::OK, headers)
                .with_body(stream::pending::<std::result::Result<Bytes, SourceError>>()))
        });
        let source = EventSource::new("http://localhost/sse", options).unwrap();

        let first = source.next();
        tokio::pin!(first);
        assert!(futures::poll!(&mut first).is_pending());

        assert_eq!(source.next().await, Err(SourceError::AlreadyWaiting));

        source.close().await;
        assert_eq!(first.await, Err(SourceError::Aborted));
    }

    #[tokio::test]
    async fn test_close_before_response() {
        let options = SourceOptions::new().with_fetch(|_: Request<()>| {
            futures::future::pending::<Result<FetchResponse>>()
        });
        let source = EventSource::new("http://localhost/sse", options).unwrap();

        source.close().await;
        source.close().await;

        assert_eq!(source.connected().await, Err(SourceError::Aborted));
        assert_eq!(source.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_external_signal_aborts() {
        let signal = CancellationToken::new();
        let options = SourceOptions::new()
            .with_signal(signal.clone())
            .with_fetch(|_: Request<()>| futures::future::pending::<Result<FetchResponse>>());
        let source = EventSource::new("http://localhost/sse", options).unwrap();

        signal.cancel();
        assert_eq!(source.next().await, Err(SourceError::Aborted));
        assert_eq!(source.next().await, Ok(None));
    }

    #[test]
    fn test_invalid_target() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let result = EventSource::new("::not a url::", SourceOptions::new());
            assert!(matches!(result, Err(SourceError::InvalidRequest(_))));
        });
    }
}
