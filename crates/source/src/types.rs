use std::{fmt, sync::Arc, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, header};
use sseline_types::Event;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Result, SourceError},
    fetch::{Fetch, ReqwestFetch},
};

/// Reconnection delay used until the server sends a `retry` field.
pub const DEFAULT_RECONNECTION_TIME: Duration = Duration::from_millis(5000);

/// Events a reconnecting source retains for its slowest subscriber
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of a source's current connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Waiting for the handshake, or for the next reconnection attempt
    Connecting,

    /// Headers validated, events flowing
    Open,

    /// Terminal
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyState::Connecting => write!(f, "connecting"),
            ReadyState::Open => write!(f, "open"),
            ReadyState::Closed => write!(f, "closed"),
        }
    }
}

/// Where a source connects to: a method, a URI and any headers carried by
/// a prebuilt request.
#[derive(Debug, Clone)]
pub struct RequestTarget {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestTarget {
    /// Parse an absolute URL into a `GET` target
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url).map_err(|e| SourceError::InvalidRequest(e.to_string()))?;
        let uri = parsed
            .as_str()
            .parse::<Uri>()
            .map_err(|e| SourceError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            method: Method::GET,
            uri,
            headers: HeaderMap::new(),
        })
    }

    pub fn url(&self) -> String {
        self.uri.to_string()
    }
}

impl From<Request<()>> for RequestTarget {
    fn from(request: Request<()>) -> Self {
        let (parts, ()) = request.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
        }
    }
}

/// Anything a source can be pointed at: a URL string or a prebuilt request
pub trait IntoRequestTarget {
    fn into_request_target(self) -> Result<RequestTarget>;
}

impl IntoRequestTarget for RequestTarget {
    fn into_request_target(self) -> Result<RequestTarget> {
        Ok(self)
    }
}

impl IntoRequestTarget for &str {
    fn into_request_target(self) -> Result<RequestTarget> {
        RequestTarget::parse(self)
    }
}

impl IntoRequestTarget for String {
    fn into_request_target(self) -> Result<RequestTarget> {
        RequestTarget::parse(&self)
    }
}

impl IntoRequestTarget for &String {
    fn into_request_target(self) -> Result<RequestTarget> {
        RequestTarget::parse(self)
    }
}

impl IntoRequestTarget for Request<()> {
    fn into_request_target(self) -> Result<RequestTarget> {
        Ok(self.into())
    }
}

/// Options shared by both source flavours
#[derive(Clone)]
pub struct SourceOptions {
    /// Transport used to issue requests
    pub fetch: Arc<dyn Fetch>,

    /// Headers added to every request
    pub headers: HeaderMap,

    /// External abort signal; cancelling it aborts the source
    pub signal: Option<CancellationToken>,

    /// Fail the connection when no line arrives for this long
    pub keep_alive_timeout: Option<Duration>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            fetch: Arc::new(ReqwestFetch::default()),
            headers: HeaderMap::new(),
            signal: None,
            keep_alive_timeout: None,
        }
    }
}

impl fmt::Debug for SourceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceOptions")
            .field("headers", &self.headers)
            .field("signal", &self.signal)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .finish_non_exhaustive()
    }
}

impl SourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom transport
    pub fn with_fetch(mut self, fetch: impl Fetch) -> Self {
        self.fetch = Arc::new(fetch);
        self
    }

    /// Add one request header
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add a set of request headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        merge_headers(&mut self.headers, &headers);
        self
    }

    /// Tie the source to an external abort signal
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Enable the keep-alive watchdog
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = Some(timeout);
        self
    }

    /// Token for one source: a child of the external signal when one is set
    pub(crate) fn abort_token(&self) -> CancellationToken {
        match &self.signal {
            Some(signal) => signal.child_token(),
            None => CancellationToken::new(),
        }
    }
}

/// Options for a [`ReconnectingEventSource`](crate::ReconnectingEventSource)
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    /// Transport, headers, signal and keep-alive
    pub source: SourceOptions,

    /// Delay before reconnecting, replaced by any `retry` the server sends
    pub reconnection_time: Duration,

    /// Maximum number of consecutive reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Cursor to resume from on the first connection
    pub last_event_id: Option<String>,

    /// Events retained per subscriber before the oldest are dropped
    pub channel_capacity: usize,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            source: SourceOptions::default(),
            reconnection_time: DEFAULT_RECONNECTION_TIME,
            max_reconnect_attempts: 0,
            last_event_id: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ReconnectOptions {
    pub fn new(source: SourceOptions) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    /// Set the initial reconnection delay
    pub fn with_reconnection_time(mut self, delay: Duration) -> Self {
        self.reconnection_time = delay;
        self
    }

    /// Set maximum reconnection attempts
    pub fn with_max_reconnect_attempts(mut self, max: u32) -> Self {
        self.max_reconnect_attempts = max;
        self
    }

    /// Resume from a known event id
    pub fn with_last_event_id(mut self, id: impl Into<String>) -> Self {
        self.last_event_id = Some(id.into());
        self
    }

    /// Set how many events a lagging subscriber may fall behind
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

/// An event delivered by a [`ReconnectingEventSource`](crate::ReconnectingEventSource)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Effective event type, `"message"` when the frame had none
    pub event_type: String,

    /// The decoded event
    pub event: Event,

    /// Cursor at the time of dispatch
    pub last_event_id: String,

    /// URL the stream was served from
    pub origin: String,
}

impl MessageEvent {
    pub fn data(&self) -> &str {
        self.event.data.as_deref().unwrap_or_default()
    }
}

/// Notifications broadcast by a [`ReconnectingEventSource`](crate::ReconnectingEventSource)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A handshake succeeded
    Open,

    /// An event was decoded
    Message(MessageEvent),

    /// The connection failed or ended
    Error(SourceError),
}

/// Replace every header of `src` in `dst`, keeping multi-valued headers intact
pub(crate) fn merge_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for name in src.keys() {
        dst.remove(name);
    }
    for (name, value) in src {
        dst.append(name.clone(), value.clone());
    }
}

/// Build the request for one connection attempt.
///
/// Caller headers are applied first, then those of a request-shaped target,
/// then `Accept` and, when resuming, `Last-Event-Id`.
pub(crate) fn build_request(
    target: &RequestTarget,
    headers: &HeaderMap,
    last_event_id: Option<&str>,
) -> Result<Request<()>> {
    let mut merged = HeaderMap::new();
    merge_headers(&mut merged, headers);
    merge_headers(&mut merged, &target.headers);
    merged.insert(
        header::ACCEPT,
        HeaderValue::from_static("text/event-stream"),
    );

    if let Some(id) = last_event_id.filter(|id| !id.is_empty()) {
        let value = HeaderValue::from_str(id)
            .map_err(|e| SourceError::InvalidRequest(format!("Last-Event-Id: {e}")))?;
        merged.insert(HeaderName::from_static("last-event-id"), value);
    }

    let mut request = Request::builder()
        .method(target.method.clone())
        .uri(target.uri.clone())
        .body(())
        .map_err(|e| SourceError::InvalidRequest(e.to_string()))?;
    *request.headers_mut() = merged;
    Ok(request)
}
