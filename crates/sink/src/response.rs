//! Response surface of a sink: SSE headers plus the encoded byte stream.

use std::{
    convert::Infallible,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll, ready},
};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::Stream;
use sseline_types::{Event, encode};
use tokio::sync::mpsc;

use crate::sink::{CloseReason, SinkInner};

/// `Keep-Alive` header value: the largest integer a JavaScript client can
/// represent exactly, i.e. "never time out".
const KEEP_ALIVE_TIMEOUT: &str = "timeout=9007199254740991";

/// Headers every event-stream response carries
pub fn sse_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("keep-alive"),
        HeaderValue::from_static(KEEP_ALIVE_TIMEOUT),
    );
    headers
}

/// The encoded frames of one sink.
///
/// Yields one chunk per event. Dropping the body before it ends is a
/// consumer-side cancellation and closes the sink.
pub struct EventBody {
    rx: mpsc::UnboundedReceiver<Event>,
    queued: Arc<AtomicUsize>,
    sink: Weak<SinkInner>,
}

impl EventBody {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Event>,
        queued: Arc<AtomicUsize>,
        sink: Weak<SinkInner>,
    ) -> Self {
        Self { rx, queued, sink }
    }
}

impl Stream for EventBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let event = ready!(this.rx.poll_recv(cx));
        Poll::Ready(event.map(|event| {
            this.queued.fetch_sub(1, Ordering::AcqRel);
            Ok(encode(&event))
        }))
    }
}

impl Drop for EventBody {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.upgrade() {
            sink.shutdown(CloseReason::Cancelled);
        }
    }
}

/// A `200 OK` event-stream response, ready for any HTTP layer.
pub struct SinkResponse {
    headers: HeaderMap,
    body: EventBody,
}

impl SinkResponse {
    pub(crate) fn new(body: EventBody) -> Self {
        Self {
            headers: sse_headers(),
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::OK
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Split into headers and body for HTTP layers other than axum
    pub fn into_parts(self) -> (HeaderMap, EventBody) {
        (self.headers, self.body)
    }
}

impl IntoResponse for SinkResponse {
    fn into_response(self) -> Response {
        (StatusCode::OK, self.headers, Body::from_stream(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, body::to_bytes, http::Request, routing::get};
    use tower::ServiceExt;

    use super::*;
    use crate::{config::SinkConfig, sink::EventSink};

    #[test]
    fn test_sse_headers() {
        let headers = sse_headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::CONNECTION], "keep-alive");
        assert_eq!(headers["keep-alive"], "timeout=9007199254740991");
    }

    #[tokio::test]
    async fn test_serve_through_router() {
        let sink = EventSink::with_config(SinkConfig::new().without_keep_alive());
        sink.send_message(Event::message("a\nb").with_event("multi"))
            .unwrap();
        sink.close();

        let app = Router::new().route(
            "/events",
            get(move || {
                let sink = sink.clone();
                async move { sink.response().unwrap() }
            }),
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"event:multi\ndata:a\ndata:b\n\n");
    }
}
