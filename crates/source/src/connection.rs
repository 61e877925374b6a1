//! Handshake validation and the body pump shared by both source flavours.

use std::time::Duration;

use futures::StreamExt;
use http::{StatusCode, header};
use sseline_types::{DecodedLine, Event, FrameDecoder, LineSplitter};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    error::{Result, SourceError},
    fetch::{ByteStream, FetchResponse},
};

const EVENT_STREAM: &str = "text/event-stream";

/// How a body pump stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    /// The server ended the body
    Ended,
    /// Reading the body failed
    Failed(SourceError),
    /// The abort token was cancelled
    Aborted,
    /// No line arrived within the keep-alive window
    TimedOut,
}

/// Check a handshake response and take its body.
///
/// The status must be exactly 200 and the media type `text/event-stream`
/// (parameters such as `charset` are ignored).
pub(crate) fn validate_response(response: FetchResponse) -> Result<ByteStream> {
    if response.status() != StatusCode::OK {
        return Err(SourceError::UnexpectedStatus(response.status().as_u16()));
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let is_event_stream = content_type
        .and_then(|value| value.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(EVENT_STREAM));
    if !is_event_stream {
        return Err(SourceError::UnexpectedContentType(
            content_type.unwrap_or("none").to_string(),
        ));
    }

    response.into_body().ok_or(SourceError::MissingBody)
}

/// Read a body to its end, decoding frames as they complete.
///
/// Every decoded line counts as traffic and re-arms the keep-alive watchdog,
/// so comment-only heartbeats keep the connection alive. Dispatched events
/// are handed to `on_event` together with the cursor at dispatch time. The
/// body is dropped on return, which cancels the transfer.
pub(crate) async fn pump<F>(
    mut body: ByteStream,
    frames: &mut FrameDecoder,
    abort: &CancellationToken,
    keep_alive: Option<Duration>,
    mut on_event: F,
) -> StreamEnd
where
    F: FnMut(Event, &str),
{
    let mut lines = LineSplitter::new();
    // Never polled when no timeout is configured
    let watchdog = sleep(keep_alive.unwrap_or(Duration::MAX));
    tokio::pin!(watchdog);

    loop {
        tokio::select! {
            biased;

            _ = abort.cancelled() => return StreamEnd::Aborted,

            _ = &mut watchdog, if keep_alive.is_some() => return StreamEnd::TimedOut,

            chunk = body.next() => match chunk {
                Some(Ok(chunk)) => {
                    for line in lines.push(&chunk) {
                        // An unrepresentable deadline keeps the far-future one
                        if let Some(deadline) =
                            keep_alive.and_then(|timeout| Instant::now().checked_add(timeout))
                        {
                            watchdog.as_mut().reset(deadline);
                        }
                        match frames.feed_line(&line) {
                            DecodedLine::Dispatch(event) => on_event(event, frames.last_event_id()),
                            DecodedLine::Comment => trace!("Comment line received"),
                            DecodedLine::Field | DecodedLine::Discarded => {}
                        }
                    }
                }
                Some(Err(error)) => return StreamEnd::Failed(error),
                None => {
                    // A trailing line without a blank line never dispatches
                    if let Some(line) = lines.finish() {
                        frames.feed_line(&line);
                    }
                    return StreamEnd::Ended;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::stream;
    use http::{HeaderMap, HeaderValue};

    use super::*;

    fn response(status: u16, content_type: Option<&'static str>) -> FetchResponse {
        let mut headers = HeaderMap::new();
        if let Some(content_type) = content_type {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        FetchResponse::new(StatusCode::from_u16(status).unwrap(), headers)
            .with_body(stream::empty::<std::result::Result<Bytes, SourceError>>())
    }

    fn body(chunks: Vec<&'static str>) -> ByteStream {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes())))).boxed()
    }

    #[test]
    fn test_validate_status() {
        let err = validate_response(response(400, Some(EVENT_STREAM))).err().unwrap();
        assert_eq!(err, SourceError::UnexpectedStatus(400));
        assert_eq!(err.to_string(), "Unexpected status code: 400");

        // Only 200 is accepted, not any 2xx
        let err = validate_response(response(204, Some(EVENT_STREAM))).err().unwrap();
        assert_eq!(err, SourceError::UnexpectedStatus(204));
    }

    #[test]
    fn test_validate_content_type() {
        let err = validate_response(response(200, Some("application/json")))
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Unexpected content type: application/json");

        let err = validate_response(response(200, None)).err().unwrap();
        assert_eq!(err, SourceError::UnexpectedContentType("none".to_string()));

        assert!(validate_response(response(200, Some("text/event-stream; charset=utf-8"))).is_ok());
    }

    #[test]
    fn test_validate_missing_body() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM));
        let err = validate_response(FetchResponse::new(StatusCode::OK, headers))
            .err()
            .unwrap();
        assert_eq!(err, SourceError::MissingBody);
    }

    #[tokio::test]
    async fn test_pump_dispatches_in_order() {
        let mut frames = FrameDecoder::new();
        let mut seen = Vec::new();
        let end = pump(
            body(vec!["id:1\ndata:a\n", "\n:keep-alive\n\ndata:b\n\n", "data:unterminated"]),
            &mut frames,
            &CancellationToken::new(),
            None,
            |event, cursor| seen.push((event.data.unwrap(), cursor.to_string())),
        )
        .await;

        assert_eq!(end, StreamEnd::Ended);
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "1".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_pump_aborts() {
        let abort = CancellationToken::new();
        abort.cancel();
        let end = pump(
            stream::pending().boxed(),
            &mut FrameDecoder::new(),
            &abort,
            None,
            |_, _| {},
        )
        .await;
        assert_eq!(end, StreamEnd::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_times_out_without_traffic() {
        let end = pump(
            stream::pending().boxed(),
            &mut FrameDecoder::new(),
            &CancellationToken::new(),
            Some(Duration::from_millis(100)),
            |_, _| {},
        )
        .await;
        assert_eq!(end, StreamEnd::TimedOut);
    }

    #[tokio::test]
    async fn test_pump_with_unbounded_keep_alive() {
        let mut seen = 0;
        let end = pump(
            body(vec![":hb\n", "data:a\n\n"]),
            &mut FrameDecoder::new(),
            &CancellationToken::new(),
            Some(Duration::MAX),
            |_, _| seen += 1,
        )
        .await;
        assert_eq!(end, StreamEnd::Ended);
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn test_pump_reports_body_errors() {
        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"data:x\n\n")),
            Err(SourceError::Transport("reset".to_string())),
        ])
        .boxed();
        let mut count = 0;
        let end = pump(
            failing,
            &mut FrameDecoder::new(),
            &CancellationToken::new(),
            None,
            |_, _| count += 1,
        )
        .await;
        assert_eq!(count, 1);
        assert_eq!(end, StreamEnd::Failed(SourceError::Transport("reset".to_string())));
    }
}
