//! Incremental frame decoding.
//!
//! Decoding runs in two stages: [`LineSplitter`] turns arbitrary byte chunks
//! into complete lines, then [`FrameDecoder`] folds lines into events.
//! [`EventDecoder`] chains both for callers that hold raw body chunks.

use bytes::BytesMut;

use crate::event::Event;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Splits a chunked byte stream into lines.
///
/// A UTF-8 byte order mark at the very start of the stream is dropped, even
/// when it arrives split over several chunks.
/// `\r\n`, `\r` and `\n` all terminate a line, including a `\r\n` pair that
/// straddles two chunks. Each line is decoded as UTF-8 with replacement of
/// invalid sequences. Line terminators never occur inside a multi-byte UTF-8
/// sequence, so decoding per line matches decoding the whole stream.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: BytesMut,
    /// The previous chunk ended in `\r`; a leading `\n` belongs to it
    skip_lf: bool,
    /// The start of the stream was checked for a byte order mark
    bom_checked: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.bom_checked {
            return self.split_lines(chunk);
        }

        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() < BOM.len() && BOM.starts_with(&self.buffer[..]) {
            return Vec::new();
        }
        self.bom_checked = true;
        if self.buffer.starts_with(BOM) {
            let _ = self.buffer.split_to(BOM.len());
        }
        let pending = self.buffer.split();
        self.split_lines(&pending)
    }

    fn split_lines(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut rest = chunk;
        let mut lines = Vec::new();

        if rest.is_empty() {
            return lines;
        }
        if self.skip_lf {
            self.skip_lf = false;
            if rest[0] == b'\n' {
                rest = &rest[1..];
            }
        }

        while let Some(pos) = rest.iter().position(|b| matches!(b, b'\r' | b'\n')) {
            self.buffer.extend_from_slice(&rest[..pos]);
            lines.push(self.take_line());

            let terminator_len = match (rest[pos], rest.get(pos + 1)) {
                (b'\r', Some(b'\n')) => 2,
                (b'\r', None) => {
                    self.skip_lf = true;
                    1
                }
                _ => 1,
            };
            rest = &rest[pos + terminator_len..];
        }

        self.buffer.extend_from_slice(rest);
        lines
    }

    /// Flush a trailing line that never received its terminator
    pub fn finish(&mut self) -> Option<String> {
        self.skip_lf = false;
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let line = self.buffer.split();
        String::from_utf8_lossy(&line).into_owned()
    }
}

/// What a single line did to the decoder state.
///
/// Every variant is protocol traffic, which is what liveness timers count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedLine {
    /// A `:` comment line, never dispatched
    Comment,
    /// A field line accumulated into the current frame
    Field,
    /// A blank line closed a frame carrying data
    Dispatch(Event),
    /// A blank line closed a frame without data; nothing to dispatch
    Discarded,
}

/// Folds lines into events.
///
/// The last event id and the reconnection time persist across frames; every
/// other accumulator is reset at each blank line.
#[derive(Debug, Default, Clone)]
pub struct FrameDecoder {
    data: String,
    event_type: String,
    frame_id: Option<String>,
    frame_retry: Option<u64>,
    last_event_id: String,
    reconnection_time: Option<u64>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known cursor, e.g. one replayed on reconnect
    pub fn with_last_event_id(last_event_id: impl Into<String>) -> Self {
        Self {
            last_event_id: last_event_id.into(),
            ..Default::default()
        }
    }

    /// Most recent `id` seen, empty when none was ever received
    pub fn last_event_id(&self) -> &str {
        &self.last_event_id
    }

    /// Most recent valid `retry` value in milliseconds
    pub fn reconnection_time(&self) -> Option<u64> {
        self.reconnection_time
    }

    pub fn feed_line(&mut self, line: &str) -> DecodedLine {
        if line.is_empty() {
            return self.end_frame();
        }
        if line.starts_with(':') {
            return DecodedLine::Comment;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = value.to_string(),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = value.to_string();
                    self.frame_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Some(retry) = parse_retry(value) {
                    self.reconnection_time = Some(retry);
                    self.frame_retry = Some(retry);
                }
            }
            _ => {}
        }
        DecodedLine::Field
    }

    fn end_frame(&mut self) -> DecodedLine {
        let event_type = std::mem::take(&mut self.event_type);
        let id = self.frame_id.take();
        let retry = self.frame_retry.take();
        let mut data = std::mem::take(&mut self.data);

        if data.is_empty() {
            return DecodedLine::Discarded;
        }
        if data.ends_with('\n') {
            data.pop();
        }

        DecodedLine::Dispatch(Event {
            data: Some(data),
            event: (!event_type.is_empty()).then_some(event_type),
            id,
            retry,
            comment: None,
        })
    }
}

/// Numeric parse with the leniency of a JavaScript `Number()` conversion:
/// surrounding whitespace is ignored and a blank value reads as zero.
/// Non-finite and negative values are rejected.
fn parse_retry(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Some(0);
    }
    let parsed: f64 = trimmed.parse().ok()?;
    (parsed.is_finite() && parsed >= 0.0).then_some(parsed as u64)
}

/// Byte chunks in, decoded lines out.
#[derive(Debug, Default)]
pub struct EventDecoder {
    lines: LineSplitter,
    frames: FrameDecoder,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_last_event_id(last_event_id: impl Into<String>) -> Self {
        Self {
            lines: LineSplitter::new(),
            frames: FrameDecoder::with_last_event_id(last_event_id),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodedLine> {
        self.lines
            .push(chunk)
            .iter()
            .map(|line| self.frames.feed_line(line))
            .collect()
    }

    /// Flush the line splitter at end of stream. A frame left without its
    /// blank line is never dispatched.
    pub fn finish(&mut self) -> Option<DecodedLine> {
        let line = self.lines.finish()?;
        Some(self.frames.feed_line(&line))
    }

    pub fn last_event_id(&self) -> &str {
        self.frames.last_event_id()
    }

    pub fn reconnection_time(&self) -> Option<u64> {
        self.frames.reconnection_time()
    }
}
