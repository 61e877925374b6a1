use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event type a consumer should assume when a frame carries no `event` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Errors raised when an event cannot be written as a single frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A single-line field contains a line break
    #[error("The `{field}` field must not contain line breaks")]
    NewlineInField { field: &'static str },
}

/// One Server-Sent Event.
///
/// Every field is optional. `data` may span several lines, `retry` is a
/// reconnection delay in milliseconds and `comment` is a heartbeat line that
/// consumers never see as an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for an event carrying only a data payload
    pub fn message(data: impl Into<String>) -> Self {
        Self::new().with_data(data)
    }

    /// Shorthand for a comment-only heartbeat
    pub fn comment(comment: impl Into<String>) -> Self {
        Self {
            comment: Some(comment.into()),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Effective event type, `"message"` when none was set
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT_TYPE)
    }

    /// True when no field is set; such an event encodes to an empty frame
    pub fn is_empty(&self) -> bool {
        self.data.is_none()
            && self.event.is_none()
            && self.id.is_none()
            && self.retry.is_none()
            && self.comment.is_none()
    }

    /// True when the event is a pure heartbeat (a comment and nothing else)
    pub fn is_comment_only(&self) -> bool {
        self.comment.is_some()
            && self.data.is_none()
            && self.event.is_none()
            && self.id.is_none()
            && self.retry.is_none()
    }

    /// Check that the single-line fields can be written without breaking the frame.
    ///
    /// `data` is exempt: it is split into one `data:` line per input line.
    pub fn validate(&self) -> Result<(), CodecError> {
        let single_line = [
            ("comment", self.comment.as_deref()),
            ("event", self.event.as_deref()),
            ("id", self.id.as_deref()),
        ];
        for (field, value) in single_line {
            if value.is_some_and(|v| v.contains(['\r', '\n'])) {
                return Err(CodecError::NewlineInField { field });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_event() {
        assert!(Event::new().is_empty());
        assert!(!Event::message("x").is_empty());
        assert!(!Event::new().with_retry(0).is_empty());
    }

    #[test]
    fn test_comment_only() {
        assert!(Event::comment("keep-alive").is_comment_only());
        assert!(!Event::comment("hi").with_data("x").is_comment_only());
    }

    #[test]
    fn test_default_event_type() {
        assert_eq!(Event::message("x").event_type(), "message");
        assert_eq!(Event::message("x").with_event("tick").event_type(), "tick");
    }

    #[test]
    fn test_validate_rejects_newlines() {
        let err = Event::message("ok").with_id("1\n2").validate().unwrap_err();
        assert_eq!(err, CodecError::NewlineInField { field: "id" });

        let err = Event::comment("a\rb").validate().unwrap_err();
        assert_eq!(err, CodecError::NewlineInField { field: "comment" });

        assert!(Event::message("multi\nline").validate().is_ok());
    }

    #[test]
    fn test_serde_skips_unset_fields() {
        let json = serde_json::to_string(&Event::message("x").with_id("7")).unwrap();
        assert_eq!(json, r#"{"data":"x","id":"7"}"#);

        let parsed: Event = serde_json::from_str(r#"{"event":"tick","retry":10}"#).unwrap();
        assert_eq!(parsed, Event::new().with_event("tick").with_retry(10));
    }
}
