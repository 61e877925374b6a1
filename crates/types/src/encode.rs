//! Event to frame serialization.

use bytes::Bytes;

use crate::event::Event;

/// Serialize one event into one SSE frame.
///
/// Field order is fixed: comment, event, data lines, id, retry. The frame
/// ends with a blank line. The caller is expected to have run
/// [`Event::validate`] first; `data` is always split on `\r\n`, `\r` or `\n`.
pub fn encode(event: &Event) -> Bytes {
    let mut lines: Vec<String> = Vec::new();

    if let Some(comment) = &event.comment {
        lines.push(format!(":{comment}"));
    }
    if let Some(name) = &event.event {
        lines.push(format!("event:{name}"));
    }
    if let Some(data) = &event.data {
        lines.extend(split_lines(data).map(|line| format!("data:{line}")));
    }
    if let Some(id) = &event.id {
        lines.push(format!("id:{id}"));
    }
    if let Some(retry) = event.retry {
        lines.push(format!("retry:{retry}"));
    }

    let mut frame = lines.join("\n");
    frame.push_str("\n\n");
    Bytes::from(frame)
}

/// Serialize a heartbeat comment frame
pub fn encode_comment(comment: &str) -> Bytes {
    encode(&Event::comment(comment))
}

/// Split on any of `\r\n`, `\r` or `\n`, keeping empty lines.
fn split_lines(value: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(value);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.find(['\r', '\n']) {
            Some(pos) => {
                let skip = if current[pos..].starts_with("\r\n") { 2 } else { 1 };
                rest = Some(&current[pos + skip..]);
                Some(&current[..pos])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}
