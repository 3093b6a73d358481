//! Frame decoding and event parsing.
//!
//! `FrameDecoder` splits raw transport bytes into frames (NDJSON lines or SSE
//! events). `parse` turns one frame body into a typed `StreamEvent`. Parsing is
//! pure and never panics on malformed input.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::ParseError;
use crate::event::{MetadataMap, StreamEvent};

/// How the transport delimits frames in its byte stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Framing {
    /// One JSON document per line.
    #[default]
    Ndjson,
    /// Server-sent events; one frame per blank-line-terminated event.
    Sse,
}

/// One transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// SSE `event:` name, when the framing carries one.
    pub event: Option<String>,
    /// Frame body (joined `data:` lines for SSE, the line itself for NDJSON).
    pub data: String,
}

impl Frame {
    /// Creates a frame with no event name.
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }
}

/// Incremental decoder from byte chunks to frames.
///
/// Chunk boundaries may fall anywhere, including inside a multi-byte UTF-8
/// sequence; bytes are only decoded once a whole frame is buffered. Both
/// framings are scanned line by line, and each byte is scanned once no matter
/// how many chunks a frame is split across.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    framing: Framing,
    buf: Vec<u8>,
    // Start of the line being assembled.
    line_start: usize,
    // Everything before this offset has been searched for newlines.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            ..Self::default()
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Buffers `chunk` and returns every frame it completed.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut frame_start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let newline = self.scanned + offset;
            let line_start = std::mem::replace(&mut self.line_start, newline + 1);
            self.scanned = newline + 1;
            let frame_end = match self.framing {
                Framing::Ndjson => Some(newline),
                // A blank line ends the event; its own bytes are not part of it.
                Framing::Sse => trim_cr(&self.buf[line_start..newline])
                    .is_empty()
                    .then_some(line_start),
            };
            if let Some(frame_end) = frame_end {
                if let Some(frame) = self.decode(&self.buf[frame_start..frame_end]) {
                    frames.push(frame);
                }
                frame_start = newline + 1;
            }
        }
        self.scanned = self.buf.len();
        self.buf.drain(..frame_start);
        self.line_start -= frame_start;
        self.scanned -= frame_start;
        frames
    }

    /// Flushes whatever is left once the byte stream has ended cleanly.
    pub fn finish(&mut self) -> Option<Frame> {
        let rest = std::mem::take(&mut self.buf);
        self.line_start = 0;
        self.scanned = 0;
        self.decode(&rest)
    }

    fn decode(&self, bytes: &[u8]) -> Option<Frame> {
        match self.framing {
            Framing::Ndjson => {
                let text = String::from_utf8_lossy(bytes);
                let line = text.trim();
                (!line.is_empty()).then(|| Frame::data(line))
            }
            Framing::Sse => decode_sse_event(&String::from_utf8_lossy(bytes)),
        }
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Folds the field lines of one SSE event. Only `event` and `data` matter
/// here; comments and other fields are dropped.
fn decode_sse_event(block: &str) -> Option<Frame> {
    let mut event = None;
    let mut data: Option<String> = None;
    for line in block.lines() {
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(joined) => {
                    joined.push('\n');
                    joined.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => {}
        }
    }
    if event.is_none() && data.is_none() {
        return None;
    }
    Some(Frame {
        event,
        data: data.unwrap_or_default(),
    })
}

/// Parses one frame body into a `StreamEvent`.
///
/// Unknown `type` tags decode to a `Metadata` event keyed by the tag so newer
/// backends do not break older clients.
pub fn parse(raw_frame: &str) -> Result<StreamEvent, ParseError> {
    let trimmed = raw_frame.trim();
    if trimmed == "[DONE]" {
        return Ok(StreamEvent::Done);
    }
    let value: Value = serde_json::from_str(trimmed).map_err(|e| ParseError::Json {
        raw: raw_frame.to_string(),
        reason: e.to_string(),
    })?;
    let Value::Object(mut body) = value else {
        return Err(ParseError::Shape {
            raw: raw_frame.to_string(),
            reason: "frame is not a JSON object".into(),
        });
    };

    let shape_err = |reason: &str| ParseError::Shape {
        raw: raw_frame.to_string(),
        reason: reason.to_string(),
    };

    let Some(event_type) = body.get("type").and_then(Value::as_str).map(str::to_owned) else {
        // The backend's SSE `error` event carries `{"error": "..."}` with no tag.
        if let Some(error) = body.remove("error") {
            return Ok(StreamEvent::Error {
                message: value_to_message(error),
                recoverable: false,
            });
        }
        return Ok(StreamEvent::Metadata {
            entries: body.into_iter().collect(),
        });
    };

    match event_type.as_str() {
        "section_start" => Ok(StreamEvent::SectionStart {
            section: section_name(&body).ok_or_else(|| shape_err("section_start without section"))?,
            timestamp: timestamp(&body),
        }),
        "section_end" => Ok(StreamEvent::SectionEnd {
            section: section_name(&body).ok_or_else(|| shape_err("section_end without section"))?,
            timestamp: timestamp(&body),
        }),
        "content" => {
            let text = body
                .get("content")
                .or_else(|| body.get("text"))
                .and_then(Value::as_str)
                .ok_or_else(|| shape_err("content without text"))?
                .to_string();
            Ok(StreamEvent::Content {
                text,
                section: section_name(&body),
            })
        }
        "metadata" => {
            let entries = match body.remove("metadata") {
                Some(Value::Object(map)) => map.into_iter().collect(),
                None | Some(Value::Null) => MetadataMap::new(),
                Some(other) => MetadataMap::from([("metadata".to_string(), other)]),
            };
            Ok(StreamEvent::Metadata { entries })
        }
        "error" => {
            let message = ["message", "content", "error"]
                .iter()
                .find_map(|key| body.get(*key).filter(|v| !v.is_null()).cloned())
                .map(value_to_message)
                .unwrap_or_else(|| "generation failed".to_string());
            let recoverable = body
                .get("recoverable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(StreamEvent::Error {
                message,
                recoverable,
            })
        }
        "done" => Ok(StreamEvent::Done),
        other => Ok(StreamEvent::Metadata {
            entries: MetadataMap::from([(other.to_string(), Value::Object(body))]),
        }),
    }
}

/// Parses a decoded frame, taking the SSE event name into account.
///
/// Returns the events the frame carries, in order. Empty keepalive data
/// carries none. A named `complete` event without a `type` tag is the
/// backend's final status report: its fields become metadata, followed by
/// `Done` when the status is `completed` and a fatal `Error` otherwise.
pub fn parse_frame(frame: &Frame) -> Result<Vec<StreamEvent>, ParseError> {
    let terminal_name = matches!(frame.event.as_deref(), Some("complete" | "done"));
    if frame.data.trim().is_empty() {
        return Ok(if terminal_name {
            vec![StreamEvent::Done]
        } else {
            Vec::new()
        });
    }
    if terminal_name
        && let Ok(Value::Object(body)) = serde_json::from_str(&frame.data)
        && !body.contains_key("type")
    {
        return Ok(final_status_events(body));
    }
    parse(&frame.data).map(|event| vec![event])
}

fn final_status_events(mut body: serde_json::Map<String, Value>) -> Vec<StreamEvent> {
    let error = ["error", "error_message"]
        .iter()
        .find_map(|key| body.remove(*key).filter(|v| !v.is_null()))
        .map(value_to_message);
    // No status: an error text alone still means the generation failed.
    let status = body
        .remove("status")
        .map(value_to_message)
        .unwrap_or_else(|| (if error.is_some() { "failed" } else { "completed" }).to_string());

    let mut events = Vec::with_capacity(2);
    if !body.is_empty() {
        events.push(StreamEvent::Metadata {
            entries: body.into_iter().collect(),
        });
    }
    if status.eq_ignore_ascii_case("completed") {
        events.push(StreamEvent::Done);
    } else {
        let message = match error {
            Some(error) => format!("generation {}: {error}", status.to_ascii_lowercase()),
            None => format!("generation {}", status.to_ascii_lowercase()),
        };
        events.push(StreamEvent::Error {
            message,
            recoverable: false,
        });
    }
    events
}

fn section_name(body: &serde_json::Map<String, Value>) -> Option<String> {
    body.get("section")
        .or_else(|| body.get("section_name"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn timestamp(body: &serde_json::Map<String, Value>) -> Option<DateTime<Utc>> {
    let raw = body.get("timestamp")?.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Backend timestamps are naive UTC (`2024-05-01T10:00:00.123456`).
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn value_to_message(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
