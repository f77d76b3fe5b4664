//! Decoding of the OpenCode `/event` feed.
//!
//! The feed is `text/event-stream`: each event is one or more `data:` lines
//! terminated by a blank line. [`SseDecoder`] reassembles those frames from
//! arbitrary byte chunks and [`decode_event`] turns a frame payload into a
//! [`RelayEvent`].

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

const SYSTEM_EVENT_TYPES: [&str; 8] = [
    "server.connected",
    "server.heartbeat",
    "session.created",
    "session.updated",
    "session.status",
    "session.idle",
    "session.diff",
    "session.error",
];

const GENERATOR_ROLE: &str = "assistant";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid event json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("`{event_type}` event is missing `{field}`")]
    MissingField {
        event_type: &'static str,
        field: &'static str,
    },
}

/// Typed view of one upstream event.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    PartUpdated(PartSnapshot),
    PartDelta(PartDelta),
    MessageUpdated(MessageInfo),
    /// Known bookkeeping events that carry nothing for the relay.
    System(String),
    Unknown(String),
}

impl RelayEvent {
    /// Conversation the event belongs to, if it names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::PartUpdated(part) => Some(&part.session_id),
            Self::PartDelta(delta) => Some(&delta.session_id),
            Self::MessageUpdated(info) => Some(&info.session_id),
            Self::System(_) | Self::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartSnapshot {
    pub session_id: String,
    pub message_id: String,
    pub part_id: String,
    pub kind: PartKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartKind {
    Text,
    Reasoning,
    StepStart,
    StepFinish,
    ToolRunning { tool: Option<String> },
    ToolFinished,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartDelta {
    pub session_id: String,
    pub message_id: String,
    pub part_id: String,
    pub field: String,
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageInfo {
    pub session_id: String,
    pub message_id: String,
    pub role: String,
    pub finish: Option<String>,
}

impl MessageInfo {
    /// True when the generator finished producing this message.
    pub fn is_completed(&self) -> bool {
        self.role == GENERATOR_ROLE && self.finish.as_deref().is_some_and(|f| !f.is_empty())
    }
}

/// Longest line or frame payload the decoder buffers before giving up on
/// the frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Reassembles `data:` frames from a chunked byte stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
    data_bytes: usize,
    /// Drop bytes until the next newline.
    skip_line: bool,
    /// Drop lines until the blank line that ends the current frame.
    skip_frame: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the payloads of every frame it completed.
    ///
    /// A line or frame larger than [`MAX_FRAME_BYTES`] is dropped whole and
    /// decoding resumes at the next frame boundary.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.skip_line {
                self.skip_line = false;
                continue;
            }
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            if raw.is_empty() {
                if !self.skip_frame && !self.data_lines.is_empty() {
                    payloads.push(self.data_lines.join("\n"));
                }
                self.reset_frame();
                continue;
            }
            if self.skip_frame {
                continue;
            }
            let line = String::from_utf8_lossy(&raw);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                self.data_bytes += data.len();
                if self.data_bytes > MAX_FRAME_BYTES {
                    self.drop_frame(self.data_bytes);
                    continue;
                }
                self.data_lines.push(data.to_string());
            }
        }
        if self.buffer.len() > MAX_FRAME_BYTES {
            let pending = self.buffer.len();
            self.buffer.clear();
            self.skip_line = true;
            self.drop_frame(pending);
        }
        payloads
    }

    fn drop_frame(&mut self, bytes: usize) {
        tracing::warn!(bytes, limit = MAX_FRAME_BYTES, "event frame too large; dropping it");
        self.data_lines.clear();
        self.data_bytes = 0;
        self.skip_frame = true;
    }

    fn reset_frame(&mut self) {
        self.data_lines.clear();
        self.data_bytes = 0;
        self.skip_frame = false;
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    properties: Value,
}

#[derive(Debug, Deserialize)]
struct PartUpdatedProperties {
    part: RawPart,
}

#[derive(Debug, Deserialize)]
struct RawPart {
    #[serde(default)]
    id: String,
    #[serde(rename = "sessionID", default)]
    session_id: String,
    #[serde(rename = "messageID", default)]
    message_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    state: Option<RawToolState>,
}

#[derive(Debug, Deserialize)]
struct RawToolState {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RawDelta {
    #[serde(rename = "sessionID", default)]
    session_id: String,
    #[serde(rename = "messageID", default)]
    message_id: String,
    #[serde(rename = "partID", default)]
    part_id: String,
    #[serde(default)]
    field: String,
    #[serde(default)]
    delta: String,
}

#[derive(Debug, Deserialize)]
struct MessageUpdatedProperties {
    info: RawMessageInfo,
}

#[derive(Debug, Deserialize)]
struct RawMessageInfo {
    #[serde(default)]
    id: String,
    #[serde(rename = "sessionID", default)]
    session_id: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    finish: Option<String>,
}

/// Parses one frame payload.
pub fn decode_event(payload: &str) -> Result<RelayEvent, CodecError> {
    let envelope: Envelope = serde_json::from_str(payload)?;
    match envelope.event_type.as_str() {
        "message.part.updated" => {
            let props: PartUpdatedProperties = serde_json::from_value(envelope.properties)?;
            let part = props.part;
            require("message.part.updated", "part.sessionID", &part.session_id)?;
            Ok(RelayEvent::PartUpdated(PartSnapshot {
                kind: part_kind(&part),
                session_id: part.session_id,
                message_id: part.message_id,
                part_id: part.id,
                text: part.text.unwrap_or_default(),
            }))
        }
        "message.part.delta" => {
            let delta: RawDelta = serde_json::from_value(envelope.properties)?;
            require("message.part.delta", "sessionID", &delta.session_id)?;
            require("message.part.delta", "partID", &delta.part_id)?;
            Ok(RelayEvent::PartDelta(PartDelta {
                session_id: delta.session_id,
                message_id: delta.message_id,
                part_id: delta.part_id,
                field: delta.field,
                delta: delta.delta,
            }))
        }
        "message.updated" => {
            let props: MessageUpdatedProperties = serde_json::from_value(envelope.properties)?;
            let info = props.info;
            require("message.updated", "info.sessionID", &info.session_id)?;
            Ok(RelayEvent::MessageUpdated(MessageInfo {
                session_id: info.session_id,
                message_id: info.id,
                role: info.role,
                finish: info.finish,
            }))
        }
        other if SYSTEM_EVENT_TYPES.contains(&other) => Ok(RelayEvent::System(envelope.event_type)),
        _ => Ok(RelayEvent::Unknown(envelope.event_type)),
    }
}

fn require(event_type: &'static str, field: &'static str, value: &str) -> Result<(), CodecError> {
    if value.is_empty() {
        return Err(CodecError::MissingField { event_type, field });
    }
    Ok(())
}

fn part_kind(part: &RawPart) -> PartKind {
    match part.kind.as_str() {
        "text" => PartKind::Text,
        "reasoning" => PartKind::Reasoning,
        "step-start" => PartKind::StepStart,
        "step-finish" => PartKind::StepFinish,
        "tool-invocation" | "tool-call" => PartKind::ToolRunning { tool: None },
        "tool-result" => PartKind::ToolFinished,
        "tool" => {
            let status = part.state.as_ref().map(|state| state.status.as_str());
            match status {
                Some("completed") | Some("error") => PartKind::ToolFinished,
                _ => PartKind::ToolRunning {
                    tool: part.tool.clone().filter(|name| !name.is_empty()),
                },
            }
        }
        other => PartKind::Other(other.to_string()),
    }
}
