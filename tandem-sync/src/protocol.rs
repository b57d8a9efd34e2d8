//! JSON wire protocol for canvas synchronization.
//!
//! Every WebSocket text frame carries one JSON object tagged by `"type"`:
//! ```text
//! { "type": "operation", "operation": { "id": "…", "kind": "brush", … } }
//! { "type": "undo", "operationId": "…" }
//! { "type": "init", "participantId": "…", "operations": [ … ], "participants": [ … ] }
//! ```
//!
//! Client → server traffic is [`ClientMessage`], server → client traffic is
//! [`ServerMessage`]. Both are closed enums, so every handler matches
//! exhaustively.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Room used when a client connects without naming one.
pub const DEFAULT_ROOM: &str = "default";

/// Room identifier (the WebSocket request path).
pub type RoomId = String;

/// Client-generated operation identifier.
///
/// Time-based with a short random salt. Effectively unique, but neither
/// collision-free across clients nor monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<millis>-<8 hex chars>`.
    pub fn generate(now_ms: u64) -> Self {
        let salt = Uuid::new_v4().simple().to_string();
        Self(format!("{now_ms}-{}", &salt[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Connection-scoped participant identifier, assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Canvas-local coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Stroke tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrokeKind {
    #[default]
    Brush,
    Eraser,
}

/// One committed drawing action: the unit of undo and redo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    pub kind: StrokeKind,
    /// Ignored for erasers.
    #[serde(default)]
    pub color: String,
    pub stroke_width: f64,
    pub points: Vec<Point>,
    /// Client clock, milliseconds since the Unix epoch.
    #[serde(default)]
    pub created_at: u64,
    /// Stamped by the server with the sender's id on receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<ParticipantId>,
}

impl Operation {
    /// A brush stroke with a fresh id and the current time.
    pub fn brush(color: impl Into<String>, stroke_width: f64, points: Vec<Point>) -> Self {
        let now = unix_millis();
        Self {
            id: OperationId::generate(now),
            kind: StrokeKind::Brush,
            color: color.into(),
            stroke_width,
            points,
            created_at: now,
            author_id: None,
        }
    }

    /// An eraser stroke with a fresh id and the current time.
    pub fn eraser(stroke_width: f64, points: Vec<Point>) -> Self {
        let mut op = Self::brush(String::new(), stroke_width, points);
        op.kind = StrokeKind::Eraser;
        op
    }

    /// Reject payloads that must never reach the shared log.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let reason = if self.id.as_str().is_empty() {
            Some("empty id")
        } else if self.points.is_empty() {
            Some("no points")
        } else if !self.stroke_width.is_finite() || self.stroke_width <= 0.0 {
            Some("stroke width must be positive")
        } else if self.points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            Some("non-finite point")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ProtocolError::InvalidOperation {
                id: self.id.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// A connected session as the rest of the room sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub color: String,
    pub display_name: String,
}

/// A batch of in-progress stroke points. Relayed, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeSegment {
    pub points: Vec<Point>,
    #[serde(default)]
    pub color: String,
    pub width: f64,
    #[serde(default)]
    pub kind: StrokeKind,
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Live stroke points (ephemeral).
    Draw(StrokeSegment),
    /// A completed stroke to commit.
    Operation { operation: Operation },
    /// Remove an operation from the log by id.
    Undo { operation_id: OperationId },
    /// Re-append a previously undone operation.
    Redo { operation: Operation },
    /// Empty the room's log.
    Clear {},
    /// Pointer position (ephemeral, rate-limited by the sender).
    Cursor {
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
    /// Latency probe; the server echoes the timestamp.
    Ping { timestamp: u64 },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire event name, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Draw(_) => "draw",
            Self::Operation { .. } => "operation",
            Self::Undo { .. } => "undo",
            Self::Redo { .. } => "redo",
            Self::Clear {} => "clear",
            Self::Cursor { .. } => "cursor",
            Self::Ping { .. } => "ping",
        }
    }
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full room state for a newly (re)joined participant.
    Init {
        participant_id: ParticipantId,
        operations: Vec<Operation>,
        participants: Vec<Participant>,
    },
    UserJoined(Participant),
    UserLeft { participant_id: ParticipantId },
    Draw {
        author_id: ParticipantId,
        #[serde(flatten)]
        segment: StrokeSegment,
    },
    Operation {
        operation: Operation,
        author_id: ParticipantId,
    },
    Undo { operation_id: OperationId },
    Redo { operation: Operation },
    Clear {},
    Cursor {
        participant_id: ParticipantId,
        x: f64,
        y: f64,
        color: String,
    },
    Pong { timestamp: u64 },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire event name, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::UserJoined(_) => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::Draw { .. } => "draw",
            Self::Operation { .. } => "operation",
            Self::Undo { .. } => "undo",
            Self::Redo { .. } => "redo",
            Self::Clear {} => "clear",
            Self::Cursor { .. } => "cursor",
            Self::Pong { .. } => "pong",
        }
    }
}

/// Protocol errors. Any of these closes the offending connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid operation {id}: {reason}")]
    InvalidOperation {
        id: OperationId,
        reason: &'static str,
    },
    #[error("unexpected binary frame ({0} bytes)")]
    UnexpectedBinary(usize),
}

/// Milliseconds since the Unix epoch (0 if the clock is before it).
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
