//! Wire format of the copilot stream.
//!
//! A response body is a sequence of JSON objects, one per line. Each object
//! carries exactly one of the `status`, `context`, `draft` or
//! `proposedActions` members, plus an optional `seq` that ties the frame to
//! the request that produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const FRAME_DELIMITER: u8 = b'\n';

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamStatus {
    StreamStart,
    StreamEnd,
    StreamError,
}

/// A recent item belonging to the caller, sent so the client can show what
/// the assistant looked at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An operation the assistant suggests. Never executed without the user
/// confirming it through the actions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub action: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamFrame {
    Status {
        status: StreamStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Context {
        context: Vec<ContextRecord>,
    },
    /// Cumulative assistant text; replaces any earlier draft.
    Draft {
        draft: String,
    },
    ProposedActions {
        #[serde(rename = "proposedActions")]
        proposed_actions: Vec<ProposedAction>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Status,
    Context,
    Draft,
    ProposedActions,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Status => write!(f, "status"),
            FrameKind::Context => write!(f, "context"),
            FrameKind::Draft => write!(f, "draft"),
            FrameKind::ProposedActions => write!(f, "proposed_actions"),
        }
    }
}

impl StreamFrame {
    pub fn start() -> Self {
        StreamFrame::Status {
            status: StreamStatus::StreamStart,
            reason: None,
        }
    }

    pub fn end() -> Self {
        StreamFrame::Status {
            status: StreamStatus::StreamEnd,
            reason: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        StreamFrame::Status {
            status: StreamStatus::StreamError,
            reason: Some(reason.into()),
        }
    }

    pub fn context(records: Vec<ContextRecord>) -> Self {
        StreamFrame::Context { context: records }
    }

    pub fn draft(text: impl Into<String>) -> Self {
        StreamFrame::Draft { draft: text.into() }
    }

    pub fn proposed_actions(actions: Vec<ProposedAction>) -> Self {
        StreamFrame::ProposedActions {
            proposed_actions: actions,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            StreamFrame::Status { .. } => FrameKind::Status,
            StreamFrame::Context { .. } => FrameKind::Context,
            StreamFrame::Draft { .. } => FrameKind::Draft,
            StreamFrame::ProposedActions { .. } => FrameKind::ProposedActions,
        }
    }

    /// True for `stream-end` and `stream-error`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamFrame::Status {
                status: StreamStatus::StreamEnd | StreamStatus::StreamError,
                ..
            }
        )
    }
}

/// A frame as it travels on the wire, tagged with the request sequence
/// number when the client supplied one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub frame: StreamFrame,
}

impl FrameEnvelope {
    pub fn new(frame: StreamFrame) -> Self {
        Self { seq: None, frame }
    }

    pub fn with_seq(mut self, seq: Option<u64>) -> Self {
        self.seq = seq;
        self
    }
}

impl From<StreamFrame> for FrameEnvelope {
    fn from(frame: StreamFrame) -> Self {
        FrameEnvelope::new(frame)
    }
}

/// Serializes a frame followed by the line delimiter. serde_json escapes
/// control characters inside strings, so the output never contains a bare
/// newline before the delimiter.
pub fn encode_frame(envelope: &FrameEnvelope) -> Result<Vec<u8>, FrameError> {
    let mut line = serde_json::to_vec(envelope).map_err(FrameError::Encode)?;
    line.push(FRAME_DELIMITER);
    Ok(line)
}

pub fn decode_frame(line: &str) -> Result<FrameEnvelope, FrameError> {
    serde_json::from_str(line.trim()).map_err(FrameError::Decode)
}
