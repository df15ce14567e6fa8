//! JSON wire protocol spoken over each session's duplex connection.
//!
//! Every frame is a JSON object tagged by `type`:
//! ```text
//! client → server   {"type": "join_session" | "edit_operation" | "cursor_update"
//!                            | "resolve_conflicts" | "leave_session" | "heartbeat", ...}
//! server → client   {"type": "<event>", ...payload, "timestamp": <unix ms>}
//! ```
//!
//! Inbound frames are dispatched on the closed [`ClientMessage`] enum;
//! a frame whose `type` is not one of its variants is reported back by name.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::broker::{ConflictResolution, ConflictResolutionRequest};
use crate::comments::Comment;
use crate::error::CollabError;
use crate::now_millis;
use crate::oplog::{Conflict, EditRequest, Operation};
use crate::session::{SelectionRange, SessionSnapshot};
use crate::workflow::{DecisionRecord, WorkflowSummary};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("connection closed")]
    ConnectionClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Rejoin `session_id`, or start a session on `content_id`.
    JoinSession {
        #[serde(default)]
        session_id: Option<Uuid>,
        #[serde(default)]
        content_id: Option<String>,
        user_id: String,
        #[serde(default)]
        force_new: bool,
    },
    EditOperation {
        operation: EditRequest,
    },
    CursorUpdate {
        cursor: usize,
        #[serde(default)]
        selection: Option<SelectionRange>,
    },
    ResolveConflicts {
        conflicts: Vec<ConflictResolutionRequest>,
    },
    LeaveSession,
    Heartbeat,
}

impl ClientMessage {
    const KINDS: &'static [&'static str] = &[
        "join_session",
        "edit_operation",
        "cursor_update",
        "resolve_conflicts",
        "leave_session",
        "heartbeat",
    ];

    /// Parse an inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtocolError::Malformed("missing 'type' field".into()))?;
        if !Self::KINDS.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinSession { .. } => "join_session",
            Self::EditOperation { .. } => "edit_operation",
            Self::CursorUpdate { .. } => "cursor_update",
            Self::ResolveConflicts { .. } => "resolve_conflicts",
            Self::LeaveSession => "leave_session",
            Self::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Left,
    Expired,
}

/// Events the server pushes to sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    UserJoined {
        session_id: Uuid,
        user_id: String,
        content_id: String,
    },
    UserReconnected {
        session_id: Uuid,
        user_id: String,
        content_id: String,
    },
    UserLeft {
        session_id: Uuid,
        user_id: String,
        reason: LeaveReason,
    },
    EditOperation {
        operation: Operation,
    },
    /// Reply to the originator of an edit
    EditAck {
        operation_id: u64,
        applied: bool,
        conflicts: Vec<Conflict>,
    },
    CursorUpdate {
        session_id: Uuid,
        user_id: String,
        cursor: usize,
        selection: Option<SelectionRange>,
    },
    CommentAdded {
        comment: Comment,
    },
    CommentResolved {
        comment: Comment,
    },
    WorkflowUpdated {
        workflow: WorkflowSummary,
        decision: Option<DecisionRecord>,
    },
    ConflictsResolved {
        session_id: Uuid,
        user_id: String,
        resolutions: Vec<ConflictResolution>,
    },
    /// Reply to a join: the session and everything needed to catch up
    SessionState {
        snapshot: SessionSnapshot,
    },
    HeartbeatAck {
        head_sequence: u64,
    },
    Error {
        code: String,
        message: String,
    },
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    #[serde(flatten)]
    event: &'a ServerEvent,
    timestamp: u64,
}

/// A decoded outbound frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: ServerEvent,
    pub timestamp: u64,
}

impl ServerEvent {
    pub fn from_error(err: &CollabError) -> Self {
        Self::Error {
            code: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    /// Encode with the envelope timestamp.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let envelope = OutboundEnvelope {
            event: self,
            timestamp: now_millis(),
        };
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "user_joined",
            Self::UserReconnected { .. } => "user_reconnected",
            Self::UserLeft { .. } => "user_left",
            Self::EditOperation { .. } => "edit_operation",
            Self::EditAck { .. } => "edit_ack",
            Self::CursorUpdate { .. } => "cursor_update",
            Self::CommentAdded { .. } => "comment_added",
            Self::CommentResolved { .. } => "comment_resolved",
            Self::WorkflowUpdated { .. } => "workflow_updated",
            Self::ConflictsResolved { .. } => "conflicts_resolved",
            Self::SessionState { .. } => "session_state",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
            Self::Error { .. } => "error",
        }
    }
}
