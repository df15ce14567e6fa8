//! # copydesk-collab — Real-time collaboration core for Copydesk
//!
//! Sessions, ordered edits, presence, comment threads and approval
//! workflows for content items edited by several people at once.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)   ┌───────────────┐
//! │ Editor      │ ◄──────────────────► │ CollabServer  │
//! │ (per user)  │                      └───────┬───────┘
//! └─────────────┘                              │
//!                                      ┌───────▼───────┐
//!                                      │ CollabService │── Instrumentation
//!                                      └───────┬───────┘
//!      ┌──────────────┬───────────────┬────────┴──────┬───────────────┐
//!      ▼              ▼               ▼               ▼               ▼
//! SessionRegistry PresenceTracker EditBroker    CommentManager  WorkflowEngine
//!      │              │               │               │               │
//!      └──────────────┴───────┬───────┴───────────────┴───────────────┘
//!                             ▼
//!              ChannelMap (one locked channel per content item)
//!                             │
//!                 BroadcastHub (fan-out per channel)
//! ```
//!
//! ## Modules
//!
//! - [`session`] — session registry, undo/redo buffers
//! - [`presence`] — who is on a content item and where their cursor is
//! - [`oplog`] / [`transform`] / [`broker`] — ordered edits and conflicts
//! - [`broadcast`] — per-channel fan-out over per-session queues
//! - [`comments`] — comment threads
//! - [`workflow`] — approval workflows
//! - [`sweeper`] — idle session expiry
//! - [`storage`] — persistence (memory or RocksDB)
//! - [`server`] — WebSocket endpoint

pub mod broadcast;
pub mod broker;
pub mod channel;
pub mod collaborators;
pub mod comments;
pub mod config;
pub mod error;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
pub mod storage;
pub mod sweeper;
pub mod transform;
pub mod workflow;

// Re-exports for convenience
pub use broadcast::{BroadcastHub, BroadcastStats, Connection};
pub use broker::{ConflictResolution, ConflictResolutionRequest, EditOutcome, ResolutionStrategy};
pub use collaborators::{
    AllowAll, AssumeReady, ContentFetcher, ContentSummary, Instrumentation, LogInstrumentation,
    PermissionResolver, PermissionTable, RecordingInstrumentation, SpanRecord, StaticContent,
};
pub use comments::{Comment, CommentDraft, CommentFilter, CommentKind, CommentPage, CommentStatus};
pub use config::{CollabConfig, TransformMode};
pub use error::{CollabError, CollabResult};
pub use oplog::{Conflict, EditPayload, EditRequest, Operation, OperationKind};
pub use presence::PresenceEntry;
pub use protocol::{ClientMessage, Envelope, LeaveReason, ProtocolError, ServerEvent};
pub use server::{CollabServer, ServerStats};
pub use service::{CollabService, CollabServiceBuilder};
pub use session::{Permissions, SelectionRange, SessionInfo, SessionSnapshot, StartOptions};
pub use storage::{CollabStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use sweeper::{SessionSweeper, SweepReport, SweeperHandle};
pub use workflow::{
    Decision, DecisionAction, WorkflowInstance, WorkflowKind, WorkflowOptions, WorkflowStatus,
};

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
