//! Operation broker: validates, sequences, transforms and fans out edits.
//!
//! ```text
//! EditRequest ─► validate ─► lock channel ─► transform vs. others since base
//!                                   │
//!                                   ▼
//!                       log.append(seq = head + 1)
//!                                   │
//!                    ┌──────────────┴──────────────┐
//!                    ▼                             ▼
//!           update sender state          deliver edit_operation
//!           (ack, cursor, undo)           to every other session
//! ```
//!
//! Sequence allocation, append and delivery all happen under the channel's
//! write lock, so two edits on the same content item can never interleave.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::broadcast::BroadcastHub;
use crate::channel::ChannelMap;
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::now_millis;
use crate::oplog::{Conflict, EditRequest, Operation, OperationKind};
use crate::protocol::ServerEvent;
use crate::storage::CollabStore;
use crate::transform::Transform;

/// Result of submitting one edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOutcome {
    /// Sequence number assigned to the operation
    pub operation_id: u64,
    /// False when the transform reduced the edit to nothing
    pub applied: bool,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the submitting session's version
    #[default]
    AcceptMine,
    /// Defer to the concurrent operation
    AcceptTheirs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolutionRequest {
    pub conflict_id: Uuid,
    #[serde(default)]
    pub strategy: Option<ResolutionStrategy>,
}

impl ConflictResolutionRequest {
    pub fn accept_mine(conflict_id: Uuid) -> Self {
        Self {
            conflict_id,
            strategy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict_id: Uuid,
    /// Sequence of the operation that carries the conflict marker
    pub sequence: u64,
    pub strategy: ResolutionStrategy,
    pub session_id: Uuid,
    pub user_id: String,
    pub resolved_at: u64,
}

pub struct EditBroker {
    config: Arc<CollabConfig>,
    channels: Arc<ChannelMap>,
    hub: Arc<BroadcastHub>,
    store: Arc<dyn CollabStore>,
    transform: Arc<dyn Transform>,
}

impl EditBroker {
    pub fn new(
        config: Arc<CollabConfig>,
        channels: Arc<ChannelMap>,
        hub: Arc<BroadcastHub>,
        store: Arc<dyn CollabStore>,
        transform: Arc<dyn Transform>,
    ) -> Self {
        Self {
            config,
            channels,
            hub,
            store,
            transform,
        }
    }

    pub async fn broadcast_edit(
        &self,
        content_id: &str,
        session_id: Uuid,
        request: EditRequest,
    ) -> CollabResult<EditOutcome> {
        let kind: OperationKind = request.kind.parse()?;
        let payload = request.payload.ok_or_else(|| {
            CollabError::InvalidOperation(format!("{} operation has no payload", kind.as_str()))
        })?;
        payload.validate(kind)?;

        let mut channel = self.channels.write(content_id).await;
        let (user_id, base) = {
            let session = channel
                .sessions
                .get(&session_id)
                .ok_or_else(|| CollabError::not_found("session", session_id))?;
            if !session.permissions.write {
                return Err(CollabError::Forbidden(format!(
                    "user {} cannot edit content {content_id}",
                    session.user_id
                )));
            }
            (
                session.user_id.clone(),
                request.base_sequence.unwrap_or(session.last_ack),
            )
        };

        let concurrent: Vec<&Operation> = channel
            .log
            .since(base)
            .filter(|op| op.session_id != session_id)
            .collect();
        let outcome = self.transform.transform(kind, &payload, &concurrent);

        // A replace whose range was deleted away still inserts its text.
        let applied = match kind {
            OperationKind::Insert => true,
            OperationKind::Replace => {
                outcome.payload.length > 0 || outcome.payload.inserted_len() > 0
            }
            _ => outcome.payload.length > 0,
        };
        let transformed = (outcome.payload != payload).then_some(outcome.payload);
        let conflicts = outcome.conflicts;
        let now = now_millis();

        let operation = channel
            .log
            .append(|sequence| Operation {
                sequence,
                content_id: content_id.to_string(),
                session_id,
                user_id: user_id.clone(),
                kind,
                payload,
                transformed,
                timestamp: now,
                conflicts: conflicts.clone(),
            })
            .clone();
        let sequence = operation.sequence;
        log::debug!("Appended {} edit {sequence} to {content_id} from session {session_id}", kind.as_str());

        if !conflicts.is_empty() {
            log::info!(
                "Edit {sequence} on {content_id} by {user_id} carries {} unresolved conflict(s)",
                conflicts.len()
            );
        }

        let record = match channel.sessions.get_mut(&session_id) {
            Some(session) => {
                session.touch(now);
                session.last_ack = sequence;
                session.history.record(sequence);
                if let Some(cursor) = request.cursor {
                    session.cursor = cursor;
                }
                if request.selection.is_some() {
                    session.selection = request.selection;
                }
                Some(session.to_record(self.config.session_timeout.as_millis() as u64))
            }
            None => None,
        };
        // The operation is committed; a failed session write only loses
        // cursor/undo state on restart.
        if let Some(record) = record {
            match record {
                Ok(record) => {
                    if let Err(e) = self.store.put_session(&record).await {
                        log::warn!("Failed to persist session {session_id} after edit {sequence}: {e}");
                    }
                }
                Err(e) => log::warn!("Failed to encode session {session_id}: {e}"),
            }
        }

        let event = ServerEvent::EditOperation { operation };
        self.hub.deliver(&mut channel.sessions, &event, Some(session_id));

        Ok(EditOutcome {
            operation_id: sequence,
            applied,
            conflicts,
        })
    }

    /// Record how the submitting session settles conflicts on its own edits.
    pub async fn resolve_conflicts(
        &self,
        content_id: &str,
        session_id: Uuid,
        requests: Vec<ConflictResolutionRequest>,
    ) -> CollabResult<Vec<ConflictResolution>> {
        if requests.is_empty() {
            return Err(CollabError::Validation("no conflicts to resolve".into()));
        }

        let mut channel = self.channels.write(content_id).await;
        let user_id = channel
            .sessions
            .get(&session_id)
            .map(|s| s.user_id.clone())
            .ok_or_else(|| CollabError::not_found("session", session_id))?;

        let now = now_millis();
        let mut resolutions = Vec::with_capacity(requests.len());
        for request in &requests {
            let owner = channel
                .log
                .since(0)
                .find(|op| op.conflicts.iter().any(|c| c.id == request.conflict_id))
                .ok_or_else(|| CollabError::not_found("conflict", request.conflict_id))?;
            if owner.user_id != user_id {
                return Err(CollabError::Forbidden(format!(
                    "conflict {} belongs to an edit by {}",
                    request.conflict_id, owner.user_id
                )));
            }
            resolutions.push(ConflictResolution {
                conflict_id: request.conflict_id,
                sequence: owner.sequence,
                strategy: request.strategy.unwrap_or_default(),
                session_id,
                user_id: user_id.clone(),
                resolved_at: now,
            });
        }

        for resolution in &resolutions {
            channel
                .resolutions
                .insert(resolution.conflict_id, resolution.clone());
        }

        log::debug!(
            "Session {session_id} resolved {} conflict(s) on {content_id}",
            resolutions.len()
        );

        let event = ServerEvent::ConflictsResolved {
            session_id,
            user_id,
            resolutions: resolutions.clone(),
        };
        self.hub.deliver(&mut channel.sessions, &event, Some(session_id));

        Ok(resolutions)
    }

    /// Retained operations after `since`, oldest first.
    pub async fn operations_since(&self, content_id: &str, since: u64) -> Vec<Operation> {
        match self.channels.read(content_id).await {
            Some(channel) => channel.log.since(since).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn transform_name(&self) -> &'static str {
        self.transform.name()
    }
}
