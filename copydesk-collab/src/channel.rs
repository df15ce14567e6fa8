//! Per-content-item channels.
//!
//! Every piece of mutable collaboration state (sessions, operation log,
//! comment thread, workflow) lives in the [`ChannelState`] of the content
//! item it belongs to. A channel is guarded by its own `RwLock`:
//!
//! ```text
//! ChannelMap ── content "c1" ── RwLock<ChannelState> ── sessions / log / comments / workflow
//!            ├─ content "c2" ── RwLock<ChannelState> ── ...
//!            └─ content "c3" ── ...
//! ```
//!
//! Mutations on one channel hold its write lock, so sequence allocation and
//! fan-out are serialized per content item while independent channels
//! proceed in parallel. Queries take the read lock and see a consistent
//! snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

use crate::broker::ConflictResolution;
use crate::comments::CommentThread;
use crate::oplog::OperationLog;
use crate::session::Session;
use crate::workflow::WorkflowInstance;

pub type ChannelWriteGuard = OwnedRwLockWriteGuard<ChannelState>;
pub type ChannelReadGuard = OwnedRwLockReadGuard<ChannelState>;

/// All state scoped to one content item.
#[derive(Debug)]
pub struct ChannelState {
    pub content_id: String,
    pub sessions: HashMap<Uuid, Session>,
    pub log: OperationLog,
    pub comments: CommentThread,
    /// Resolutions recorded against conflict markers in `log`
    pub resolutions: HashMap<Uuid, ConflictResolution>,
    /// The single active workflow instance, if any
    pub workflow: Option<WorkflowInstance>,
    /// Completed or cancelled instances, oldest first
    pub retired_workflows: Vec<WorkflowInstance>,
    /// Whether persisted workflows were loaded into this channel
    pub workflows_loaded: bool,
    /// Set when the channel was evicted from the map
    retired: bool,
}

impl ChannelState {
    fn new(content_id: &str, history_cap: usize) -> Self {
        Self {
            content_id: content_id.to_string(),
            sessions: HashMap::new(),
            log: OperationLog::new(history_cap),
            comments: CommentThread::default(),
            resolutions: HashMap::new(),
            workflow: None,
            retired_workflows: Vec::new(),
            workflows_loaded: false,
            retired: false,
        }
    }

    /// Nothing in this channel lives only in memory.
    ///
    /// Comments and workflows are persisted and reload lazily, so an idle
    /// channel is one with no sessions, no operations, and no active workflow.
    pub fn is_idle(&self) -> bool {
        self.sessions.is_empty() && self.log.is_empty() && self.workflow.is_none()
    }

    /// The session `user_id` holds on this channel, if any.
    pub fn session_of_user(&self, user_id: &str) -> Option<Uuid> {
        self.sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| s.last_activity)
            .map(|s| s.id)
    }
}

/// Sharded map of channels keyed by content id.
pub struct ChannelMap {
    channels: RwLock<HashMap<String, Arc<RwLock<ChannelState>>>>,
    history_cap: usize,
}

impl ChannelMap {
    pub fn new(history_cap: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            history_cap,
        }
    }

    async fn get(&self, content_id: &str) -> Option<Arc<RwLock<ChannelState>>> {
        self.channels.read().await.get(content_id).cloned()
    }

    async fn get_or_create(&self, content_id: &str) -> Arc<RwLock<ChannelState>> {
        if let Some(channel) = self.get(content_id).await {
            return channel;
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(content_id.to_string())
            .or_insert_with(|| {
                log::debug!("Opening channel for content {content_id}");
                Arc::new(RwLock::new(ChannelState::new(content_id, self.history_cap)))
            })
            .clone()
    }

    /// Lock a channel for mutation, creating it if needed.
    pub async fn write(&self, content_id: &str) -> ChannelWriteGuard {
        loop {
            let channel = self.get_or_create(content_id).await;
            let guard = channel.write_owned().await;
            // Lost a race with eviction: the map holds a fresh channel now.
            if !guard.retired {
                return guard;
            }
        }
    }

    /// Lock an existing channel for reading.
    pub async fn read(&self, content_id: &str) -> Option<ChannelReadGuard> {
        loop {
            let channel = self.get(content_id).await?;
            let guard = channel.read_owned().await;
            if !guard.retired {
                return Some(guard);
            }
        }
    }

    /// Content ids of all open channels.
    pub async fn content_ids(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }

    /// Drop idle channels. Channels currently locked are skipped.
    pub async fn evict_idle(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|content_id, channel| match channel.try_write() {
            Ok(mut state) if state.is_idle() => {
                state.retired = true;
                log::debug!("Evicting idle channel {content_id}");
                false
            }
            _ => true,
        });
        before - channels.len()
    }
}
