//! Session registry: who is editing which content item.
//!
//! Sessions are indexed three ways:
//! - by content item: the `sessions` map of each channel
//! - by session id: `SessionIndex::by_id` (session → content)
//! - by user: `SessionIndex::by_user` (user → sessions)
//!
//! Index updates happen while the owning channel's write lock is held, so
//! the three views never disagree for longer than one critical section.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broadcast::{BroadcastHub, Connection};
use crate::channel::{ChannelMap, ChannelState};
use crate::collaborators::PermissionResolver;
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::now_millis;
use crate::oplog::Operation;
use crate::presence::{self, PresenceEntry};
use crate::protocol::{LeaveReason, ServerEvent};
use crate::storage::{pack_json, unpack_json, CollabStore, SessionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Capabilities a user holds on one content item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub comment: bool,
    pub approve: bool,
}

impl Permissions {
    pub fn full() -> Self {
        Self {
            read: true,
            write: true,
            comment: true,
            approve: true,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

impl SelectionRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }
}

/// Bounded undo/redo stacks of operation sequences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoBuffer {
    undo: VecDeque<u64>,
    redo: VecDeque<u64>,
    capacity: usize,
}

impl UndoBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a freshly applied edit. Clears the redo stack.
    pub fn record(&mut self, sequence: u64) {
        self.redo.clear();
        Self::push_bounded(&mut self.undo, sequence, self.capacity);
    }

    /// Pop the most recent edit to undo.
    pub fn undo(&mut self) -> Option<u64> {
        let sequence = self.undo.pop_back()?;
        Self::push_bounded(&mut self.redo, sequence, self.capacity);
        Some(sequence)
    }

    /// Pop the most recently undone edit to reapply.
    pub fn redo(&mut self) -> Option<u64> {
        let sequence = self.redo.pop_back()?;
        Self::push_bounded(&mut self.undo, sequence, self.capacity);
        Some(sequence)
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    fn push_bounded(stack: &mut VecDeque<u64>, sequence: u64, capacity: usize) {
        stack.push_back(sequence);
        while stack.len() > capacity {
            stack.pop_front();
        }
    }
}

/// A live editing context: one user, one content item, one connection.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    /// Secret handed to the owning client only
    pub token: String,
    pub user_id: String,
    pub content_id: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub cursor: usize,
    pub selection: Option<SelectionRange>,
    pub state: ConnectionState,
    pub permissions: Permissions,
    pub history: UndoBuffer,
    /// Highest sequence this session is known to have seen
    pub last_ack: u64,
    connection: Option<Connection>,
}

/// The part of a session that survives a restart.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    token: String,
    created_at: u64,
    cursor: usize,
    selection: Option<SelectionRange>,
    history: UndoBuffer,
    last_ack: u64,
}

impl Session {
    pub fn new(
        content_id: impl Into<String>,
        user_id: impl Into<String>,
        permissions: Permissions,
        undo_capacity: usize,
        now: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            token: Uuid::new_v4().simple().to_string(),
            user_id: user_id.into(),
            content_id: content_id.into(),
            created_at: now,
            last_activity: now,
            cursor: 0,
            selection: None,
            state: ConnectionState::Disconnected,
            permissions,
            history: UndoBuffer::new(undo_capacity),
            last_ack: 0,
            connection: None,
        }
    }

    pub fn touch(&mut self, now: u64) {
        self.last_activity = self.last_activity.max(now);
    }

    pub fn attach(&mut self, connection: Connection) {
        self.connection = Some(connection);
        self.state = ConnectionState::Connected;
    }

    /// Drop the connection, keeping the session for a later rejoin.
    pub fn detach(&mut self) {
        self.connection = None;
        self.state = ConnectionState::Disconnected;
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.connection.is_some()
    }

    pub fn is_idle(&self, now: u64, timeout_ms: u64) -> bool {
        self.last_activity.saturating_add(timeout_ms) <= now
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            user_id: self.user_id.clone(),
            content_id: self.content_id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            cursor: self.cursor,
            selection: self.selection,
            state: self.state,
            permissions: self.permissions,
        }
    }

    pub fn to_record(&self, timeout_ms: u64) -> CollabResult<SessionRecord> {
        let state = PersistedState {
            token: self.token.clone(),
            created_at: self.created_at,
            cursor: self.cursor,
            selection: self.selection,
            history: self.history.clone(),
            last_ack: self.last_ack,
        };
        Ok(SessionRecord {
            session_id: self.id,
            user_id: self.user_id.clone(),
            content_id: self.content_id.clone(),
            state: pack_json(&state)?,
            permissions: self.permissions,
            last_activity: self.last_activity,
            expires_at: self.last_activity.saturating_add(timeout_ms),
            active: true,
        })
    }

    /// Rebuild a disconnected session from its persisted record.
    pub fn from_record(record: &SessionRecord) -> CollabResult<Self> {
        let state: PersistedState = unpack_json(&record.state)?;
        Ok(Self {
            id: record.session_id,
            token: state.token,
            user_id: record.user_id.clone(),
            content_id: record.content_id.clone(),
            created_at: state.created_at,
            last_activity: record.last_activity,
            cursor: state.cursor,
            selection: state.selection,
            state: ConnectionState::Disconnected,
            permissions: record.permissions,
            history: state.history,
            last_ack: state.last_ack,
            connection: None,
        })
    }
}

/// Public view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub user_id: String,
    pub content_id: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub cursor: usize,
    pub selection: Option<SelectionRange>,
    pub state: ConnectionState,
    pub permissions: Permissions,
}

/// Everything a (re)joining client needs to catch up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: SessionInfo,
    pub token: String,
    pub head_sequence: u64,
    pub recent_operations: Vec<Operation>,
    pub presence: Vec<PresenceEntry>,
}

#[derive(Debug, Default)]
pub struct StartOptions {
    /// Always allocate a new session, even if the user already has one here
    pub force_new: bool,
    /// Connection to attach to the session straight away
    pub connection: Option<Connection>,
}

impl StartOptions {
    pub fn force_new() -> Self {
        Self {
            force_new: true,
            connection: None,
        }
    }

    pub fn with_connection(connection: Connection) -> Self {
        Self {
            force_new: false,
            connection: Some(connection),
        }
    }
}

#[derive(Debug, Default)]
struct SessionIndex {
    by_id: HashMap<Uuid, String>,
    by_user: HashMap<String, HashSet<Uuid>>,
}

impl SessionIndex {
    fn insert(&mut self, session: &Session) {
        self.by_id.insert(session.id, session.content_id.clone());
        self.by_user
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.id);
    }

    fn remove(&mut self, session_id: Uuid, user_id: &str) {
        self.by_id.remove(&session_id);
        if let Some(ids) = self.by_user.get_mut(user_id) {
            ids.remove(&session_id);
            if ids.is_empty() {
                self.by_user.remove(user_id);
            }
        }
    }
}

pub struct SessionRegistry {
    config: Arc<CollabConfig>,
    channels: Arc<ChannelMap>,
    hub: Arc<BroadcastHub>,
    store: Arc<dyn CollabStore>,
    permissions: Arc<dyn PermissionResolver>,
    index: RwLock<SessionIndex>,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<CollabConfig>,
        channels: Arc<ChannelMap>,
        hub: Arc<BroadcastHub>,
        store: Arc<dyn CollabStore>,
        permissions: Arc<dyn PermissionResolver>,
    ) -> Self {
        Self {
            config,
            channels,
            hub,
            store,
            permissions,
            index: RwLock::new(SessionIndex::default()),
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.config.session_timeout.as_millis() as u64
    }

    /// Open a session for `user_id` on `content_id`.
    ///
    /// Returns the user's existing session unchanged unless
    /// `options.force_new` is set. A connection passed in `options` is
    /// attached to whichever session is returned.
    pub async fn start_session(
        &self,
        content_id: &str,
        user_id: &str,
        options: StartOptions,
    ) -> CollabResult<SessionSnapshot> {
        if content_id.is_empty() || user_id.is_empty() {
            return Err(CollabError::Validation(
                "content id and user id are required".into(),
            ));
        }

        let mut channel = self.channels.write(content_id).await;
        let now = now_millis();

        if !options.force_new {
            if let Some(existing) = channel.session_of_user(user_id) {
                log::debug!("User {user_id} rejoined existing session {existing} on {content_id}");
                if let Some(connection) = options.connection {
                    self.reattach(&mut channel, existing, connection, now).await?;
                }
                return self.snapshot(&channel, existing);
            }
        }

        let permissions = self
            .permissions
            .get_user_permissions(user_id, content_id)
            .await?;
        if !permissions.read {
            return Err(CollabError::Forbidden(format!(
                "user {user_id} cannot read content {content_id}"
            )));
        }

        let mut session = Session::new(
            content_id,
            user_id,
            permissions,
            self.config.undo_capacity,
            now,
        );
        session.last_ack = channel.log.head();
        if let Some(connection) = options.connection {
            session.attach(connection);
        }
        self.store.put_session(&session.to_record(self.timeout_ms())?).await?;

        let session_id = session.id;
        self.index.write().await.insert(&session);
        channel.sessions.insert(session_id, session);

        log::info!("Session {session_id} started for user {user_id} on content {content_id}");

        let joined = ServerEvent::UserJoined {
            session_id,
            user_id: user_id.to_string(),
            content_id: content_id.to_string(),
        };
        self.hub.deliver(&mut channel.sessions, &joined, Some(session_id));

        self.snapshot(&channel, session_id)
    }

    /// Reattach a connection to an existing session, rehydrating it from
    /// storage when it is not in memory.
    pub async fn join_session(
        &self,
        session_id: Uuid,
        user_id: &str,
        connection: Connection,
    ) -> CollabResult<SessionSnapshot> {
        let now = now_millis();

        let (content_id, record) = match self.content_of(session_id).await {
            Some(content_id) => (content_id, None),
            None => {
                let record = self
                    .store
                    .load_session(session_id)
                    .await?
                    .filter(|r| r.active && r.expires_at > now)
                    .ok_or_else(|| CollabError::not_found("session", session_id))?;
                (record.content_id.clone(), Some(record))
            }
        };

        let mut channel = self.channels.write(&content_id).await;

        if !channel.sessions.contains_key(&session_id) {
            let record = match record {
                Some(r) => r,
                None => self
                    .store
                    .load_session(session_id)
                    .await?
                    .filter(|r| r.active && r.expires_at > now)
                    .ok_or_else(|| CollabError::not_found("session", session_id))?,
            };
            if record.user_id != user_id {
                return Err(Self::owner_mismatch(session_id, user_id));
            }
            let session = Session::from_record(&record)?;
            log::info!("Rehydrated session {session_id} for user {user_id} from storage");
            self.index.write().await.insert(&session);
            channel.sessions.insert(session_id, session);
        } else if channel
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.user_id != user_id)
        {
            return Err(Self::owner_mismatch(session_id, user_id));
        }

        self.reattach(&mut channel, session_id, connection, now).await?;
        self.snapshot(&channel, session_id)
    }

    async fn reattach(
        &self,
        channel: &mut ChannelState,
        session_id: Uuid,
        connection: Connection,
        now: u64,
    ) -> CollabResult<()> {
        let head = channel.log.head();
        let session = channel
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CollabError::not_found("session", session_id))?;

        session.attach(connection);
        session.touch(now);
        session.last_ack = head;
        let user_id = session.user_id.clone();
        self.store.put_session(&session.to_record(self.timeout_ms())?).await?;

        log::info!("User {user_id} reconnected to session {session_id}");

        let reconnected = ServerEvent::UserReconnected {
            session_id,
            user_id,
            content_id: channel.content_id.clone(),
        };
        self.hub.deliver(&mut channel.sessions, &reconnected, Some(session_id));
        Ok(())
    }

    /// Close a session. Returns `false` if it was already gone.
    pub async fn leave_session(&self, session_id: Uuid, user_id: &str) -> CollabResult<bool> {
        let Some(content_id) = self.content_of(session_id).await else {
            // Not live: make sure a persisted copy cannot be rejoined.
            if let Some(record) = self.store.load_session(session_id).await? {
                if record.active && record.user_id == user_id {
                    self.store.deactivate_session(session_id).await?;
                }
            }
            return Ok(false);
        };

        let mut channel = self.channels.write(&content_id).await;
        match channel.sessions.get(&session_id) {
            None => return Ok(false),
            Some(session) if session.user_id != user_id => {
                return Err(Self::owner_mismatch(session_id, user_id));
            }
            Some(_) => {}
        }

        self.store.deactivate_session(session_id).await?;
        self.remove_locked(&mut channel, session_id, LeaveReason::Left).await;
        Ok(true)
    }

    /// Expire `session_id` if it is still registered and idle at `now`.
    ///
    /// Check and removal happen under the channel lock, so a concurrent
    /// rejoin either wins entirely or loses entirely.
    pub async fn expire_if_idle(
        &self,
        content_id: &str,
        session_id: Uuid,
        now: u64,
    ) -> CollabResult<bool> {
        let mut channel = self.channels.write(content_id).await;
        let idle = channel
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.is_idle(now, self.timeout_ms()));
        if !idle {
            return Ok(false);
        }

        self.store.deactivate_session(session_id).await?;
        self.remove_locked(&mut channel, session_id, LeaveReason::Expired).await;
        Ok(true)
    }

    async fn remove_locked(&self, channel: &mut ChannelState, session_id: Uuid, reason: LeaveReason) {
        let Some(mut session) = channel.sessions.remove(&session_id) else {
            return;
        };
        session.detach();
        self.index.write().await.remove(session_id, &session.user_id);

        log::info!(
            "Session {session_id} of user {} removed from {} ({reason:?})",
            session.user_id,
            channel.content_id
        );

        let left = ServerEvent::UserLeft {
            session_id,
            user_id: session.user_id,
            reason,
        };
        self.hub.deliver(&mut channel.sessions, &left, Some(session_id));
    }

    /// Degrade a session to `disconnected` after its connection closed.
    ///
    /// Ignored when the session has since been attached to a different
    /// connection.
    pub async fn detach_connection(&self, session_id: Uuid, connection_id: Uuid) -> bool {
        let Some(content_id) = self.content_of(session_id).await else {
            return false;
        };
        let mut channel = self.channels.write(&content_id).await;
        match channel.sessions.get_mut(&session_id) {
            Some(session) if session.connection().map(|c| c.id()) == Some(connection_id) => {
                session.detach();
                log::info!("Session {session_id} disconnected, kept for rejoin");
                true
            }
            _ => false,
        }
    }

    /// Record activity without any other change (heartbeats).
    pub async fn touch(&self, session_id: Uuid) -> CollabResult<()> {
        let content_id = self
            .content_of(session_id)
            .await
            .ok_or_else(|| CollabError::not_found("session", session_id))?;
        let mut channel = self.channels.write(&content_id).await;
        let session = channel
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CollabError::not_found("session", session_id))?;
        session.touch(now_millis());
        Ok(())
    }

    pub async fn undo(&self, session_id: Uuid) -> CollabResult<Option<u64>> {
        self.with_history(session_id, UndoBuffer::undo).await
    }

    pub async fn redo(&self, session_id: Uuid) -> CollabResult<Option<u64>> {
        self.with_history(session_id, UndoBuffer::redo).await
    }

    async fn with_history(
        &self,
        session_id: Uuid,
        step: fn(&mut UndoBuffer) -> Option<u64>,
    ) -> CollabResult<Option<u64>> {
        let content_id = self
            .content_of(session_id)
            .await
            .ok_or_else(|| CollabError::not_found("session", session_id))?;
        let mut channel = self.channels.write(&content_id).await;
        let session = channel
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CollabError::not_found("session", session_id))?;
        Ok(step(&mut session.history))
    }

    /// Persist the current in-memory state of a live session.
    pub async fn persist(&self, session_id: Uuid) -> CollabResult<bool> {
        let Some(content_id) = self.content_of(session_id).await else {
            return Ok(false);
        };
        let channel = self.channels.write(&content_id).await;
        match channel.sessions.get(&session_id) {
            Some(session) => {
                self.store.put_session(&session.to_record(self.timeout_ms())?).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Content item a live session belongs to.
    pub async fn content_of(&self, session_id: Uuid) -> Option<String> {
        self.index.read().await.by_id.get(&session_id).cloned()
    }

    /// Live session ids owned by `user_id`, across all content items.
    pub async fn sessions_of_user(&self, user_id: &str) -> Vec<Uuid> {
        self.index
            .read()
            .await
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn session_info(&self, session_id: Uuid) -> CollabResult<SessionInfo> {
        let content_id = self
            .content_of(session_id)
            .await
            .ok_or_else(|| CollabError::not_found("session", session_id))?;
        let channel = self
            .channels
            .read(&content_id)
            .await
            .ok_or_else(|| CollabError::not_found("session", session_id))?;
        channel
            .sessions
            .get(&session_id)
            .map(Session::info)
            .ok_or_else(|| CollabError::not_found("session", session_id))
    }

    /// Sessions idle at `now`, as `(content id, session id)` pairs.
    pub async fn idle_sessions(&self, now: u64) -> Vec<(String, Uuid)> {
        let mut idle = Vec::new();
        for content_id in self.channels.content_ids().await {
            if let Some(channel) = self.channels.read(&content_id).await {
                idle.extend(
                    channel
                        .sessions
                        .values()
                        .filter(|s| s.is_idle(now, self.timeout_ms()))
                        .map(|s| (content_id.clone(), s.id)),
                );
            }
        }
        idle
    }

    pub async fn session_count(&self) -> usize {
        self.index.read().await.by_id.len()
    }

    fn snapshot(&self, channel: &ChannelState, session_id: Uuid) -> CollabResult<SessionSnapshot> {
        let session = channel
            .sessions
            .get(&session_id)
            .ok_or_else(|| CollabError::not_found("session", session_id))?;
        Ok(SessionSnapshot {
            session: session.info(),
            token: session.token.clone(),
            head_sequence: channel.log.head(),
            recent_operations: channel.log.recent(self.config.snapshot_window),
            presence: presence::entries(&channel.sessions),
        })
    }

    fn owner_mismatch(session_id: Uuid, user_id: &str) -> CollabError {
        CollabError::Forbidden(format!("session {session_id} is not owned by user {user_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undo_buffer_bounded() {
        let mut buf = UndoBuffer::new(3);
        for seq in 1..=5 {
            buf.record(seq);
        }
        assert_eq!(buf.undo_len(), 3);
        assert_eq!(buf.undo(), Some(5));
        assert_eq!(buf.undo(), Some(4));
        assert_eq!(buf.undo(), Some(3));
        assert_eq!(buf.undo(), None);
        assert_eq!(buf.redo_len(), 3);
        assert_eq!(buf.redo(), Some(3));
        assert_eq!(buf.redo_len(), 2);
        assert_eq!(buf.undo_len(), 1);
    }

    #[test]
    fn test_undo_buffer_record_clears_redo() {
        let mut buf = UndoBuffer::new(10);
        buf.record(1);
        buf.record(2);
        assert_eq!(buf.undo(), Some(2));
        assert_eq!(buf.redo_len(), 1);
        buf.record(3);
        assert_eq!(buf.redo_len(), 0);
        assert_eq!(buf.redo(), None);
    }

    #[test]
    fn test_session_record_roundtrip() {
        let mut session = Session::new("c1", "u1", Permissions::full(), 4, 1_000);
        session.cursor = 42;
        session.selection = Some(SelectionRange::new(50, 40));
        session.history.record(7);
        session.last_ack = 7;

        let record = session.to_record(60_000).unwrap();
        assert_eq!(record.expires_at, 61_000);
        assert!(record.active);

        let restored = Session::from_record(&record).unwrap();
        assert_eq!(restored.id, session.id);
        assert_eq!(restored.token, session.token);
        assert_eq!(restored.cursor, 42);
        assert_eq!(restored.selection, Some(SelectionRange { start: 40, end: 50 }));
        assert_eq!(restored.last_ack, 7);
        assert_eq!(restored.state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_session_idle() {
        let mut session = Session::new("c1", "u1", Permissions::full(), 4, 1_000);
        assert!(!session.is_idle(1_500, 1_000));
        assert!(session.is_idle(2_000, 1_000));
        session.touch(1_800);
        assert!(!session.is_idle(2_000, 1_000));
        // Touch never moves activity backwards.
        session.touch(10);
        assert_eq!(session.last_activity, 1_800);
    }

    #[test]
    fn test_attach_detach() {
        let mut session = Session::new("c1", "u1", Permissions::full(), 4, 0);
        let (conn, _rx) = Connection::channel(4);
        session.attach(conn);
        assert!(session.is_connected());
        session.detach();
        assert!(!session.is_connected());
        assert_eq!(session.state, ConnectionState::Disconnected);
    }
}
