//! Presence: who is on a content item and where their cursor is.
//!
//! Presence is derived from the sessions of a channel rather than stored
//! separately. Cursor moves are broadcast directly and never enter the
//! operation log, so they do not consume a sequence number.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::broadcast::BroadcastHub;
use crate::channel::ChannelMap;
use crate::error::{CollabError, CollabResult};
use crate::now_millis;
use crate::protocol::ServerEvent;
use crate::session::{ConnectionState, SelectionRange, Session};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub session_id: Uuid,
    pub cursor_position: usize,
    pub selection: Option<SelectionRange>,
    pub last_activity: u64,
    pub connection_state: ConnectionState,
}

impl From<&Session> for PresenceEntry {
    fn from(session: &Session) -> Self {
        Self {
            user_id: session.user_id.clone(),
            session_id: session.id,
            cursor_position: session.cursor,
            selection: session.selection,
            last_activity: session.last_activity,
            connection_state: session.state,
        }
    }
}

/// Presence list for a channel's sessions, most recently active first.
pub fn entries(sessions: &HashMap<Uuid, Session>) -> Vec<PresenceEntry> {
    let mut out: Vec<PresenceEntry> = sessions.values().map(PresenceEntry::from).collect();
    out.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    out
}

pub struct PresenceTracker {
    channels: Arc<ChannelMap>,
    hub: Arc<BroadcastHub>,
}

impl PresenceTracker {
    pub fn new(channels: Arc<ChannelMap>, hub: Arc<BroadcastHub>) -> Self {
        Self { channels, hub }
    }

    pub async fn get_active_users(&self, content_id: &str) -> Vec<PresenceEntry> {
        match self.channels.read(content_id).await {
            Some(channel) => entries(&channel.sessions),
            None => Vec::new(),
        }
    }

    /// Move a session's cursor and tell everyone else on the channel.
    pub async fn update_cursor(
        &self,
        content_id: &str,
        session_id: Uuid,
        cursor: usize,
        selection: Option<SelectionRange>,
    ) -> CollabResult<PresenceEntry> {
        let mut channel = self.channels.write(content_id).await;
        let session = channel
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CollabError::not_found("session", session_id))?;

        session.cursor = cursor;
        session.selection = selection;
        session.touch(now_millis());
        let entry = PresenceEntry::from(&*session);
        log::trace!("Cursor of session {session_id} on {content_id} moved to {cursor}");

        let event = ServerEvent::CursorUpdate {
            session_id,
            user_id: entry.user_id.clone(),
            cursor,
            selection,
        };
        self.hub.deliver(&mut channel.sessions, &event, Some(session_id));
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Connection;
    use crate::session::Permissions;

    #[tokio::test]
    async fn test_cursor_update_skips_oplog_and_sender() {
        let channels = Arc::new(ChannelMap::new(16));
        let hub = Arc::new(BroadcastHub::new(channels.clone()));
        let tracker = PresenceTracker::new(channels.clone(), hub);

        let mut alice = Session::new("c1", "alice", Permissions::full(), 4, 0);
        let mut bob = Session::new("c1", "bob", Permissions::full(), 4, 0);
        let (conn_a, mut rx_a) = Connection::channel(4);
        let (conn_b, mut rx_b) = Connection::channel(4);
        alice.attach(conn_a);
        bob.attach(conn_b);
        let alice_id = alice.id;
        {
            let mut channel = channels.write("c1").await;
            channel.sessions.insert(alice.id, alice);
            channel.sessions.insert(bob.id, bob);
        }

        let entry = tracker
            .update_cursor("c1", alice_id, 12, Some(SelectionRange::new(12, 20)))
            .await
            .unwrap();
        assert_eq!(entry.cursor_position, 12);

        assert!(rx_a.try_recv().is_err());
        let frame = rx_b.try_recv().unwrap();
        assert!(frame.contains("\"type\":\"cursor_update\""));

        let channel = channels.read("c1").await.unwrap();
        assert_eq!(channel.log.head(), 0);
    }

    #[tokio::test]
    async fn test_active_users() {
        let channels = Arc::new(ChannelMap::new(16));
        let hub = Arc::new(BroadcastHub::new(channels.clone()));
        let tracker = PresenceTracker::new(channels.clone(), hub);
        assert!(tracker.get_active_users("c1").await.is_empty());

        let older = Session::new("c1", "alice", Permissions::full(), 4, 100);
        let newer = Session::new("c1", "bob", Permissions::full(), 4, 200);
        {
            let mut channel = channels.write("c1").await;
            channel.sessions.insert(older.id, older);
            channel.sessions.insert(newer.id, newer);
        }

        let users = tracker.get_active_users("c1").await;
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user_id, "bob");
        assert_eq!(users[1].connection_state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_cursor_update_unknown_session() {
        let channels = Arc::new(ChannelMap::new(16));
        let hub = Arc::new(BroadcastHub::new(channels.clone()));
        let tracker = PresenceTracker::new(channels, hub);
        let err = tracker
            .update_cursor("c1", Uuid::new_v4(), 0, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
