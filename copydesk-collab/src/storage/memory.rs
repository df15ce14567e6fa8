//! In-memory store, used when no storage path is configured and in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CollabStore, SessionRecord, StoreError, WorkflowRecord};
use crate::comments::Comment;

#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
    comments: RwLock<HashMap<Uuid, Comment>>,
    workflows: RwLock<HashMap<Uuid, WorkflowRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl CollabStore for MemoryStore {
    async fn put_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(record.session_id, record.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.read().await.get(&session_id).cloned())
    }

    async fn deactivate_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        match self.sessions.write().await.get_mut(&session_id) {
            Some(record) => {
                record.active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expired_sessions(&self, now: u64) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|r| r.active && r.expires_at <= now)
            .cloned()
            .collect())
    }

    async fn put_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        self.comments
            .write()
            .await
            .insert(comment.id, comment.clone());
        Ok(())
    }

    async fn load_comment(&self, comment_id: Uuid) -> Result<Option<Comment>, StoreError> {
        Ok(self.comments.read().await.get(&comment_id).cloned())
    }

    async fn list_comments(&self, content_id: &str) -> Result<Vec<Comment>, StoreError> {
        let mut comments: Vec<Comment> = self
            .comments
            .read()
            .await
            .values()
            .filter(|c| c.content_id == content_id)
            .cloned()
            .collect();
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
        self.workflows
            .write()
            .await
            .insert(record.workflow_id, record.clone());
        Ok(())
    }

    async fn load_workflow(&self, workflow_id: Uuid) -> Result<Option<WorkflowRecord>, StoreError> {
        Ok(self.workflows.read().await.get(&workflow_id).cloned())
    }

    async fn list_workflows(&self, content_id: &str) -> Result<Vec<WorkflowRecord>, StoreError> {
        Ok(self
            .workflows
            .read()
            .await
            .values()
            .filter(|w| w.content_id == content_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Permissions;

    fn session(expires_at: u64) -> SessionRecord {
        SessionRecord {
            session_id: Uuid::new_v4(),
            user_id: "u1".into(),
            content_id: "c1".into(),
            state: Vec::new(),
            permissions: Permissions::full(),
            last_activity: 0,
            expires_at,
            active: true,
        }
    }

    #[tokio::test]
    async fn test_expired_sessions_skip_inactive() {
        let store = MemoryStore::new();
        let stale = session(100);
        let fresh = session(10_000);
        let gone = session(50);
        store.put_session(&stale).await.unwrap();
        store.put_session(&fresh).await.unwrap();
        store.put_session(&gone).await.unwrap();
        assert!(store.deactivate_session(gone.session_id).await.unwrap());
        assert!(!store.deactivate_session(Uuid::new_v4()).await.unwrap());

        let expired = store.expired_sessions(1_000).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, stale.session_id);
        assert_eq!(store.session_count().await, 3);
    }
}
