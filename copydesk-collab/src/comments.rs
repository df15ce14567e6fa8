//! Threaded comments anchored to content items.
//!
//! Comments are kept flat: each carries an optional `parent_id` and the
//! tree is rebuilt on read by grouping on it. A reply's parent must already
//! exist on the same content item, so the parent graph can never cycle.
//!
//! A channel's thread is loaded from the store the first time it is
//! touched; after that the in-memory list and the store are written
//! together under the channel lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broadcast::BroadcastHub;
use crate::channel::{ChannelMap, ChannelReadGuard, ChannelState};
use crate::collaborators::PermissionResolver;
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::now_millis;
use crate::protocol::ServerEvent;
use crate::storage::CollabStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentKind {
    Comment,
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentStatus {
    Open,
    Resolved,
}

/// Character range a comment is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentAnchor {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentResolution {
    pub resolved_by: String,
    pub resolved_at: u64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub content_id: String,
    pub author: String,
    pub body: String,
    pub kind: CommentKind,
    pub parent_id: Option<Uuid>,
    pub anchor: Option<CommentAnchor>,
    pub status: CommentStatus,
    pub resolution: Option<CommentResolution>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Input for a new comment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommentDraft {
    pub text: String,
    #[serde(default)]
    pub kind: Option<CommentKind>,
    #[serde(default)]
    pub position: Option<CommentAnchor>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

impl CommentDraft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn anchored(mut self, start: usize, end: usize) -> Self {
        self.position = Some(CommentAnchor { start, end });
        self
    }

    pub fn reply_to(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self.kind = Some(CommentKind::Reply);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentFilter {
    #[serde(default)]
    pub status: Option<CommentStatus>,
    #[serde(default)]
    pub kind: Option<CommentKind>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default = "default_true")]
    pub include_replies: bool,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_true() -> bool {
    true
}

fn default_limit() -> usize {
    50
}

impl Default for CommentFilter {
    fn default() -> Self {
        Self {
            status: None,
            kind: None,
            author: None,
            include_replies: true,
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl CommentFilter {
    fn matches(&self, comment: &Comment) -> bool {
        self.status.is_none_or(|s| comment.status == s)
            && self.kind.is_none_or(|k| comment.kind == k)
            && self.author.as_deref().is_none_or(|a| comment.author == a)
            && (self.include_replies || comment.kind != CommentKind::Reply)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentPage {
    pub comments: Vec<Comment>,
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentNode {
    pub comment: Comment,
    pub replies: Vec<CommentNode>,
}

/// In-memory comment arena for one channel, in creation order.
#[derive(Debug, Default)]
pub struct CommentThread {
    loaded: bool,
    comments: Vec<Comment>,
    index: HashMap<Uuid, usize>,
}

impl CommentThread {
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn load(&mut self, mut persisted: Vec<Comment>) {
        persisted.sort_by_key(|c| c.created_at);
        for comment in persisted {
            if !self.index.contains_key(&comment.id) {
                self.push(comment);
            }
        }
        self.loaded = true;
    }

    fn push(&mut self, comment: Comment) {
        self.index.insert(comment.id, self.comments.len());
        self.comments.push(comment);
    }

    pub fn get(&self, id: Uuid) -> Option<&Comment> {
        self.index.get(&id).map(|&i| &self.comments[i])
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut Comment> {
        self.index.get(&id).map(|&i| &mut self.comments[i])
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    /// Filtered comments, newest first, paginated.
    pub fn page(&self, filter: &CommentFilter) -> CommentPage {
        let matching: Vec<&Comment> = self
            .comments
            .iter()
            .rev()
            .filter(|c| filter.matches(c))
            .collect();
        let total = matching.len();
        let comments: Vec<Comment> = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect();
        let has_more = filter.offset + comments.len() < total;
        CommentPage {
            comments,
            total,
            has_more,
        }
    }

    /// Rebuild the reply tree: top-level comments newest first, replies
    /// oldest first under their parent.
    pub fn tree(&self) -> Vec<CommentNode> {
        let mut children: HashMap<Uuid, Vec<&Comment>> = HashMap::new();
        let mut roots = Vec::new();
        for comment in &self.comments {
            match comment.parent_id {
                Some(parent) if self.index.contains_key(&parent) => {
                    children.entry(parent).or_default().push(comment)
                }
                _ => roots.push(comment),
            }
        }

        fn build(comment: &Comment, children: &HashMap<Uuid, Vec<&Comment>>) -> CommentNode {
            let replies = children
                .get(&comment.id)
                .map(|list| list.iter().map(|c| build(c, children)).collect())
                .unwrap_or_default();
            CommentNode {
                comment: comment.clone(),
                replies,
            }
        }

        roots.iter().rev().map(|c| build(c, &children)).collect()
    }
}

pub struct CommentManager {
    config: Arc<CollabConfig>,
    channels: Arc<ChannelMap>,
    hub: Arc<BroadcastHub>,
    store: Arc<dyn CollabStore>,
    permissions: Arc<dyn PermissionResolver>,
    /// comment id → content id
    owners: RwLock<HashMap<Uuid, String>>,
}

impl CommentManager {
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
            owners: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_comment(
        &self,
        content_id: &str,
        draft: CommentDraft,
        user_id: &str,
    ) -> CollabResult<Comment> {
        let body = draft.text.trim();
        if body.is_empty() {
            return Err(CollabError::Validation("comment text is empty".into()));
        }
        if body.chars().count() > self.config.max_comment_length {
            return Err(CollabError::Validation(format!(
                "comment text exceeds {} characters",
                self.config.max_comment_length
            )));
        }
        let kind = match (draft.parent_id, draft.kind) {
            (Some(_), _) => CommentKind::Reply,
            (None, Some(CommentKind::Reply)) => {
                return Err(CollabError::Validation("a reply needs a parent comment".into()));
            }
            (None, _) => CommentKind::Comment,
        };
        self.require_comment_permission(user_id, content_id).await?;

        let mut channel = self.channels.write(content_id).await;
        self.ensure_loaded(&mut channel).await?;

        if let Some(parent_id) = draft.parent_id {
            if channel.comments.get(parent_id).is_none() {
                return Err(CollabError::not_found("comment", parent_id));
            }
        }

        let now = now_millis();
        let comment = Comment {
            id: Uuid::new_v4(),
            content_id: content_id.to_string(),
            author: user_id.to_string(),
            body: body.to_string(),
            kind,
            parent_id: draft.parent_id,
            anchor: draft.position,
            status: CommentStatus::Open,
            resolution: None,
            created_at: now,
            updated_at: now,
        };

        self.store.put_comment(&comment).await?;
        channel.comments.push(comment.clone());
        self.owners
            .write()
            .await
            .insert(comment.id, content_id.to_string());

        log::debug!("Comment {} added to {content_id} by {user_id}", comment.id);

        let exclude = channel.session_of_user(user_id);
        let event = ServerEvent::CommentAdded {
            comment: comment.clone(),
        };
        self.hub.deliver(&mut channel.sessions, &event, exclude);

        Ok(comment)
    }

    /// Reply to an existing comment; the content item is taken from the parent.
    pub async fn reply_to_comment(
        &self,
        comment_id: Uuid,
        text: &str,
        user_id: &str,
    ) -> CollabResult<Comment> {
        let content_id = self.content_of(comment_id).await?;
        self.add_comment(&content_id, CommentDraft::new(text).reply_to(comment_id), user_id)
            .await
    }

    /// Mark a comment resolved. Resolving again re-records the resolver.
    pub async fn resolve_comment(
        &self,
        comment_id: Uuid,
        note: Option<String>,
        user_id: &str,
    ) -> CollabResult<Comment> {
        let content_id = self.content_of(comment_id).await?;
        self.require_comment_permission(user_id, &content_id).await?;

        let mut channel = self.channels.write(&content_id).await;
        self.ensure_loaded(&mut channel).await?;

        let now = now_millis();
        let comment = channel
            .comments
            .get_mut(comment_id)
            .ok_or_else(|| CollabError::not_found("comment", comment_id))?;
        let mut updated = comment.clone();
        updated.status = CommentStatus::Resolved;
        updated.resolution = Some(CommentResolution {
            resolved_by: user_id.to_string(),
            resolved_at: now,
            note,
        });
        updated.updated_at = now;

        self.store.put_comment(&updated).await?;
        *comment = updated.clone();

        let exclude = channel.session_of_user(user_id);
        let event = ServerEvent::CommentResolved {
            comment: updated.clone(),
        };
        self.hub.deliver(&mut channel.sessions, &event, exclude);

        Ok(updated)
    }

    pub async fn get_comments(
        &self,
        content_id: &str,
        filter: &CommentFilter,
    ) -> CollabResult<CommentPage> {
        let channel = self.loaded_view(content_id).await?;
        Ok(channel.comments.page(filter))
    }

    pub async fn get_comment(&self, comment_id: Uuid) -> CollabResult<Comment> {
        let content_id = self.content_of(comment_id).await?;
        let channel = self.loaded_view(&content_id).await?;
        channel
            .comments
            .get(comment_id)
            .cloned()
            .ok_or_else(|| CollabError::not_found("comment", comment_id))
    }

    pub async fn comment_tree(&self, content_id: &str) -> CollabResult<Vec<CommentNode>> {
        let channel = self.loaded_view(content_id).await?;
        Ok(channel.comments.tree())
    }

    async fn loaded_view(&self, content_id: &str) -> CollabResult<ChannelReadGuard> {
        if let Some(channel) = self.channels.read(content_id).await {
            if channel.comments.is_loaded() {
                return Ok(channel);
            }
        }
        let mut channel = self.channels.write(content_id).await;
        self.ensure_loaded(&mut channel).await?;
        Ok(channel.downgrade())
    }

    async fn ensure_loaded(&self, channel: &mut ChannelState) -> CollabResult<()> {
        if channel.comments.is_loaded() {
            return Ok(());
        }
        let persisted = self.store.list_comments(&channel.content_id).await?;
        log::debug!(
            "Loaded {} comment(s) for {} from storage",
            persisted.len(),
            channel.content_id
        );
        {
            let mut owners = self.owners.write().await;
            for comment in &persisted {
                owners.insert(comment.id, comment.content_id.clone());
            }
        }
        channel.comments.load(persisted);
        Ok(())
    }

    async fn content_of(&self, comment_id: Uuid) -> CollabResult<String> {
        if let Some(content_id) = self.owners.read().await.get(&comment_id) {
            return Ok(content_id.clone());
        }
        let comment = self
            .store
            .load_comment(comment_id)
            .await?
            .ok_or_else(|| CollabError::not_found("comment", comment_id))?;
        self.owners
            .write()
            .await
            .insert(comment_id, comment.content_id.clone());
        Ok(comment.content_id)
    }

    async fn require_comment_permission(&self, user_id: &str, content_id: &str) -> CollabResult<()> {
        let permissions = self
            .permissions
            .get_user_permissions(user_id, content_id)
            .await?;
        if permissions.comment {
            Ok(())
        } else {
            Err(CollabError::Forbidden(format!(
                "user {user_id} cannot comment on content {content_id}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AllowAll, PermissionTable};
    use crate::session::Permissions;
    use crate::storage::MemoryStore;

    fn manager_with(store: Arc<MemoryStore>, permissions: Arc<dyn PermissionResolver>) -> CommentManager {
        let channels = Arc::new(ChannelMap::new(16));
        let hub = Arc::new(BroadcastHub::new(channels.clone()));
        CommentManager::new(
            Arc::new(CollabConfig::for_testing()),
            channels,
            hub,
            store,
            permissions,
        )
    }

    fn manager() -> CommentManager {
        manager_with(Arc::new(MemoryStore::new()), Arc::new(AllowAll))
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let m = manager();
        let err = m.add_comment("c1", CommentDraft::new("   "), "u1").await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn test_too_long_text_rejected() {
        let m = manager();
        let text = "x".repeat(CollabConfig::for_testing().max_comment_length + 1);
        let err = m.add_comment("c1", CommentDraft::new(text), "u1").await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn test_reply_to_missing_parent() {
        let m = manager();
        let draft = CommentDraft::new("hi").reply_to(Uuid::new_v4());
        let err = m.add_comment("c1", draft, "u1").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let err = m.reply_to_comment(Uuid::new_v4(), "hi", "u1").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_parent_must_be_on_same_content() {
        let m = manager();
        let parent = m.add_comment("c1", CommentDraft::new("root"), "u1").await.unwrap();
        let err = m
            .add_comment("c2", CommentDraft::new("stray").reply_to(parent.id), "u2")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_reply_without_parent_rejected() {
        let m = manager();
        let mut draft = CommentDraft::new("orphan");
        draft.kind = Some(CommentKind::Reply);
        let err = m.add_comment("c1", draft, "u1").await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn test_reply_and_tree() {
        let m = manager();
        let root = m
            .add_comment("c1", CommentDraft::new(" Typo here ").anchored(4, 9), "u1")
            .await
            .unwrap();
        assert_eq!(root.body, "Typo here");
        assert_eq!(root.kind, CommentKind::Comment);

        let reply = m.reply_to_comment(root.id, "Fixed", "u2").await.unwrap();
        assert_eq!(reply.kind, CommentKind::Reply);
        assert_eq!(reply.parent_id, Some(root.id));
        assert_eq!(reply.content_id, "c1");

        let tree = m.comment_tree("c1").await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].replies.len(), 1);
        assert_eq!(tree[0].replies[0].comment.id, reply.id);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let m = manager();
        let c = m.add_comment("c1", CommentDraft::new("check"), "u1").await.unwrap();

        let first = m.resolve_comment(c.id, None, "u1").await.unwrap();
        assert_eq!(first.status, CommentStatus::Resolved);

        let second = m
            .resolve_comment(c.id, Some("done".into()), "u2")
            .await
            .unwrap();
        assert_eq!(second.status, CommentStatus::Resolved);
        let resolution = second.resolution.unwrap();
        assert_eq!(resolution.resolved_by, "u2");
        assert_eq!(resolution.note.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_filters_and_pagination() {
        let m = manager();
        let mut ids = Vec::new();
        for i in 0..5 {
            let author = if i % 2 == 0 { "u1" } else { "u2" };
            ids.push(
                m.add_comment("c1", CommentDraft::new(format!("note {i}")), author)
                    .await
                    .unwrap()
                    .id,
            );
        }
        m.reply_to_comment(ids[0], "reply", "u2").await.unwrap();
        m.resolve_comment(ids[1], None, "u1").await.unwrap();

        let all = m.get_comments("c1", &CommentFilter::default()).await.unwrap();
        assert_eq!(all.total, 6);
        // Newest first.
        assert_eq!(all.comments[0].kind, CommentKind::Reply);

        let top_level = CommentFilter {
            include_replies: false,
            ..CommentFilter::default()
        };
        assert_eq!(m.get_comments("c1", &top_level).await.unwrap().total, 5);

        let by_u1 = CommentFilter {
            author: Some("u1".into()),
            ..CommentFilter::default()
        };
        assert_eq!(m.get_comments("c1", &by_u1).await.unwrap().total, 3);

        let resolved = CommentFilter {
            status: Some(CommentStatus::Resolved),
            ..CommentFilter::default()
        };
        let page = m.get_comments("c1", &resolved).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.comments[0].id, ids[1]);

        let paged = CommentFilter {
            limit: 2,
            offset: 2,
            ..CommentFilter::default()
        };
        let page = m.get_comments("c1", &paged).await.unwrap();
        assert_eq!(page.comments.len(), 2);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_comment_permission_required() {
        let table = PermissionTable::new(Permissions::read_only());
        let m = manager_with(Arc::new(MemoryStore::new()), Arc::new(table));
        let err = m.add_comment("c1", CommentDraft::new("hi"), "u1").await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[tokio::test]
    async fn test_thread_reloads_from_store() {
        let store = Arc::new(MemoryStore::new());
        let first = manager_with(store.clone(), Arc::new(AllowAll));
        let root = first.add_comment("c1", CommentDraft::new("persisted"), "u1").await.unwrap();

        let second = manager_with(store, Arc::new(AllowAll));
        let reply = second.reply_to_comment(root.id, "still here", "u2").await.unwrap();
        assert_eq!(reply.parent_id, Some(root.id));
        let page = second.get_comments("c1", &CommentFilter::default()).await.unwrap();
        assert_eq!(page.total, 2);
    }
}
