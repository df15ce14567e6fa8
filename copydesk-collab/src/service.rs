//! Facade over the collaboration core.
//!
//! [`CollabService`] owns one instance of every component, all sharing the
//! same [`ChannelMap`] and [`BroadcastHub`]. Every public operation reports
//! to the [`Instrumentation`] hook under a fixed span name, whether it
//! succeeds or fails.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broadcast::{BroadcastHub, BroadcastStats, Connection};
use crate::broker::{ConflictResolution, ConflictResolutionRequest, EditBroker, EditOutcome};
use crate::channel::ChannelMap;
use crate::collaborators::{
    AllowAll, AssumeReady, ContentFetcher, Instrumentation, LogInstrumentation, PermissionResolver,
};
use crate::comments::{Comment, CommentDraft, CommentFilter, CommentManager, CommentNode, CommentPage};
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::oplog::{EditRequest, Operation};
use crate::presence::{PresenceEntry, PresenceTracker};
use crate::session::{SelectionRange, SessionInfo, SessionRegistry, SessionSnapshot, StartOptions};
use crate::storage::{open_store, CollabStore, MemoryStore, StoreError};
use crate::sweeper::SessionSweeper;
use crate::transform;
use crate::workflow::{Decision, WorkflowEngine, WorkflowInstance, WorkflowKind, WorkflowOptions};

pub struct CollabServiceBuilder {
    config: CollabConfig,
    store: Option<Arc<dyn CollabStore>>,
    permissions: Arc<dyn PermissionResolver>,
    content: Arc<dyn ContentFetcher>,
    instrumentation: Arc<dyn Instrumentation>,
}

impl CollabServiceBuilder {
    pub fn new(config: CollabConfig) -> Self {
        Self {
            config,
            store: None,
            permissions: Arc::new(AllowAll),
            content: Arc::new(AssumeReady),
            instrumentation: Arc::new(LogInstrumentation),
        }
    }

    /// Use `store` instead of opening the configured one.
    pub fn store(mut self, store: Arc<dyn CollabStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionResolver>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn content(mut self, content: Arc<dyn ContentFetcher>) -> Self {
        self.content = content;
        self
    }

    pub fn instrumentation(mut self, instrumentation: Arc<dyn Instrumentation>) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    pub fn build(mut self) -> Result<CollabService, StoreError> {
        let store = match self.store.take() {
            Some(store) => store,
            None => open_store(&self.config)?,
        };
        Ok(self.assemble(store))
    }

    fn assemble(self, store: Arc<dyn CollabStore>) -> CollabService {
        let config = Arc::new(self.config);
        let channels = Arc::new(ChannelMap::new(config.history_cap));
        let hub = Arc::new(BroadcastHub::new(channels.clone()));

        let registry = Arc::new(SessionRegistry::new(
            config.clone(),
            channels.clone(),
            hub.clone(),
            store.clone(),
            self.permissions.clone(),
        ));
        let presence = PresenceTracker::new(channels.clone(), hub.clone());
        let broker = EditBroker::new(
            config.clone(),
            channels.clone(),
            hub.clone(),
            store.clone(),
            transform::for_mode(config.transform),
        );
        let comments = CommentManager::new(
            config.clone(),
            channels.clone(),
            hub.clone(),
            store.clone(),
            self.permissions,
        );
        let workflows = WorkflowEngine::new(channels.clone(), hub.clone(), store.clone(), self.content);

        log::info!(
            "Collaboration core ready (transform: {}, session timeout: {:?})",
            broker.transform_name(),
            config.session_timeout
        );

        CollabService {
            config,
            channels,
            hub,
            store,
            registry,
            presence,
            broker,
            comments,
            workflows,
            instrumentation: self.instrumentation,
        }
    }
}

pub struct CollabService {
    config: Arc<CollabConfig>,
    channels: Arc<ChannelMap>,
    hub: Arc<BroadcastHub>,
    store: Arc<dyn CollabStore>,
    registry: Arc<SessionRegistry>,
    presence: PresenceTracker,
    broker: EditBroker,
    comments: CommentManager,
    workflows: WorkflowEngine,
    instrumentation: Arc<dyn Instrumentation>,
}

impl CollabService {
    pub fn builder(config: CollabConfig) -> CollabServiceBuilder {
        CollabServiceBuilder::new(config)
    }

    /// In-memory service with default collaborators.
    pub fn in_memory(config: CollabConfig) -> Self {
        Self::builder(config).assemble(Arc::new(MemoryStore::new()))
    }

    async fn instrumented<T, F>(&self, span: &'static str, fut: F) -> CollabResult<T>
    where
        F: Future<Output = CollabResult<T>>,
    {
        let started = Instant::now();
        let result = fut.await;
        self.instrumentation
            .record(span, result.as_ref().map(|_| ()), started.elapsed());
        result
    }

    async fn content_of_session(&self, session_id: Uuid) -> CollabResult<String> {
        self.registry
            .content_of(session_id)
            .await
            .ok_or_else(|| CollabError::not_found("session", session_id))
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    /// A fresh outbound queue sized by the configured connection buffer.
    pub fn new_connection(&self) -> (Connection, mpsc::Receiver<Arc<str>>) {
        Connection::channel(self.config.connection_buffer)
    }

    pub fn sweeper(&self) -> SessionSweeper {
        SessionSweeper::new(
            self.registry.clone(),
            self.channels.clone(),
            self.store.clone(),
            self.config.sweep_interval,
        )
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.hub.stats()
    }

    pub async fn session_count(&self) -> usize {
        self.registry.session_count().await
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.len().await
    }

    // Sessions

    pub async fn start_session(
        &self,
        content_id: &str,
        user_id: &str,
        options: StartOptions,
    ) -> CollabResult<SessionSnapshot> {
        self.instrumented(
            "session.start",
            self.registry.start_session(content_id, user_id, options),
        )
        .await
    }

    pub async fn join_session(
        &self,
        session_id: Uuid,
        user_id: &str,
        connection: Connection,
    ) -> CollabResult<SessionSnapshot> {
        self.instrumented(
            "session.join",
            self.registry.join_session(session_id, user_id, connection),
        )
        .await
    }

    pub async fn leave_session(&self, session_id: Uuid, user_id: &str) -> CollabResult<bool> {
        self.instrumented("session.leave", self.registry.leave_session(session_id, user_id))
            .await
    }

    /// Mark a session disconnected once its connection is gone.
    pub async fn disconnect(&self, session_id: Uuid, connection_id: Uuid) -> CollabResult<bool> {
        self.instrumented("session.disconnect", async {
            Ok(self.registry.detach_connection(session_id, connection_id).await)
        })
        .await
    }

    pub async fn session_info(&self, session_id: Uuid) -> CollabResult<SessionInfo> {
        self.instrumented("session.info", self.registry.session_info(session_id))
            .await
    }

    /// Record activity and return the head sequence of the session's content.
    pub async fn heartbeat(&self, session_id: Uuid) -> CollabResult<u64> {
        self.instrumented("session.heartbeat", async {
            let content_id = self.content_of_session(session_id).await?;
            self.registry.touch(session_id).await?;
            let head = self
                .channels
                .read(&content_id)
                .await
                .map_or(0, |channel| channel.log.head());
            Ok::<_, CollabError>(head)
        })
        .await
    }

    pub async fn undo(&self, session_id: Uuid) -> CollabResult<Option<u64>> {
        self.instrumented("session.undo", self.registry.undo(session_id))
            .await
    }

    pub async fn redo(&self, session_id: Uuid) -> CollabResult<Option<u64>> {
        self.instrumented("session.redo", self.registry.redo(session_id))
            .await
    }

    // Presence

    pub async fn get_active_users(&self, content_id: &str) -> CollabResult<Vec<PresenceEntry>> {
        self.instrumented("presence.active_users", async {
            Ok(self.presence.get_active_users(content_id).await)
        })
        .await
    }

    pub async fn update_cursor(
        &self,
        session_id: Uuid,
        cursor: usize,
        selection: Option<SelectionRange>,
    ) -> CollabResult<PresenceEntry> {
        self.instrumented("presence.cursor", async {
            let content_id = self.content_of_session(session_id).await?;
            self.presence
                .update_cursor(&content_id, session_id, cursor, selection)
                .await
        })
        .await
    }

    // Operations

    pub async fn broadcast_edit(
        &self,
        session_id: Uuid,
        request: EditRequest,
    ) -> CollabResult<EditOutcome> {
        self.instrumented("edit.broadcast", async {
            let content_id = self.content_of_session(session_id).await?;
            self.broker.broadcast_edit(&content_id, session_id, request).await
        })
        .await
    }

    pub async fn resolve_conflicts(
        &self,
        session_id: Uuid,
        requests: Vec<ConflictResolutionRequest>,
    ) -> CollabResult<Vec<ConflictResolution>> {
        self.instrumented("edit.resolve_conflicts", async {
            let content_id = self.content_of_session(session_id).await?;
            self.broker
                .resolve_conflicts(&content_id, session_id, requests)
                .await
        })
        .await
    }

    pub async fn operations_since(&self, content_id: &str, since: u64) -> CollabResult<Vec<Operation>> {
        self.instrumented("edit.since", async {
            Ok(self.broker.operations_since(content_id, since).await)
        })
        .await
    }

    // Comments

    pub async fn add_comment(
        &self,
        content_id: &str,
        draft: CommentDraft,
        user_id: &str,
    ) -> CollabResult<Comment> {
        self.instrumented(
            "comment.add",
            self.comments.add_comment(content_id, draft, user_id),
        )
        .await
    }

    pub async fn reply_to_comment(
        &self,
        comment_id: Uuid,
        text: &str,
        user_id: &str,
    ) -> CollabResult<Comment> {
        self.instrumented(
            "comment.reply",
            self.comments.reply_to_comment(comment_id, text, user_id),
        )
        .await
    }

    pub async fn resolve_comment(
        &self,
        comment_id: Uuid,
        note: Option<String>,
        user_id: &str,
    ) -> CollabResult<Comment> {
        self.instrumented(
            "comment.resolve",
            self.comments.resolve_comment(comment_id, note, user_id),
        )
        .await
    }

    pub async fn get_comments(
        &self,
        content_id: &str,
        filter: &CommentFilter,
    ) -> CollabResult<CommentPage> {
        self.instrumented("comment.list", self.comments.get_comments(content_id, filter))
            .await
    }

    pub async fn get_comment(&self, comment_id: Uuid) -> CollabResult<Comment> {
        self.instrumented("comment.get", self.comments.get_comment(comment_id))
            .await
    }

    pub async fn comment_tree(&self, content_id: &str) -> CollabResult<Vec<CommentNode>> {
        self.instrumented("comment.tree", self.comments.comment_tree(content_id))
            .await
    }

    // Workflows

    pub async fn initialize_workflow(
        &self,
        content_id: &str,
        kind: WorkflowKind,
        options: WorkflowOptions,
    ) -> CollabResult<WorkflowInstance> {
        self.instrumented(
            "workflow.initialize",
            self.workflows.initialize_workflow(content_id, kind, options),
        )
        .await
    }

    pub async fn advance_workflow(
        &self,
        workflow_id: Uuid,
        decision: Decision,
        user_id: &str,
    ) -> CollabResult<WorkflowInstance> {
        self.instrumented(
            "workflow.advance",
            self.workflows.advance_workflow(workflow_id, decision, user_id),
        )
        .await
    }

    pub async fn cancel_workflow(
        &self,
        workflow_id: Uuid,
        user_id: &str,
        reason: Option<String>,
    ) -> CollabResult<WorkflowInstance> {
        self.instrumented(
            "workflow.cancel",
            self.workflows.cancel_workflow(workflow_id, user_id, reason),
        )
        .await
    }

    pub async fn get_workflow_status(&self, content_id: &str) -> CollabResult<Option<WorkflowInstance>> {
        self.instrumented("workflow.status", self.workflows.get_workflow_status(content_id))
            .await
    }

    pub async fn get_workflow(&self, workflow_id: Uuid) -> CollabResult<WorkflowInstance> {
        self.instrumented("workflow.get", self.workflows.get_workflow(workflow_id))
            .await
    }

    pub async fn workflow_history(&self, content_id: &str) -> CollabResult<Vec<WorkflowInstance>> {
        self.instrumented("workflow.history", self.workflows.workflow_history(content_id))
            .await
    }
}
