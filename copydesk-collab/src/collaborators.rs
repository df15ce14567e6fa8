//! External collaborators the core consults but does not own.
//!
//! - [`PermissionResolver`]: what a user may do on a content item
//! - [`ContentFetcher`]: content metadata for workflow preconditions
//! - [`Instrumentation`]: span hook wrapped around every public operation

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{CollabError, CollabResult};
use crate::session::Permissions;

#[async_trait]
pub trait PermissionResolver: Send + Sync {
    async fn get_user_permissions(&self, user_id: &str, content_id: &str) -> CollabResult<Permissions>;
}

/// Grants every permission to everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl PermissionResolver for AllowAll {
    async fn get_user_permissions(&self, _user_id: &str, _content_id: &str) -> CollabResult<Permissions> {
        Ok(Permissions::full())
    }
}

/// Explicit grants per (user, content item), with a fallback.
#[derive(Debug)]
pub struct PermissionTable {
    fallback: Permissions,
    grants: RwLock<HashMap<(String, String), Permissions>>,
}

impl PermissionTable {
    pub fn new(fallback: Permissions) -> Self {
        Self {
            fallback,
            grants: RwLock::new(HashMap::new()),
        }
    }

    pub async fn grant(&self, user_id: &str, content_id: &str, permissions: Permissions) {
        self.grants
            .write()
            .await
            .insert((user_id.to_string(), content_id.to_string()), permissions);
    }
}

#[async_trait]
impl PermissionResolver for PermissionTable {
    async fn get_user_permissions(&self, user_id: &str, content_id: &str) -> CollabResult<Permissions> {
        let grants = self.grants.read().await;
        Ok(grants
            .get(&(user_id.to_string(), content_id.to_string()))
            .copied()
            .unwrap_or(self.fallback))
    }
}

/// Content metadata needed to decide whether a content item can publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSummary {
    pub content_id: String,
    pub title: String,
    /// Body length in characters
    pub body_length: usize,
}

impl ContentSummary {
    pub fn is_ready(&self) -> bool {
        !self.title.trim().is_empty() && self.body_length > 0
    }
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch_content(&self, content_id: &str) -> CollabResult<Option<ContentSummary>>;
}

/// Reports every content item as ready.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeReady;

#[async_trait]
impl ContentFetcher for AssumeReady {
    async fn fetch_content(&self, content_id: &str) -> CollabResult<Option<ContentSummary>> {
        Ok(Some(ContentSummary {
            content_id: content_id.to_string(),
            title: content_id.to_string(),
            body_length: 1,
        }))
    }
}

/// In-memory content catalogue.
#[derive(Debug, Default)]
pub struct StaticContent {
    items: RwLock<HashMap<String, ContentSummary>>,
}

impl StaticContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, summary: ContentSummary) {
        self.items
            .write()
            .await
            .insert(summary.content_id.clone(), summary);
    }
}

#[async_trait]
impl ContentFetcher for StaticContent {
    async fn fetch_content(&self, content_id: &str) -> CollabResult<Option<ContentSummary>> {
        Ok(self.items.read().await.get(content_id).cloned())
    }
}

/// Receives one call per public operation, success or failure.
pub trait Instrumentation: Send + Sync {
    fn record(&self, span: &'static str, result: Result<(), &CollabError>, elapsed: Duration);
}

/// Writes spans to the log: failures at warn (expected ones at debug).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogInstrumentation;

impl Instrumentation for LogInstrumentation {
    fn record(&self, span: &'static str, result: Result<(), &CollabError>, elapsed: Duration) {
        match result {
            Ok(()) => log::debug!("{span} ok in {elapsed:?}"),
            Err(e @ (CollabError::Storage(_) | CollabError::Protocol(_))) => {
                log::warn!("{span} failed in {elapsed:?}: {e}")
            }
            Err(e) => log::debug!("{span} rejected ({}) in {elapsed:?}: {e}", e.kind()),
        }
    }
}

/// A span as seen by [`RecordingInstrumentation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanRecord {
    pub span: &'static str,
    /// Error kind, `None` on success
    pub error: Option<&'static str>,
}

/// Keeps every span in memory.
#[derive(Debug, Default)]
pub struct RecordingInstrumentation {
    spans: Mutex<Vec<SpanRecord>>,
}

impl RecordingInstrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        match self.spans.lock() {
            Ok(spans) => spans.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Instrumentation for RecordingInstrumentation {
    fn record(&self, span: &'static str, result: Result<(), &CollabError>, _elapsed: Duration) {
        let record = SpanRecord {
            span,
            error: result.err().map(CollabError::kind),
        };
        match self.spans.lock() {
            Ok(mut spans) => spans.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
