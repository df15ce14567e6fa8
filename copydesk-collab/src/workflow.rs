//! Multi-step approval workflows.
//!
//! ```text
//!            approve/accept (not last)
//!              ┌─────────┐
//!              ▼         │
//!  init ──► Active{step} ─┤── approve/accept on last step ──► Completed
//!              ▲         │
//!              │         ├── reject, policy = end ──────────► Cancelled
//!              └─────────┤
//!       reject, reset    └── request_changes: stays on step
//! ```
//!
//! A content item has at most one active instance. Terminal instances are
//! retired but stay queryable; any later decision on them is refused.
//! Decisions are applied to a copy that replaces the live instance only
//! after it was persisted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broadcast::BroadcastHub;
use crate::channel::{ChannelMap, ChannelReadGuard, ChannelState};
use crate::collaborators::ContentFetcher;
use crate::error::{CollabError, CollabResult};
use crate::now_millis;
use crate::protocol::ServerEvent;
use crate::storage::{pack_json, unpack_json, CollabStore, WorkflowRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// review → approve
    Review,
    /// pre_publish_check → publish
    Publish,
    /// approve
    SingleApproval,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Publish => "publish",
            Self::SingleApproval => "single_approval",
        }
    }

    /// Step blueprints: name, accepted actions, reject policy, precondition.
    fn blueprint(&self) -> Vec<(&'static str, Vec<DecisionAction>, RejectPolicy, Option<Precondition>)> {
        use DecisionAction::*;
        match self {
            Self::Review => vec![
                ("review", vec![Approve, Reject, RequestChanges], RejectPolicy::Reset, None),
                ("approve", vec![Approve, Reject], RejectPolicy::End, None),
            ],
            Self::Publish => vec![
                (
                    "pre_publish_check",
                    vec![Accept, Reject],
                    RejectPolicy::End,
                    Some(Precondition::ContentReady),
                ),
                ("publish", vec![Approve, Reject], RejectPolicy::Reset, None),
            ],
            Self::SingleApproval => vec![(
                "approve",
                vec![Approve, Reject, RequestChanges],
                RejectPolicy::End,
                None,
            )],
        }
    }

    /// Build the step list for this template.
    pub fn steps(&self, options: &WorkflowOptions) -> CollabResult<Vec<WorkflowStep>> {
        self.blueprint()
            .into_iter()
            .map(|(name, accepts, on_reject, precondition)| {
                let assignees: BTreeSet<String> = options
                    .assignees
                    .get(name)
                    .unwrap_or(&options.default_assignees)
                    .iter()
                    .filter(|a| !a.is_empty())
                    .cloned()
                    .collect();
                if assignees.is_empty() {
                    return Err(CollabError::Validation(format!(
                        "step '{name}' of a {} workflow has no assignees",
                        self.as_str()
                    )));
                }
                Ok(WorkflowStep {
                    name: name.to_string(),
                    accepts,
                    assignees,
                    on_reject: options.reject_policy.unwrap_or(on_reject),
                    precondition,
                })
            })
            .collect()
    }
}

impl FromStr for WorkflowKind {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "review" => Ok(Self::Review),
            "publish" => Ok(Self::Publish),
            "single_approval" => Ok(Self::SingleApproval),
            other => Err(CollabError::Validation(format!("unknown workflow kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectPolicy {
    /// Go back to the first step
    Reset,
    /// Cancel the workflow
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    /// Content must exist with a title and a non-empty body
    ContentReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Accept,
    Reject,
    RequestChanges,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::RequestChanges => "request_changes",
        }
    }

    pub fn is_affirmative(&self) -> bool {
        matches!(self, Self::Approve | Self::Accept)
    }
}

impl FromStr for DecisionAction {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "accept" => Ok(Self::Accept),
            "reject" => Ok(Self::Reject),
            "request_changes" => Ok(Self::RequestChanges),
            other => Err(CollabError::InvalidDecision(format!("unknown decision '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub accepts: Vec<DecisionAction>,
    pub assignees: BTreeSet<String>,
    pub on_reject: RejectPolicy,
    pub precondition: Option<Precondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Completed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl FromStr for WorkflowStatus {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CollabError::Validation(format!("unknown workflow status '{other}'"))),
        }
    }
}

/// A decision as submitted by an assignee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: String,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Decision {
    pub fn new(action: DecisionAction) -> Self {
        Self {
            action: action.as_str().to_string(),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Advanced,
    Completed,
    Reset,
    Cancelled,
    ChangesRequested,
    /// A step precondition did not hold; nothing moved
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub step: usize,
    pub step_name: String,
    pub user_id: String,
    pub action: String,
    pub comment: Option<String>,
    pub outcome: DecisionOutcome,
    pub decided_at: u64,
}

/// Template parameters for a new workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOptions {
    /// Assignees per step name
    #[serde(default)]
    pub assignees: HashMap<String, Vec<String>>,
    /// Assignees for steps not listed in `assignees`
    #[serde(default)]
    pub default_assignees: Vec<String>,
    /// Overrides every step's reject policy
    #[serde(default)]
    pub reject_policy: Option<RejectPolicy>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl WorkflowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign<I, S>(mut self, step: &str, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assignees
            .insert(step.to_string(), users.into_iter().map(Into::into).collect());
        self
    }

    pub fn created_by(mut self, user_id: impl Into<String>) -> Self {
        self.created_by = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub content_id: String,
    pub kind: WorkflowKind,
    pub steps: Vec<WorkflowStep>,
    pub current_step: usize,
    pub status: WorkflowStatus,
    pub decisions: Vec<DecisionRecord>,
    pub created_by: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Serialized step and decision data of a persisted workflow.
#[derive(Serialize, Deserialize)]
struct WorkflowData {
    steps: Vec<WorkflowStep>,
    decisions: Vec<DecisionRecord>,
    created_by: Option<String>,
    created_at: u64,
}

impl WorkflowInstance {
    pub fn new(
        content_id: &str,
        kind: WorkflowKind,
        steps: Vec<WorkflowStep>,
        created_by: Option<String>,
        now: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_id: content_id.to_string(),
            kind,
            steps,
            current_step: 0,
            status: WorkflowStatus::Active,
            decisions: Vec::new(),
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// The step awaiting a decision, while active.
    pub fn active_step(&self) -> Option<&WorkflowStep> {
        match self.status {
            WorkflowStatus::Active => self.steps.get(self.current_step),
            _ => None,
        }
    }

    /// Check that `user_id` may submit `action` on the current step.
    pub fn check_decision(&self, user_id: &str, action: &str) -> CollabResult<DecisionAction> {
        let step = self.active_step().ok_or_else(|| {
            CollabError::InvalidDecision(format!(
                "workflow {} is {} and accepts no decisions",
                self.id,
                self.status.as_str()
            ))
        })?;
        if !step.assignees.contains(user_id) {
            return Err(CollabError::Forbidden(format!(
                "user {user_id} is not assigned to step '{}'",
                step.name
            )));
        }
        let action: DecisionAction = action.parse()?;
        if !step.accepts.contains(&action) {
            return Err(CollabError::InvalidDecision(format!(
                "step '{}' does not accept '{}'",
                step.name,
                action.as_str()
            )));
        }
        Ok(action)
    }

    /// Apply a decision and log it.
    pub fn apply(&mut self, user_id: &str, decision: &Decision, now: u64) -> CollabResult<DecisionOutcome> {
        let action = self.check_decision(user_id, &decision.action)?;
        let step = self.current_step;
        let on_reject = self.steps[step].on_reject;

        let outcome = match action {
            DecisionAction::Approve | DecisionAction::Accept => {
                self.current_step += 1;
                if self.current_step == self.total_steps() {
                    self.status = WorkflowStatus::Completed;
                    DecisionOutcome::Completed
                } else {
                    DecisionOutcome::Advanced
                }
            }
            DecisionAction::Reject => match on_reject {
                RejectPolicy::Reset => {
                    self.current_step = 0;
                    DecisionOutcome::Reset
                }
                RejectPolicy::End => {
                    self.status = WorkflowStatus::Cancelled;
                    DecisionOutcome::Cancelled
                }
            },
            DecisionAction::RequestChanges => DecisionOutcome::ChangesRequested,
        };

        self.log_decision(step, user_id, action.as_str(), decision.comment.clone(), outcome, now);
        Ok(outcome)
    }

    /// Log a decision that was refused by a step precondition.
    pub fn record_blocked(&mut self, user_id: &str, decision: &Decision, now: u64) {
        self.log_decision(
            self.current_step,
            user_id,
            &decision.action,
            decision.comment.clone(),
            DecisionOutcome::Blocked,
            now,
        );
    }

    /// Cancel regardless of the current step.
    ///
    /// Allowed for the creator and for assignees of the current step.
    pub fn cancel(&mut self, user_id: &str, reason: Option<String>, now: u64) -> CollabResult<()> {
        let Some(step) = self.active_step() else {
            return Err(CollabError::InvalidDecision(format!(
                "workflow {} is already {}",
                self.id,
                self.status.as_str()
            )));
        };
        let is_creator = self.created_by.as_deref() == Some(user_id);
        if !is_creator && !step.assignees.contains(user_id) {
            return Err(CollabError::Forbidden(format!(
                "user {user_id} may not cancel workflow {}",
                self.id
            )));
        }
        self.status = WorkflowStatus::Cancelled;
        self.log_decision(self.current_step, user_id, "cancel", reason, DecisionOutcome::Cancelled, now);
        Ok(())
    }

    fn log_decision(
        &mut self,
        step: usize,
        user_id: &str,
        action: &str,
        comment: Option<String>,
        outcome: DecisionOutcome,
        now: u64,
    ) {
        let step_name = self
            .steps
            .get(step)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        self.decisions.push(DecisionRecord {
            step,
            step_name,
            user_id: user_id.to_string(),
            action: action.to_string(),
            comment,
            outcome,
            decided_at: now,
        });
        self.updated_at = now;
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            content_id: self.content_id.clone(),
            kind: self.kind,
            current_step: self.current_step,
            total_steps: self.total_steps(),
            step_name: self.active_step().map(|s| s.name.clone()),
            assignees: self
                .active_step()
                .map(|s| s.assignees.iter().cloned().collect())
                .unwrap_or_default(),
            status: self.status,
            updated_at: self.updated_at,
        }
    }

    pub fn to_record(&self) -> CollabResult<WorkflowRecord> {
        let data = WorkflowData {
            steps: self.steps.clone(),
            decisions: self.decisions.clone(),
            created_by: self.created_by.clone(),
            created_at: self.created_at,
        };
        let assignees: BTreeSet<String> = self
            .steps
            .iter()
            .flat_map(|s| s.assignees.iter().cloned())
            .collect();
        Ok(WorkflowRecord {
            workflow_id: self.id,
            content_id: self.content_id.clone(),
            kind: self.kind.as_str().to_string(),
            current_step: self.current_step as u64,
            total_steps: self.total_steps() as u64,
            data: pack_json(&data)?,
            assignees: assignees.into_iter().collect(),
            status: self.status.as_str().to_string(),
            updated_at: self.updated_at,
        })
    }

    pub fn from_record(record: &WorkflowRecord) -> CollabResult<Self> {
        let data: WorkflowData = unpack_json(&record.data)?;
        Ok(Self {
            id: record.workflow_id,
            content_id: record.content_id.clone(),
            kind: record.kind.parse()?,
            steps: data.steps,
            current_step: record.current_step as usize,
            status: record.status.parse()?,
            decisions: data.decisions,
            created_by: data.created_by,
            created_at: data.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// Compact view broadcast in `workflow_updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub content_id: String,
    pub kind: WorkflowKind,
    pub current_step: usize,
    pub total_steps: usize,
    pub step_name: Option<String>,
    pub assignees: Vec<String>,
    pub status: WorkflowStatus,
    pub updated_at: u64,
}

pub struct WorkflowEngine {
    channels: Arc<ChannelMap>,
    hub: Arc<BroadcastHub>,
    store: Arc<dyn CollabStore>,
    content: Arc<dyn ContentFetcher>,
    /// workflow id → content id
    owners: RwLock<HashMap<Uuid, String>>,
}

impl WorkflowEngine {
    pub fn new(
        channels: Arc<ChannelMap>,
        hub: Arc<BroadcastHub>,
        store: Arc<dyn CollabStore>,
        content: Arc<dyn ContentFetcher>,
    ) -> Self {
        Self {
            channels,
            hub,
            store,
            content,
            owners: RwLock::new(HashMap::new()),
        }
    }

    pub async fn initialize_workflow(
        &self,
        content_id: &str,
        kind: WorkflowKind,
        options: WorkflowOptions,
    ) -> CollabResult<WorkflowInstance> {
        let steps = kind.steps(&options)?;

        let mut channel = self.channels.write(content_id).await;
        self.ensure_loaded(&mut channel).await?;
        if let Some(existing) = &channel.workflow {
            return Err(CollabError::already_exists("workflow", existing.id));
        }

        let instance = WorkflowInstance::new(content_id, kind, steps, options.created_by, now_millis());
        self.store.put_workflow(&instance.to_record()?).await?;
        self.owners
            .write()
            .await
            .insert(instance.id, content_id.to_string());

        log::info!(
            "Workflow {} ({}) started on {content_id} with {} step(s)",
            instance.id,
            kind.as_str(),
            instance.total_steps()
        );

        let exclude = instance
            .created_by
            .as_deref()
            .and_then(|u| channel.session_of_user(u));
        channel.workflow = Some(instance.clone());
        let event = ServerEvent::WorkflowUpdated {
            workflow: instance.summary(),
            decision: None,
        };
        self.hub.deliver(&mut channel.sessions, &event, exclude);

        Ok(instance)
    }

    pub async fn advance_workflow(
        &self,
        workflow_id: Uuid,
        decision: Decision,
        user_id: &str,
    ) -> CollabResult<WorkflowInstance> {
        let content_id = self.content_of(workflow_id).await?;
        let mut channel = self.channels.write(&content_id).await;
        self.ensure_loaded(&mut channel).await?;

        let mut next = Self::live_instance(&channel, workflow_id)?.clone();
        let action = next.check_decision(user_id, &decision.action)?;
        let now = now_millis();

        let precondition = next.active_step().and_then(|s| s.precondition);
        if action.is_affirmative() && precondition == Some(Precondition::ContentReady) {
            let ready = self
                .content
                .fetch_content(&content_id)
                .await?
                .is_some_and(|c| c.is_ready());
            if !ready {
                next.record_blocked(user_id, &decision, now);
                self.store.put_workflow(&next.to_record()?).await?;
                channel.workflow = Some(next);
                log::info!("Workflow {workflow_id} blocked: content {content_id} is not ready");
                return Err(CollabError::Validation(format!(
                    "content {content_id} is not ready for publishing"
                )));
            }
        }

        let outcome = next.apply(user_id, &decision, now)?;
        self.store.put_workflow(&next.to_record()?).await?;

        log::info!(
            "Workflow {workflow_id}: {user_id} decided '{}' -> {outcome:?} (step {}/{})",
            decision.action,
            next.current_step,
            next.total_steps()
        );

        let record = next.decisions.last().cloned();
        Self::replace_live(&mut channel, next.clone());

        let exclude = channel.session_of_user(user_id);
        let event = ServerEvent::WorkflowUpdated {
            workflow: next.summary(),
            decision: record,
        };
        self.hub.deliver(&mut channel.sessions, &event, exclude);

        Ok(next)
    }

    /// Cancel an active workflow on behalf of its creator or a current assignee.
    pub async fn cancel_workflow(
        &self,
        workflow_id: Uuid,
        user_id: &str,
        reason: Option<String>,
    ) -> CollabResult<WorkflowInstance> {
        let content_id = self.content_of(workflow_id).await?;
        let mut channel = self.channels.write(&content_id).await;
        self.ensure_loaded(&mut channel).await?;

        let mut next = Self::live_instance(&channel, workflow_id)?.clone();
        next.cancel(user_id, reason, now_millis())?;
        self.store.put_workflow(&next.to_record()?).await?;

        log::info!("Workflow {workflow_id} on {content_id} cancelled by {user_id}");

        let record = next.decisions.last().cloned();
        Self::replace_live(&mut channel, next.clone());

        let exclude = channel.session_of_user(user_id);
        let event = ServerEvent::WorkflowUpdated {
            workflow: next.summary(),
            decision: record,
        };
        self.hub.deliver(&mut channel.sessions, &event, exclude);

        Ok(next)
    }

    /// The active workflow on a content item, if any.
    pub async fn get_workflow_status(&self, content_id: &str) -> CollabResult<Option<WorkflowInstance>> {
        let channel = self.loaded_view(content_id).await?;
        Ok(channel.workflow.clone())
    }

    /// Any workflow by id, active or retired.
    pub async fn get_workflow(&self, workflow_id: Uuid) -> CollabResult<WorkflowInstance> {
        let content_id = self.content_of(workflow_id).await?;
        let channel = self.loaded_view(&content_id).await?;
        channel
            .workflow
            .iter()
            .chain(channel.retired_workflows.iter())
            .find(|w| w.id == workflow_id)
            .cloned()
            .ok_or_else(|| CollabError::not_found("workflow", workflow_id))
    }

    /// Retired workflows oldest first, then the active one.
    pub async fn workflow_history(&self, content_id: &str) -> CollabResult<Vec<WorkflowInstance>> {
        let channel = self.loaded_view(content_id).await?;
        Ok(channel
            .retired_workflows
            .iter()
            .chain(channel.workflow.iter())
            .cloned()
            .collect())
    }

    /// The active instance with `workflow_id`; retired ones refuse decisions.
    fn live_instance(channel: &ChannelState, workflow_id: Uuid) -> CollabResult<&WorkflowInstance> {
        match &channel.workflow {
            Some(w) if w.id == workflow_id => Ok(w),
            _ => match channel.retired_workflows.iter().find(|w| w.id == workflow_id) {
                Some(w) => Err(CollabError::InvalidDecision(format!(
                    "workflow {workflow_id} is {} and accepts no decisions",
                    w.status.as_str()
                ))),
                None => Err(CollabError::not_found("workflow", workflow_id)),
            },
        }
    }

    fn replace_live(channel: &mut ChannelState, instance: WorkflowInstance) {
        if instance.status.is_terminal() {
            channel.workflow = None;
            channel.retired_workflows.push(instance);
        } else {
            channel.workflow = Some(instance);
        }
    }

    async fn loaded_view(&self, content_id: &str) -> CollabResult<ChannelReadGuard> {
        if let Some(channel) = self.channels.read(content_id).await {
            if channel.workflows_loaded {
                return Ok(channel);
            }
        }
        let mut channel = self.channels.write(content_id).await;
        self.ensure_loaded(&mut channel).await?;
        Ok(channel.downgrade())
    }

    async fn ensure_loaded(&self, channel: &mut ChannelState) -> CollabResult<()> {
        if channel.workflows_loaded {
            return Ok(());
        }
        let records = self.store.list_workflows(&channel.content_id).await?;
        let mut instances = Vec::with_capacity(records.len());
        for record in &records {
            instances.push(WorkflowInstance::from_record(record)?);
        }
        instances.sort_by_key(|w| w.created_at);

        {
            let mut owners = self.owners.write().await;
            for instance in &instances {
                owners.insert(instance.id, instance.content_id.clone());
            }
        }
        for instance in instances {
            if instance.status.is_terminal() {
                channel.retired_workflows.push(instance);
            } else if channel.workflow.is_none() {
                channel.workflow = Some(instance);
            } else {
                log::warn!(
                    "Content {} has more than one active workflow in storage, ignoring {}",
                    channel.content_id,
                    instance.id
                );
            }
        }
        channel.workflows_loaded = true;
        Ok(())
    }

    async fn content_of(&self, workflow_id: Uuid) -> CollabResult<String> {
        if let Some(content_id) = self.owners.read().await.get(&workflow_id) {
            return Ok(content_id.clone());
        }
        let record = self
            .store
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| CollabError::not_found("workflow", workflow_id))?;
        self.owners
            .write()
            .await
            .insert(workflow_id, record.content_id.clone());
        Ok(record.content_id)
    }
}
