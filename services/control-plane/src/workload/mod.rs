//! Versioned workload store.
//!
//! Fine-tuning jobs, batch jobs and notebooks are rows of one shape: a
//! serialized payload plus `state`, an optional `queued_action` that only
//! means something while the row is Queued, and a `version` bumped by exactly
//! one on every successful update. Every mutation after `create` is a
//! compare-and-swap on `(id, version)` whose precondition comes from the
//! kind's [`KindDescriptor`]. A stale version is a [`StoreError::ConcurrentUpdate`]
//! and leaves the row untouched.

mod batch_job;
mod job;
mod memory;
mod notebook;
mod transition;

pub use batch_job::{BatchJob, BATCH_JOB};
pub use job::{FineTuningJob, Hyperparameters, FINE_TUNING_JOB};
pub use memory::MemoryWorkloadStore;
pub use notebook::{Notebook, NOTEBOOK};
pub use transition::{ActionRule, KindDescriptor, Origin, StateRule};
pub(crate) use transition::origin_filter;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    FineTuningJob,
    BatchJob,
    Notebook,
}

impl WorkloadKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::FineTuningJob => "fine_tuning_job",
            WorkloadKind::BatchJob => "batch_job",
            WorkloadKind::Notebook => "notebook",
        }
    }

    pub fn descriptor(&self) -> &'static KindDescriptor {
        match self {
            WorkloadKind::FineTuningJob => &FINE_TUNING_JOB,
            WorkloadKind::BatchJob => &BATCH_JOB,
            WorkloadKind::Notebook => &NOTEBOOK,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadState {
    Queued,
    Initializing,
    Running,
    Stopping,
    Stopped,
    Requeued,
    Succeeded,
    Failed,
    Canceled,
    Deleted,
}

impl WorkloadState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            WorkloadState::Queued => "queued",
            WorkloadState::Initializing => "initializing",
            WorkloadState::Running => "running",
            WorkloadState::Stopping => "stopping",
            WorkloadState::Stopped => "stopped",
            WorkloadState::Requeued => "requeued",
            WorkloadState::Succeeded => "succeeded",
            WorkloadState::Failed => "failed",
            WorkloadState::Canceled => "canceled",
            WorkloadState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => WorkloadState::Queued,
            "initializing" => WorkloadState::Initializing,
            "running" => WorkloadState::Running,
            "stopping" => WorkloadState::Stopping,
            "stopped" => WorkloadState::Stopped,
            "requeued" => WorkloadState::Requeued,
            "succeeded" => WorkloadState::Succeeded,
            "failed" => WorkloadState::Failed,
            "canceled" => WorkloadState::Canceled,
            "deleted" => WorkloadState::Deleted,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkloadState::Succeeded
                | WorkloadState::Failed
                | WorkloadState::Canceled
                | WorkloadState::Deleted
        )
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a Queued row should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedAction {
    Create,
    Cancel,
    Delete,
    Start,
    Stop,
    Requeue,
}

impl QueuedAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueuedAction::Create => "create",
            QueuedAction::Cancel => "cancel",
            QueuedAction::Delete => "delete",
            QueuedAction::Start => "start",
            QueuedAction::Stop => "stop",
            QueuedAction::Requeue => "requeue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "create" => QueuedAction::Create,
            "cancel" => QueuedAction::Cancel,
            "delete" => QueuedAction::Delete,
            "start" => QueuedAction::Start,
            "stop" => QueuedAction::Stop,
            "requeue" => QueuedAction::Requeue,
            _ => return None,
        })
    }

    /// Status shown to users while the action is pending.
    pub const fn pending_status(&self) -> &'static str {
        match self {
            QueuedAction::Create => "creating",
            QueuedAction::Cancel => "canceling",
            QueuedAction::Delete => "deleting",
            QueuedAction::Start => "starting",
            QueuedAction::Stop => "stopping",
            QueuedAction::Requeue => "requeueing",
        }
    }
}

impl fmt::Display for QueuedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a workload was scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub cluster_id: String,
    #[serde(default)]
    pub cluster_name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub gpu_count: u32,
}

/// Failure detail stamped into a payload when a workload fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadFailure {
    pub code: String,
    pub message: String,
}

/// Kind-specific body of a workload row.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: WorkloadKind;

    /// Mints a fresh, time-ordered identifier for this kind.
    fn new_id() -> String;

    fn placement(&self) -> &Placement;

    fn set_placement(&mut self, placement: Placement);

    fn gpu_count(&self) -> u32;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workload<P> {
    pub id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub cluster_id: Option<String>,
    pub payload: P,
    pub state: WorkloadState,
    pub queued_action: Option<QueuedAction>,
    pub reason: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<P: Payload> Workload<P> {
    /// A new row in Queued with the kind's initial action, at version 0.
    pub fn new(
        id: String,
        tenant_id: impl Into<String>,
        project_id: impl Into<String>,
        payload: P,
        now: DateTime<Utc>,
    ) -> Self {
        let cluster_id = Some(payload.placement().cluster_id.clone()).filter(|c| !c.is_empty());
        Self {
            id,
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
            cluster_id,
            payload,
            state: WorkloadState::Queued,
            queued_action: Some(P::KIND.descriptor().initial_action),
            reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        P::KIND
    }

    pub fn is_queued_with(&self, action: QueuedAction) -> bool {
        self.state == WorkloadState::Queued && self.queued_action == Some(action)
    }

    /// User-visible status: the pending action while Queued, else the state.
    pub fn status(&self) -> &'static str {
        match (self.state, self.queued_action) {
            (WorkloadState::Queued, Some(action)) => action.pending_status(),
            (state, _) => state.as_str(),
        }
    }

    /// `namespace/id`, the key assumed placements are recorded under.
    pub fn assumed_pod_key(&self) -> String {
        format!("{}/{}", self.payload.placement().namespace, self.id)
    }
}

/// Optional changes written together with a state or action update.
///
/// `reason` is always written, so leaving it `None` clears it.
#[derive(Debug, Clone)]
pub struct WorkloadUpdate<P> {
    pub payload: Option<P>,
    pub reason: Option<String>,
    pub cluster_id: Option<String>,
}

impl<P> Default for WorkloadUpdate<P> {
    fn default() -> Self {
        Self {
            payload: None,
            reason: None,
            cluster_id: None,
        }
    }
}

impl<P> WorkloadUpdate<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Page<P> {
    pub items: Vec<Workload<P>>,
    pub has_more: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: WorkloadKind, id: String },

    /// The expected version no longer matches; nothing was written.
    #[error("concurrent update to {kind} {id} (expected version {expected})")]
    ConcurrentUpdate {
        kind: WorkloadKind,
        id: String,
        expected: i64,
    },

    #[error("{kind} {id}: {message}")]
    FailedPrecondition {
        kind: WorkloadKind,
        id: String,
        message: String,
    },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: WorkloadKind, id: String },

    #[error("corrupt {kind} row {id}: {message}")]
    Corrupt {
        kind: WorkloadKind,
        id: String,
        message: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrentUpdate { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, StoreError::FailedPrecondition { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Classifies a CAS that matched no row, given the row as it is now.
pub(crate) fn cas_failure(
    kind: WorkloadKind,
    id: &str,
    expected: i64,
    current: Option<(WorkloadState, Option<QueuedAction>, i64)>,
    target: &str,
) -> StoreError {
    match current {
        None => StoreError::NotFound {
            kind,
            id: id.to_string(),
        },
        Some((_, _, version)) if version != expected => StoreError::ConcurrentUpdate {
            kind,
            id: id.to_string(),
            expected,
        },
        Some((state, action, _)) => StoreError::FailedPrecondition {
            kind,
            id: id.to_string(),
            message: match action.filter(|_| state == WorkloadState::Queued) {
                Some(action) => format!("cannot move from {state}({action}) to {target}"),
                None => format!("cannot move from {state} to {target}"),
            },
        },
    }
}

#[async_trait]
pub trait WorkloadStore<P: Payload>: Send + Sync {
    /// Inserts a new row; fails with `AlreadyExists` on a duplicate id.
    async fn create(&self, workload: &Workload<P>) -> StoreResult<()>;

    async fn get(&self, id: &str) -> StoreResult<Workload<P>>;

    /// Like `get`, but rows of other projects are reported as not found.
    async fn get_in_project(&self, id: &str, project_id: &str) -> StoreResult<Workload<P>>;

    /// Queued rows of one (tenant, cluster), ordered by id.
    async fn list_queued(&self, tenant_id: &str, cluster_id: &str) -> StoreResult<Vec<Workload<P>>>;

    /// All rows in `state`, ordered by id.
    async fn list_by_state(&self, state: WorkloadState) -> StoreResult<Vec<Workload<P>>>;

    /// Non-deleted rows of a project, newest first, starting after `after`.
    async fn list_by_project(
        &self,
        project_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Page<P>>;

    /// Moves the row to Queued with `action`.
    async fn set_queued_action(
        &self,
        id: &str,
        expected_version: i64,
        action: QueuedAction,
        update: WorkloadUpdate<P>,
    ) -> StoreResult<Workload<P>>;

    /// Moves the row to `state`, clearing any queued action.
    async fn set_state(
        &self,
        id: &str,
        expected_version: i64,
        state: WorkloadState,
        update: WorkloadUpdate<P>,
    ) -> StoreResult<Workload<P>>;
}
