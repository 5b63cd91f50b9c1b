//! Boundary to the clusters workloads run on.
//!
//! Controllers never talk to a cluster API directly. They observe resources
//! through [`ResourceObserver`] and change them through [`ClusterExecutor`];
//! [`ClusterAgents`] implements both over HTTP and [`MockCluster`] in memory.
//! An absent resource is `Ok(None)`, not an error.

mod agent;
mod mock;

pub use agent::{AgentClient, ClusterAgents};
pub use mock::{ClusterCall, MockCluster};

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::ClusterStatus;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("resource not found: {0}")]
    NotFound(ResourceKey),

    #[error("no agent configured for cluster {0}")]
    UnknownCluster(String),

    #[error("agent request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("agent rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Identifies one cluster-side object. `name` is the workload id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    #[serde(default)]
    pub cluster_id: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        cluster_id: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.cluster_id, self.namespace, self.name)
    }
}

/// Which controller owns a cluster-side resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManagedBy {
    BatchJob,
    FineTuningJob,
    Notebook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobConditionType {
    Complete,
    Failed,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub condition_type: JobConditionType,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// A run-to-completion job as the cluster reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedJob {
    pub key: ResourceKey,
    #[serde(default)]
    pub managed_by: Option<ManagedBy>,
    /// Deletion has been requested and is in progress.
    #[serde(default)]
    pub deleting: bool,
    #[serde(default)]
    pub active: u32,
    #[serde(default)]
    pub succeeded: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
}

impl ObservedJob {
    pub fn condition(&self, condition_type: JobConditionType) -> Option<&JobCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// A long-running deployment as the cluster reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedDeployment {
    pub key: ResourceKey,
    #[serde(default)]
    pub managed_by: Option<ManagedBy>,
    #[serde(default)]
    pub deleting: bool,
    /// Desired replicas.
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
    /// Replicas that still exist, ready or not.
    #[serde(default)]
    pub status_replicas: u32,
    /// Waiting reason of the first waiting container, if any.
    #[serde(default)]
    pub waiting_reason: Option<String>,
}

/// Everything an agent needs to materialize a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub key: ResourceKey,
    pub managed_by: ManagedBy,
    pub gpu_count: u32,
    /// The workload payload; manifest rendering happens agent-side.
    pub spec: serde_json::Value,
}

/// A cluster's self-description, fetched alongside its resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterReport {
    pub name: String,
    pub status: ClusterStatus,
}

#[async_trait]
pub trait ResourceObserver: Send + Sync {
    async fn get_job(&self, key: &ResourceKey) -> ClusterResult<Option<ObservedJob>>;

    async fn list_jobs(&self, cluster_id: &str) -> ClusterResult<Vec<ObservedJob>>;

    async fn get_deployment(&self, key: &ResourceKey) -> ClusterResult<Option<ObservedDeployment>>;

    async fn list_deployments(&self, cluster_id: &str) -> ClusterResult<Vec<ObservedDeployment>>;

    async fn cluster_status(&self, cluster_id: &str) -> ClusterResult<Option<ClusterReport>>;
}

/// Mutations on cluster resources. Creating something that already exists
/// succeeds; acting on something missing is [`ClusterError::NotFound`].
#[async_trait]
pub trait ClusterExecutor: Send + Sync {
    async fn create_job(&self, launch: &LaunchSpec) -> ClusterResult<()>;

    async fn suspend_job(&self, key: &ResourceKey) -> ClusterResult<()>;

    async fn delete_job(&self, key: &ResourceKey) -> ClusterResult<()>;

    /// Creates the deployment, or restores its desired spec (one replica)
    /// if it exists, e.g. after a scale to zero.
    async fn apply_deployment(&self, launch: &LaunchSpec) -> ClusterResult<()>;

    async fn scale_deployment_to_zero(&self, key: &ResourceKey) -> ClusterResult<()>;

    async fn delete_deployment(&self, key: &ResourceKey) -> ClusterResult<()>;
}

/// Maps `NotFound` to success for idempotent teardown.
pub fn ignore_not_found(result: ClusterResult<()>) -> ClusterResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
