//! Reconciliation controllers.
//!
//! Each controller owns one workload kind and works a cluster in two halves:
//!
//! - **dispatch** acts on the kind's Queued rows for the cluster (create,
//!   suspend, scale down or delete the external resource).
//! - **reconcile** compares one observed resource with its row and issues at
//!   most one conditional update.
//!
//! A CAS conflict means another observer got there first; the row is simply
//! looked at again on the next pass. Cluster API errors propagate so the
//! worker can retry them; they never mark a workload Failed.

mod fine_tuning;
mod job;
mod notebook;
mod rescheduler;
mod worker;

pub use fine_tuning::ModelPublisher;
pub use job::{CompletionHook, JobController, JobPayload, CANCELED_JOB_TTL};
pub use notebook::{NotebookController, PULLING_REASON};
pub use rescheduler::{RescheduleStats, Rescheduler};
pub use worker::{ControllerWorker, TickStats};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobmgr_reconcile::ReconcileResult;
use thiserror::Error;
use tracing::debug;

use crate::cache::CacheError;
use crate::cluster::{ClusterError, LaunchSpec, ManagedBy, ResourceKey};
use crate::registry::RegistryError;
use crate::scheduler::SchedulerError;
use crate::workload::{Payload, StoreError, StoreResult, Workload};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("cluster: {0}")]
    Cluster(#[from] ClusterError),

    #[error("model registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("scheduler: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("cluster cache: {0}")]
    Cache(#[from] CacheError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// One (tenant, cluster) pair the controllers drive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterTarget {
    pub tenant_id: String,
    pub cluster_id: String,
}

impl ClusterTarget {
    pub fn new(tenant_id: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            cluster_id: cluster_id.into(),
        }
    }
}

#[async_trait]
pub trait WorkloadController: Send + Sync {
    fn name(&self) -> &'static str;

    /// Acts on the Queued rows of `target`. Returns how many were handled.
    async fn dispatch(&self, target: &ClusterTarget, now: DateTime<Utc>) -> ControllerResult<usize>;

    /// Resources on `target` worth reconciling: tagged resources this
    /// controller owns plus rows that expect one to exist.
    async fn watched_keys(&self, target: &ClusterTarget) -> ControllerResult<Vec<ResourceKey>>;

    async fn reconcile(&self, key: &ResourceKey, now: DateTime<Utc>) -> ControllerResult<ReconcileResult>;
}

/// The cluster-side name of a workload's resource.
pub fn resource_key<P: Payload>(workload: &Workload<P>) -> ResourceKey {
    let placement = workload.payload.placement();
    ResourceKey::new(
        workload.cluster_id.clone().unwrap_or_else(|| placement.cluster_id.clone()),
        placement.namespace.clone(),
        workload.id.clone(),
    )
}

pub(crate) fn launch_spec<P: Payload>(
    workload: &Workload<P>,
    managed_by: ManagedBy,
) -> ControllerResult<LaunchSpec> {
    Ok(LaunchSpec {
        key: resource_key(workload),
        managed_by,
        gpu_count: workload.payload.gpu_count(),
        spec: serde_json::to_value(&workload.payload)?,
    })
}

/// Turns a lost CAS race into `None`.
pub(crate) fn tolerate_conflict<T>(result: StoreResult<T>) -> StoreResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_conflict() => {
            debug!(error = %e, "Lost update race; will re-observe next pass");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Loads the row behind `key`, or `None` if it is gone or lives elsewhere now.
pub(crate) async fn row_for_key<P: Payload>(
    store: &dyn crate::workload::WorkloadStore<P>,
    key: &ResourceKey,
) -> ControllerResult<Option<Workload<P>>> {
    let row = match store.get(&key.name).await {
        Ok(row) => row,
        Err(e) if e.is_not_found() => {
            debug!(resource = %key, "No workload row for resource");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if row.cluster_id.as_deref() != Some(key.cluster_id.as_str()) {
        debug!(resource = %key, cluster_id = ?row.cluster_id, "Resource belongs to a previous placement");
        return Ok(None);
    }
    Ok(Some(row))
}
