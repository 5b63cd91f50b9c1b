//! In-memory cluster for tests and local development.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    ClusterError, ClusterExecutor, ClusterReport, ClusterResult, JobCondition, JobConditionType,
    LaunchSpec, ObservedDeployment, ObservedJob, ResourceKey, ResourceObserver,
};

/// A mutation the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    CreateJob(ResourceKey),
    SuspendJob(ResourceKey),
    DeleteJob(ResourceKey),
    ApplyDeployment(ResourceKey),
    ScaleDeploymentToZero(ResourceKey),
    DeleteDeployment(ResourceKey),
}

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<ResourceKey, ObservedJob>,
    deployments: BTreeMap<ResourceKey, ObservedDeployment>,
    reports: HashMap<String, ClusterReport>,
    calls: Vec<ClusterCall>,
    unavailable: bool,
}

/// Keeps jobs and deployments in maps; tests drive their status by hand.
#[derive(Default)]
pub struct MockCluster {
    inner: Mutex<Inner>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<ClusterCall> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Make every call fail as if the agent were unreachable.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    pub async fn set_report(&self, cluster_id: &str, report: ClusterReport) {
        self.inner
            .lock()
            .await
            .reports
            .insert(cluster_id.to_string(), report);
    }

    pub async fn job(&self, key: &ResourceKey) -> Option<ObservedJob> {
        self.inner.lock().await.jobs.get(key).cloned()
    }

    pub async fn deployment(&self, key: &ResourceKey) -> Option<ObservedDeployment> {
        self.inner.lock().await.deployments.get(key).cloned()
    }

    pub async fn put_job(&self, job: ObservedJob) {
        self.inner.lock().await.jobs.insert(job.key.clone(), job);
    }

    pub async fn put_deployment(&self, deployment: ObservedDeployment) {
        self.inner
            .lock()
            .await
            .deployments
            .insert(deployment.key.clone(), deployment);
    }

    pub async fn remove_job(&self, key: &ResourceKey) {
        self.inner.lock().await.jobs.remove(key);
    }

    /// Marks a job finished: `succeeded=1`, or `failed=1` with a Failed condition.
    pub async fn finish_job(&self, key: &ResourceKey, failure: Option<(&str, &str)>) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(key) {
            job.active = 0;
            match failure {
                None => job.succeeded = 1,
                Some((reason, message)) => {
                    job.failed = 1;
                    job.conditions.push(JobCondition {
                        condition_type: JobConditionType::Failed,
                        reason: reason.to_string(),
                        message: message.to_string(),
                        last_transition_time: Utc::now(),
                    });
                }
            }
        }
    }

    /// Overrides when an existing suspension started.
    pub async fn set_suspended_at(&self, key: &ResourceKey, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(key) {
            for condition in &mut job.conditions {
                if condition.condition_type == JobConditionType::Suspended {
                    condition.last_transition_time = at;
                }
            }
        }
    }

    pub async fn set_deployment_status(
        &self,
        key: &ResourceKey,
        ready_replicas: u32,
        waiting_reason: Option<&str>,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(d) = inner.deployments.get_mut(key) {
            d.ready_replicas = ready_replicas;
            d.waiting_reason = waiting_reason.map(str::to_string);
        }
    }

    async fn guard(&self) -> ClusterResult<tokio::sync::MutexGuard<'_, Inner>> {
        let inner = self.inner.lock().await;
        if inner.unavailable {
            return Err(ClusterError::Rejected {
                status: 503,
                body: "cluster unavailable".to_string(),
            });
        }
        Ok(inner)
    }
}

#[async_trait]
impl ResourceObserver for MockCluster {
    async fn get_job(&self, key: &ResourceKey) -> ClusterResult<Option<ObservedJob>> {
        Ok(self.guard().await?.jobs.get(key).cloned())
    }

    async fn list_jobs(&self, cluster_id: &str) -> ClusterResult<Vec<ObservedJob>> {
        let inner = self.guard().await?;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.key.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn get_deployment(&self, key: &ResourceKey) -> ClusterResult<Option<ObservedDeployment>> {
        Ok(self.guard().await?.deployments.get(key).cloned())
    }

    async fn list_deployments(&self, cluster_id: &str) -> ClusterResult<Vec<ObservedDeployment>> {
        let inner = self.guard().await?;
        Ok(inner
            .deployments
            .values()
            .filter(|d| d.key.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn cluster_status(&self, cluster_id: &str) -> ClusterResult<Option<ClusterReport>> {
        Ok(self.guard().await?.reports.get(cluster_id).cloned())
    }
}

#[async_trait]
impl ClusterExecutor for MockCluster {
    async fn create_job(&self, launch: &LaunchSpec) -> ClusterResult<()> {
        let mut inner = self.guard().await?;
        inner.calls.push(ClusterCall::CreateJob(launch.key.clone()));
        inner
            .jobs
            .entry(launch.key.clone())
            .or_insert_with(|| ObservedJob {
                key: launch.key.clone(),
                managed_by: Some(launch.managed_by),
                deleting: false,
                active: 1,
                succeeded: 0,
                failed: 0,
                conditions: Vec::new(),
            });
        Ok(())
    }

    async fn suspend_job(&self, key: &ResourceKey) -> ClusterResult<()> {
        let mut inner = self.guard().await?;
        inner.calls.push(ClusterCall::SuspendJob(key.clone()));
        let job = inner
            .jobs
            .get_mut(key)
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        if job.condition(JobConditionType::Suspended).is_none() {
            job.active = 0;
            job.conditions.push(JobCondition {
                condition_type: JobConditionType::Suspended,
                reason: "JobSuspended".to_string(),
                message: "Job suspended".to_string(),
                last_transition_time: Utc::now(),
            });
        }
        Ok(())
    }

    async fn delete_job(&self, key: &ResourceKey) -> ClusterResult<()> {
        let mut inner = self.guard().await?;
        inner.calls.push(ClusterCall::DeleteJob(key.clone()));
        inner
            .jobs
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(key.clone()))
    }

    async fn apply_deployment(&self, launch: &LaunchSpec) -> ClusterResult<()> {
        let mut inner = self.guard().await?;
        inner.calls.push(ClusterCall::ApplyDeployment(launch.key.clone()));
        let deployment = inner
            .deployments
            .entry(launch.key.clone())
            .or_insert_with(|| ObservedDeployment {
                key: launch.key.clone(),
                managed_by: Some(launch.managed_by),
                deleting: false,
                replicas: 1,
                ready_replicas: 0,
                status_replicas: 1,
                waiting_reason: None,
            });
        if deployment.replicas == 0 {
            deployment.replicas = 1;
            deployment.status_replicas = 1;
        }
        Ok(())
    }

    async fn scale_deployment_to_zero(&self, key: &ResourceKey) -> ClusterResult<()> {
        let mut inner = self.guard().await?;
        inner.calls.push(ClusterCall::ScaleDeploymentToZero(key.clone()));
        let d = inner
            .deployments
            .get_mut(key)
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        d.replicas = 0;
        d.ready_replicas = 0;
        d.status_replicas = 0;
        Ok(())
    }

    async fn delete_deployment(&self, key: &ResourceKey) -> ClusterResult<()> {
        let mut inner = self.guard().await?;
        inner.calls.push(ClusterCall::DeleteDeployment(key.clone()));
        inner
            .deployments
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(key.clone()))
    }
}
