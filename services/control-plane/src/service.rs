//! Inbound workload operations.
//!
//! Callers arrive already authenticated: a [`CallerContext`] names the
//! tenant, organization and project the request acts in and the clusters the
//! tenant may use. Creation schedules the workload, records an assumed pod
//! for GPU requests and persists the row in Queued; every later user action
//! only sets the queued action and leaves the rest to the controllers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::cache::{CacheError, ClusterCache, ClusterRecord, ClusterStatus};
use crate::scheduler::{Entitlement, Scheduler, SchedulerError, SchedulingRequest};
use crate::workload::{
    BatchJob, FineTuningJob, Hyperparameters, Notebook, Page, Payload, Placement, QueuedAction,
    Resources, StoreError, Workload, WorkloadStore, WorkloadUpdate,
};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Longest accepted fine-tuning suffix.
pub const MAX_SUFFIX_LEN: usize = 18;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("scheduling failed: {0}")]
    Scheduling(#[from] SchedulerError),

    #[error("cluster cache: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::Store(e) if e.is_not_found())
    }

    fn invalid(message: impl Into<String>) -> Self {
        ServiceError::InvalidArgument(message.into())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Who is calling and where they may run things.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub tenant_id: String,
    pub organization_id: String,
    pub project_id: String,
    pub entitlements: Vec<Entitlement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateFineTuningJobRequest {
    pub model: String,
    pub training_file: String,
    #[serde(default)]
    pub validation_file: Option<String>,
    pub suffix: String,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub gpu_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateBatchJobRequest {
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub data_files: Vec<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub gpu_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateNotebookRequest {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub gpu_count: u32,
    /// Pin the notebook to one of the caller's clusters.
    #[serde(default)]
    pub cluster_id: Option<String>,
}

fn require(value: &str, field: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::invalid(format!("{field} is required")));
    }
    Ok(())
}

fn validate_fine_tuning(req: &CreateFineTuningJobRequest) -> ServiceResult<()> {
    require(&req.model, "model")?;
    require(&req.training_file, "training file")?;
    require(&req.suffix, "suffix")?;
    if req.suffix.len() > MAX_SUFFIX_LEN {
        return Err(ServiceError::invalid("suffix is too long"));
    }
    let hp = &req.hyperparameters;
    if hp.learning_rate_multiplier.is_some_and(|m| m < 0.0) {
        return Err(ServiceError::invalid("learning rate multiplier must be non-negative"));
    }
    if hp.n_epochs == Some(0) {
        return Err(ServiceError::invalid("n epochs must be positive"));
    }
    if hp.batch_size == Some(0) {
        return Err(ServiceError::invalid("batch size must be positive"));
    }
    Ok(())
}

pub struct WorkloadService {
    cache: Arc<ClusterCache>,
    scheduler: Arc<Scheduler>,
    fine_tuning_jobs: Arc<dyn WorkloadStore<FineTuningJob>>,
    batch_jobs: Arc<dyn WorkloadStore<BatchJob>>,
    notebooks: Arc<dyn WorkloadStore<Notebook>>,
}

impl WorkloadService {
    pub fn new(
        cache: Arc<ClusterCache>,
        scheduler: Arc<Scheduler>,
        fine_tuning_jobs: Arc<dyn WorkloadStore<FineTuningJob>>,
        batch_jobs: Arc<dyn WorkloadStore<BatchJob>>,
        notebooks: Arc<dyn WorkloadStore<Notebook>>,
    ) -> Self {
        Self {
            cache,
            scheduler,
            fine_tuning_jobs,
            batch_jobs,
            notebooks,
        }
    }

    // Fine-tuning jobs

    pub async fn create_fine_tuning_job(
        &self,
        caller: &CallerContext,
        req: CreateFineTuningJobRequest,
    ) -> ServiceResult<Workload<FineTuningJob>> {
        validate_fine_tuning(&req)?;
        let now = Utc::now();
        let placement = self.place(caller, req.gpu_count, None, now).await?;
        let payload = FineTuningJob {
            model: req.model,
            training_file: req.training_file,
            validation_file: req.validation_file.filter(|f| !f.is_empty()),
            suffix: Some(req.suffix),
            hyperparameters: req.hyperparameters,
            resources: Resources { gpu_count: req.gpu_count },
            organization_id: caller.organization_id.clone(),
            placement,
            output_model_id: None,
            fine_tuned_model: None,
            started_at: None,
            finished_at: None,
            error: None,
        };
        self.submit(self.fine_tuning_jobs.as_ref(), caller, payload, now)
            .await
    }

    pub async fn get_fine_tuning_job(
        &self,
        caller: &CallerContext,
        id: &str,
    ) -> ServiceResult<Workload<FineTuningJob>> {
        fetch(self.fine_tuning_jobs.as_ref(), caller, id).await
    }

    pub async fn list_fine_tuning_jobs(
        &self,
        caller: &CallerContext,
        after: Option<&str>,
        limit: usize,
    ) -> ServiceResult<Page<FineTuningJob>> {
        list(self.fine_tuning_jobs.as_ref(), caller, after, limit).await
    }

    pub async fn cancel_fine_tuning_job(
        &self,
        caller: &CallerContext,
        id: &str,
    ) -> ServiceResult<Workload<FineTuningJob>> {
        request_action(self.fine_tuning_jobs.as_ref(), caller, id, QueuedAction::Cancel).await
    }

    // Batch jobs

    pub async fn create_batch_job(
        &self,
        caller: &CallerContext,
        req: CreateBatchJobRequest,
    ) -> ServiceResult<Workload<BatchJob>> {
        require(&req.image, "image")?;
        require(&req.command, "command")?;
        let now = Utc::now();
        let placement = self.place(caller, req.gpu_count, None, now).await?;
        let payload = BatchJob {
            image: req.image,
            command: req.command,
            data_files: req.data_files,
            envs: req.envs,
            resources: Resources { gpu_count: req.gpu_count },
            placement,
            started_at: None,
            finished_at: None,
            error: None,
        };
        self.submit(self.batch_jobs.as_ref(), caller, payload, now).await
    }

    pub async fn get_batch_job(&self, caller: &CallerContext, id: &str) -> ServiceResult<Workload<BatchJob>> {
        fetch(self.batch_jobs.as_ref(), caller, id).await
    }

    pub async fn list_batch_jobs(
        &self,
        caller: &CallerContext,
        after: Option<&str>,
        limit: usize,
    ) -> ServiceResult<Page<BatchJob>> {
        list(self.batch_jobs.as_ref(), caller, after, limit).await
    }

    pub async fn cancel_batch_job(&self, caller: &CallerContext, id: &str) -> ServiceResult<Workload<BatchJob>> {
        request_action(self.batch_jobs.as_ref(), caller, id, QueuedAction::Cancel).await
    }

    pub async fn delete_batch_job(&self, caller: &CallerContext, id: &str) -> ServiceResult<Workload<BatchJob>> {
        request_action(self.batch_jobs.as_ref(), caller, id, QueuedAction::Delete).await
    }

    // Notebooks

    pub async fn create_notebook(
        &self,
        caller: &CallerContext,
        req: CreateNotebookRequest,
    ) -> ServiceResult<Workload<Notebook>> {
        require(&req.name, "name")?;
        require(&req.image, "image")?;
        let now = Utc::now();
        let preferred = req.cluster_id.as_deref().filter(|c| !c.is_empty());
        let placement = self.place(caller, req.gpu_count, preferred, now).await?;
        let payload = Notebook {
            name: req.name,
            image: req.image,
            envs: req.envs,
            resources: Resources { gpu_count: req.gpu_count },
            placement,
            entitlements: caller.entitlements.clone(),
            started_at: None,
            stopped_at: None,
            error: None,
        };
        self.submit(self.notebooks.as_ref(), caller, payload, now).await
    }

    pub async fn get_notebook(&self, caller: &CallerContext, id: &str) -> ServiceResult<Workload<Notebook>> {
        fetch(self.notebooks.as_ref(), caller, id).await
    }

    pub async fn list_notebooks(
        &self,
        caller: &CallerContext,
        after: Option<&str>,
        limit: usize,
    ) -> ServiceResult<Page<Notebook>> {
        list(self.notebooks.as_ref(), caller, after, limit).await
    }

    pub async fn stop_notebook(&self, caller: &CallerContext, id: &str) -> ServiceResult<Workload<Notebook>> {
        request_action(self.notebooks.as_ref(), caller, id, QueuedAction::Stop).await
    }

    pub async fn start_notebook(&self, caller: &CallerContext, id: &str) -> ServiceResult<Workload<Notebook>> {
        request_action(self.notebooks.as_ref(), caller, id, QueuedAction::Start).await
    }

    pub async fn delete_notebook(&self, caller: &CallerContext, id: &str) -> ServiceResult<Workload<Notebook>> {
        request_action(self.notebooks.as_ref(), caller, id, QueuedAction::Delete).await
    }

    // Clusters

    /// Persists a cluster's status report and refreshes the cache with it.
    #[instrument(skip(self, status))]
    pub async fn report_cluster_status(
        &self,
        tenant_id: &str,
        cluster_id: &str,
        name: &str,
        status: ClusterStatus,
    ) -> ServiceResult<()> {
        require(tenant_id, "tenant id")?;
        require(cluster_id, "cluster id")?;
        let now = Utc::now();
        let record = ClusterRecord {
            tenant_id: tenant_id.to_string(),
            cluster_id: cluster_id.to_string(),
            name: name.to_string(),
            status,
            updated_at: now,
        };
        self.cache.record_status_at(&record, now).await?;
        Ok(())
    }

    async fn place(
        &self,
        caller: &CallerContext,
        gpu_count: u32,
        preferred_cluster_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> ServiceResult<Placement> {
        let result = self
            .scheduler
            .schedule_at(
                SchedulingRequest {
                    tenant_id: &caller.tenant_id,
                    entitlements: &caller.entitlements,
                    preferred_cluster_id,
                    excluded_cluster_id: None,
                    gpu_count,
                },
                now,
            )
            .await?;
        Ok(Placement {
            cluster_id: result.cluster_id,
            cluster_name: result.cluster_name,
            namespace: result.namespace,
        })
    }

    async fn submit<P: Payload>(
        &self,
        store: &dyn WorkloadStore<P>,
        caller: &CallerContext,
        payload: P,
        now: DateTime<Utc>,
    ) -> ServiceResult<Workload<P>> {
        let row = Workload::new(P::new_id(), &caller.tenant_id, &caller.project_id, payload, now);
        let gpu_count = row.payload.gpu_count();
        let placement = row.payload.placement();

        // Occupy the GPUs until a status report shows the pod.
        if gpu_count > 0 {
            self.cache
                .add_assumed_pod_at(
                    &caller.tenant_id,
                    &placement.cluster_id,
                    &row.assumed_pod_key(),
                    gpu_count,
                    now,
                )
                .await?;
        }

        store.create(&row).await?;
        info!(
            kind = %P::KIND,
            workload_id = %row.id,
            tenant_id = %row.tenant_id,
            project_id = %row.project_id,
            cluster_id = %placement.cluster_id,
            namespace = %placement.namespace,
            gpu_count,
            "Workload created"
        );
        Ok(row)
    }
}

async fn fetch<P: Payload>(
    store: &dyn WorkloadStore<P>,
    caller: &CallerContext,
    id: &str,
) -> ServiceResult<Workload<P>> {
    require(id, "id")?;
    let row = store.get_in_project(id, &caller.project_id).await?;
    if row.tenant_id != caller.tenant_id {
        return Err(StoreError::NotFound {
            kind: P::KIND,
            id: id.to_string(),
        }
        .into());
    }
    Ok(row)
}

async fn list<P: Payload>(
    store: &dyn WorkloadStore<P>,
    caller: &CallerContext,
    after: Option<&str>,
    limit: usize,
) -> ServiceResult<Page<P>> {
    let limit = match limit {
        0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    };
    let after = after.filter(|a| !a.is_empty());
    if let Some(after) = after {
        match fetch(store, caller, after).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return Err(ServiceError::invalid(format!("invalid after: {after}")));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(store.list_by_project(&caller.project_id, after, limit).await?)
}

/// Queues `action` unless the row already satisfies it.
async fn request_action<P: Payload>(
    store: &dyn WorkloadStore<P>,
    caller: &CallerContext,
    id: &str,
    action: QueuedAction,
) -> ServiceResult<Workload<P>> {
    let row = fetch(store, caller, id).await?;
    if P::KIND
        .descriptor()
        .is_satisfied(action, row.state, row.queued_action)
    {
        debug!(kind = %P::KIND, workload_id = %id, action = %action, status = row.status(), "Action already satisfied");
        return Ok(row);
    }

    let updated = store
        .set_queued_action(&row.id, row.version, action, WorkloadUpdate::new())
        .await?;
    info!(kind = %P::KIND, workload_id = %id, action = %action, version = updated.version, "Action queued");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{GpuNode, MemoryClusterSource};
    use crate::workload::{MemoryWorkloadStore, WorkloadState};
    use rstest::rstest;

    struct Fixture {
        service: WorkloadService,
        cache: Arc<ClusterCache>,
        batch: Arc<MemoryWorkloadStore<BatchJob>>,
        notebooks: Arc<MemoryWorkloadStore<Notebook>>,
    }

    fn gpu_status(allocatable: u32) -> ClusterStatus {
        ClusterStatus {
            gpu_nodes: vec![GpuNode {
                resource_name: "nvidia.com/gpu".into(),
                allocatable_count: allocatable,
            }],
            ..Default::default()
        }
    }

    async fn fixture() -> Fixture {
        let cache = Arc::new(ClusterCache::new(Arc::new(MemoryClusterSource::new())));
        let scheduler = Arc::new(Scheduler::new(cache.clone()));
        let batch = Arc::new(MemoryWorkloadStore::new());
        let notebooks = Arc::new(MemoryWorkloadStore::new());
        let service = WorkloadService::new(
            cache.clone(),
            scheduler,
            Arc::new(MemoryWorkloadStore::new()),
            batch.clone(),
            notebooks.clone(),
        );
        service
            .report_cluster_status("tenant-a", "c1", "gpu-east", gpu_status(4))
            .await
            .unwrap();
        service
            .report_cluster_status("tenant-a", "c2", "gpu-west", gpu_status(4))
            .await
            .unwrap();
        Fixture {
            service,
            cache,
            batch,
            notebooks,
        }
    }

    fn caller() -> CallerContext {
        CallerContext {
            tenant_id: "tenant-a".into(),
            organization_id: "org-1".into(),
            project_id: "p1".into(),
            entitlements: ["c1", "c2"]
                .into_iter()
                .map(|c| Entitlement {
                    cluster_id: c.into(),
                    cluster_name: String::new(),
                    namespace: format!("{c}-ns"),
                })
                .collect(),
        }
    }

    fn batch_request(gpu_count: u32) -> CreateBatchJobRequest {
        CreateBatchJobRequest {
            image: "python:3.12".into(),
            command: "python main.py".into(),
            gpu_count,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_back_to_back_requests_spread_over_clusters() {
        let f = fixture().await;
        let first = f.service.create_batch_job(&caller(), batch_request(3)).await.unwrap();
        let second = f.service.create_batch_job(&caller(), batch_request(3)).await.unwrap();
        assert_eq!(first.cluster_id.as_deref(), Some("c1"));
        assert_eq!(second.cluster_id.as_deref(), Some("c2"));
        assert_eq!(second.payload.placement.cluster_name, "gpu-west");
        assert!(first.is_queued_with(QueuedAction::Create));
        assert_eq!(first.status(), "creating");

        let err = f.service.create_batch_job(&caller(), batch_request(3)).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Scheduling(SchedulerError::NoSchedulableCluster { gpu_count: 3 })
        ));
    }

    #[tokio::test]
    async fn test_zero_gpu_records_no_assumed_pod() {
        let f = fixture().await;
        f.service.create_batch_job(&caller(), batch_request(0)).await.unwrap();
        let clusters = f.cache.list_clusters("tenant-a").await.unwrap();
        assert!(clusters.values().all(|c| c.assumed_gpu_pods.is_empty()));
    }

    #[rstest]
    #[case::missing_model(CreateFineTuningJobRequest { model: String::new(), ..valid_fine_tuning() })]
    #[case::missing_suffix(CreateFineTuningJobRequest { suffix: String::new(), ..valid_fine_tuning() })]
    #[case::long_suffix(CreateFineTuningJobRequest { suffix: "s".repeat(19), ..valid_fine_tuning() })]
    #[case::negative_lr(CreateFineTuningJobRequest {
        hyperparameters: Hyperparameters { learning_rate_multiplier: Some(-1.0), ..Default::default() },
        ..valid_fine_tuning()
    })]
    #[tokio::test]
    async fn test_invalid_fine_tuning_request(#[case] req: CreateFineTuningJobRequest) {
        let f = fixture().await;
        let err = f.service.create_fine_tuning_job(&caller(), req).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)), "{err}");
    }

    fn valid_fine_tuning() -> CreateFineTuningJobRequest {
        CreateFineTuningJobRequest {
            model: "llama-3-8b".into(),
            training_file: "file-1".into(),
            suffix: "support".into(),
            gpu_count: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fine_tuning_job_created() {
        let f = fixture().await;
        let row = f
            .service
            .create_fine_tuning_job(&caller(), valid_fine_tuning())
            .await
            .unwrap();
        assert!(row.id.starts_with("ftjob-"));
        assert_eq!(row.payload.organization_id, "org-1");
        let fetched = f.service.get_fine_tuning_job(&caller(), &row.id).await.unwrap();
        assert_eq!(fetched.id, row.id);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let f = fixture().await;
        let row = f.service.create_batch_job(&caller(), batch_request(0)).await.unwrap();

        let canceling = f.service.cancel_batch_job(&caller(), &row.id).await.unwrap();
        assert!(canceling.is_queued_with(QueuedAction::Cancel));
        assert_eq!(canceling.version, 1);

        let again = f.service.cancel_batch_job(&caller(), &row.id).await.unwrap();
        assert_eq!(again.version, 1);
    }

    #[tokio::test]
    async fn test_cancel_finished_job_is_noop() {
        let f = fixture().await;
        let row = f.service.create_batch_job(&caller(), batch_request(0)).await.unwrap();
        f.batch
            .set_state(&row.id, 0, WorkloadState::Running, WorkloadUpdate::new())
            .await
            .unwrap();
        f.batch
            .set_state(&row.id, 1, WorkloadState::Succeeded, WorkloadUpdate::new())
            .await
            .unwrap();

        let unchanged = f.service.cancel_batch_job(&caller(), &row.id).await.unwrap();
        assert_eq!(unchanged.state, WorkloadState::Succeeded);
        assert_eq!(unchanged.version, 2);

        let deleting = f.service.delete_batch_job(&caller(), &row.id).await.unwrap();
        assert!(deleting.is_queued_with(QueuedAction::Delete));
    }

    #[tokio::test]
    async fn test_other_project_cannot_see_workload() {
        let f = fixture().await;
        let row = f.service.create_batch_job(&caller(), batch_request(0)).await.unwrap();
        let other = CallerContext {
            project_id: "p2".into(),
            ..caller()
        };
        let err = f.service.cancel_batch_job(&other, &row.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_notebook_pinned_cluster_and_stop_start() {
        let f = fixture().await;
        let req = CreateNotebookRequest {
            name: "scratch".into(),
            image: "jupyter/base-notebook".into(),
            gpu_count: 1,
            cluster_id: Some("c2".into()),
            ..Default::default()
        };
        let nb = f.service.create_notebook(&caller(), req).await.unwrap();
        assert_eq!(nb.cluster_id.as_deref(), Some("c2"));
        assert!(nb.is_queued_with(QueuedAction::Start));
        assert_eq!(nb.payload.entitlements.len(), 2);

        // Start while still queued to start is a no-op.
        let same = f.service.start_notebook(&caller(), &nb.id).await.unwrap();
        assert_eq!(same.version, 0);

        f.notebooks
            .set_state(&nb.id, 0, WorkloadState::Initializing, WorkloadUpdate::new())
            .await
            .unwrap();
        let stopping = f.service.stop_notebook(&caller(), &nb.id).await.unwrap();
        assert!(stopping.is_queued_with(QueuedAction::Stop));

        let err = f.service.start_notebook(&caller(), &nb.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Store(ref e) if e.is_precondition()), "{err}");
    }

    #[tokio::test]
    async fn test_list_pages_and_validates_cursor() {
        let f = fixture().await;
        for _ in 0..3 {
            f.service.create_batch_job(&caller(), batch_request(0)).await.unwrap();
        }
        let page = f.service.list_batch_jobs(&caller(), None, 2).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);

        let last = page.items[1].id.clone();
        let rest = f.service.list_batch_jobs(&caller(), Some(&last), 2).await.unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(!rest.has_more);

        let err = f
            .service
            .list_batch_jobs(&caller(), Some("batchjob-unknown"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }
}
