//! Controller for run-to-completion workloads (batch and fine-tuning jobs).
//!
//! Lifecycle on the cluster side:
//!
//! ```text
//! Queued(create) --create job--> Running
//! Running --succeeded--> [completion hook] --> Succeeded
//! Running --failed>0--> Failed (reason from the Failed condition)
//! Running|Queued(create) --cancel--> Queued(cancel) --suspend--> Canceled
//! Canceled --TTL after suspension--> job deleted
//! Queued(delete) --delete job--> Deleted
//! Running --job vanished--> Queued(create)
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobmgr_reconcile::{grace_remaining, ReconcileResult};
use tracing::{debug, info, instrument, warn};

use super::{
    launch_spec, resource_key, row_for_key, tolerate_conflict, ClusterTarget, ControllerResult,
    WorkloadController,
};
use crate::cluster::{
    ignore_not_found, ClusterExecutor, JobConditionType, ManagedBy, ObservedJob, ResourceKey,
    ResourceObserver,
};
use crate::workload::{
    BatchJob, FineTuningJob, Payload, QueuedAction, Workload, WorkloadFailure, WorkloadState,
    WorkloadStore, WorkloadUpdate,
};

/// How long a canceled job stays suspended before it is deleted.
pub const CANCELED_JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Payloads of workloads that run as cluster jobs.
pub trait JobPayload: Payload {
    const MANAGED_BY: ManagedBy;

    /// Fills in anything the launched job needs that is derived from its id.
    fn prepare_launch(&mut self, _workload_id: &str) {}

    fn mark_started(&mut self, at: DateTime<Utc>);

    fn mark_finished(&mut self, at: DateTime<Utc>, failure: Option<WorkloadFailure>);
}

impl JobPayload for BatchJob {
    const MANAGED_BY: ManagedBy = ManagedBy::BatchJob;

    fn mark_started(&mut self, at: DateTime<Utc>) {
        self.started_at.get_or_insert(at);
    }

    fn mark_finished(&mut self, at: DateTime<Utc>, failure: Option<WorkloadFailure>) {
        self.finished_at = Some(at);
        self.error = failure;
    }
}

impl JobPayload for FineTuningJob {
    const MANAGED_BY: ManagedBy = ManagedBy::FineTuningJob;

    fn prepare_launch(&mut self, workload_id: &str) {
        if self.output_model_id.is_none() {
            self.output_model_id = Some(self.output_model_name(workload_id));
        }
    }

    fn mark_started(&mut self, at: DateTime<Utc>) {
        self.started_at.get_or_insert(at);
    }

    fn mark_finished(&mut self, at: DateTime<Utc>, failure: Option<WorkloadFailure>) {
        self.finished_at = Some(at);
        self.error = failure;
    }
}

/// Work that must finish before a job may be recorded as Succeeded.
#[async_trait]
pub trait CompletionHook<P>: Send + Sync {
    /// May amend `payload`; an error leaves the row Running for a retry.
    async fn on_success(&self, row: &Workload<P>, payload: &mut P) -> ControllerResult<()>;
}

/// What a finished or running job says about its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobOutcome {
    Active,
    Succeeded,
    Failed(WorkloadFailure),
}

fn job_outcome(job: &ObservedJob) -> JobOutcome {
    if job.failed > 0 {
        let failure = match job.condition(JobConditionType::Failed) {
            Some(c) => WorkloadFailure {
                code: c.reason.clone(),
                message: format!("{}: {}", c.reason, c.message),
            },
            None => WorkloadFailure {
                code: "JobFailed".to_string(),
                message: format!("job failed ({} failed pods)", job.failed),
            },
        };
        return JobOutcome::Failed(failure);
    }
    if job.succeeded > 0 {
        JobOutcome::Succeeded
    } else {
        JobOutcome::Active
    }
}

pub struct JobController<P> {
    store: Arc<dyn WorkloadStore<P>>,
    observer: Arc<dyn ResourceObserver>,
    executor: Arc<dyn ClusterExecutor>,
    hook: Option<Arc<dyn CompletionHook<P>>>,
    canceled_ttl: Duration,
}

impl<P: JobPayload> JobController<P> {
    pub fn new(
        store: Arc<dyn WorkloadStore<P>>,
        observer: Arc<dyn ResourceObserver>,
        executor: Arc<dyn ClusterExecutor>,
    ) -> Self {
        Self {
            store,
            observer,
            executor,
            hook: None,
            canceled_ttl: CANCELED_JOB_TTL,
        }
    }

    pub fn with_completion_hook(mut self, hook: Arc<dyn CompletionHook<P>>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Handles one Queued row. Returns true if it changed anything.
    #[instrument(skip(self, row), fields(kind = %P::KIND, workload_id = %row.id))]
    async fn dispatch_row(&self, row: Workload<P>, now: DateTime<Utc>) -> ControllerResult<bool> {
        let key = resource_key(&row);
        match row.queued_action {
            Some(QueuedAction::Create) => {
                let mut row = row;
                row.payload.prepare_launch(&row.id);
                self.executor.create_job(&launch_spec(&row, P::MANAGED_BY)?).await?;
                info!(resource = %key, "Job created");

                // If this update is lost the watch pass finds the job and retries it.
                row.payload.mark_started(now);
                let updated = tolerate_conflict(
                    self.store
                        .set_state(&row.id, row.version, WorkloadState::Running, WorkloadUpdate::new().payload(row.payload.clone()))
                        .await,
                )?;
                Ok(updated.is_some())
            }
            Some(QueuedAction::Cancel) => {
                if self.observer.get_job(&key).await?.is_some() {
                    ignore_not_found(self.executor.suspend_job(&key).await)?;
                    info!(resource = %key, "Job suspended");
                }
                let mut payload = row.payload.clone();
                payload.mark_finished(now, None);
                let updated = tolerate_conflict(
                    self.store
                        .set_state(&row.id, row.version, WorkloadState::Canceled, WorkloadUpdate::new().payload(payload))
                        .await,
                )?;
                Ok(updated.is_some())
            }
            Some(QueuedAction::Delete) => {
                ignore_not_found(self.executor.delete_job(&key).await)?;
                let updated = tolerate_conflict(
                    self.store
                        .set_state(&row.id, row.version, WorkloadState::Deleted, WorkloadUpdate::new())
                        .await,
                )?;
                Ok(updated.is_some())
            }
            other => {
                debug!(action = ?other, "No dispatch for queued action");
                Ok(false)
            }
        }
    }

    /// Decides what one observation of `row` means.
    async fn reconcile_row(
        &self,
        row: Workload<P>,
        observed: Option<ObservedJob>,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        let Some(job) = observed else {
            if row.state == WorkloadState::Running {
                warn!(workload_id = %row.id, "Job vanished while running; recreating");
                tolerate_conflict(
                    self.store
                        .set_queued_action(
                            &row.id,
                            row.version,
                            QueuedAction::Create,
                            WorkloadUpdate::new().reason("JobMissing"),
                        )
                        .await,
                )?;
            }
            return Ok(ReconcileResult::done());
        };

        if job.deleting {
            debug!(resource = %job.key, "Job is being deleted");
            return Ok(ReconcileResult::done());
        }

        match row.state {
            WorkloadState::Queued if row.queued_action == Some(QueuedAction::Create) => {
                let mut payload = row.payload.clone();
                payload.prepare_launch(&row.id);
                payload.mark_started(now);
                let updated = tolerate_conflict(
                    self.store
                        .set_state(&row.id, row.version, WorkloadState::Running, WorkloadUpdate::new().payload(payload))
                        .await,
                )?;
                if updated.is_some() {
                    info!(workload_id = %row.id, "Job running");
                }
                // Look again right away in case it already finished.
                Ok(ReconcileResult::requeue())
            }
            WorkloadState::Running => self.reconcile_running(row, &job, now).await,
            WorkloadState::Canceled => self.finalize_canceled(&job, now).await,
            _ => Ok(ReconcileResult::done()),
        }
    }

    async fn reconcile_running(
        &self,
        row: Workload<P>,
        job: &ObservedJob,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        match job_outcome(job) {
            JobOutcome::Active => {
                debug!(workload_id = %row.id, active = job.active, "Job still running");
                Ok(ReconcileResult::done())
            }
            JobOutcome::Failed(failure) => {
                let mut payload = row.payload.clone();
                let reason = failure.message.clone();
                payload.mark_finished(now, Some(failure));
                let updated = tolerate_conflict(
                    self.store
                        .set_state(
                            &row.id,
                            row.version,
                            WorkloadState::Failed,
                            WorkloadUpdate::new().payload(payload).reason(reason.clone()),
                        )
                        .await,
                )?;
                if updated.is_some() {
                    warn!(workload_id = %row.id, reason = %reason, "Job failed");
                }
                Ok(ReconcileResult::done())
            }
            JobOutcome::Succeeded => {
                let mut payload = row.payload.clone();
                if let Some(hook) = &self.hook {
                    hook.on_success(&row, &mut payload).await?;
                }
                payload.mark_finished(now, None);
                let updated = tolerate_conflict(
                    self.store
                        .set_state(&row.id, row.version, WorkloadState::Succeeded, WorkloadUpdate::new().payload(payload))
                        .await,
                )?;
                if updated.is_some() {
                    info!(workload_id = %row.id, "Job succeeded");
                }
                Ok(ReconcileResult::done())
            }
        }
    }

    /// Keeps a canceled job suspended for the TTL, then deletes it.
    async fn finalize_canceled(
        &self,
        job: &ObservedJob,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        let Some(suspended) = job.condition(JobConditionType::Suspended) else {
            ignore_not_found(self.executor.suspend_job(&job.key).await)?;
            return Ok(ReconcileResult::requeue_after(self.canceled_ttl));
        };

        match grace_remaining(suspended.last_transition_time, self.canceled_ttl, now) {
            Some(remaining) => {
                debug!(resource = %job.key, remaining_secs = remaining.as_secs(), "Canceled job within TTL");
                Ok(ReconcileResult::requeue_after(remaining))
            }
            None => {
                ignore_not_found(self.executor.delete_job(&job.key).await)?;
                info!(resource = %job.key, "Deleted canceled job after TTL");
                Ok(ReconcileResult::done())
            }
        }
    }
}

#[async_trait]
impl<P: JobPayload> WorkloadController for JobController<P> {
    fn name(&self) -> &'static str {
        P::KIND.as_str()
    }

    async fn dispatch(&self, target: &ClusterTarget, now: DateTime<Utc>) -> ControllerResult<usize> {
        let rows = self
            .store
            .list_queued(&target.tenant_id, &target.cluster_id)
            .await?;

        let mut handled = 0;
        for row in rows {
            let id = row.id.clone();
            match self.dispatch_row(row, now).await {
                Ok(true) => handled += 1,
                Ok(false) => {}
                Err(e) => warn!(workload_id = %id, error = %e, "Dispatch failed"),
            }
        }
        Ok(handled)
    }

    async fn watched_keys(&self, target: &ClusterTarget) -> ControllerResult<Vec<ResourceKey>> {
        let mut keys: BTreeSet<ResourceKey> = self
            .observer
            .list_jobs(&target.cluster_id)
            .await?
            .into_iter()
            .filter(|j| j.managed_by == Some(P::MANAGED_BY))
            .map(|j| j.key)
            .collect();

        // Running rows whose job may have disappeared.
        for row in self.store.list_by_state(WorkloadState::Running).await? {
            if row.tenant_id == target.tenant_id
                && row.cluster_id.as_deref() == Some(target.cluster_id.as_str())
            {
                keys.insert(resource_key(&row));
            }
        }
        Ok(keys.into_iter().collect())
    }

    async fn reconcile(&self, key: &ResourceKey, now: DateTime<Utc>) -> ControllerResult<ReconcileResult> {
        let Some(row) = row_for_key(self.store.as_ref(), key).await? else {
            return Ok(ReconcileResult::done());
        };
        let observed = self.observer.get_job(key).await?;
        self.reconcile_row(row, observed, now).await
    }
}
