//! Notebook controller.
//!
//! Notebooks run as single-replica deployments. Start applies the deployment
//! (creating it, or scaling a stopped one back to one replica) and moves the
//! row to Initializing; readiness of every replica moves it to Running. Stop
//! scales to zero and waits until no replica is left. Requeue tears the
//! deployment down so the rescheduler can place it elsewhere.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobmgr_reconcile::ReconcileResult;
use tracing::{debug, info, instrument, warn};

use super::{
    launch_spec, resource_key, row_for_key, tolerate_conflict, ClusterTarget, ControllerResult,
    WorkloadController,
};
use crate::cluster::{
    ignore_not_found, ClusterExecutor, ManagedBy, ObservedDeployment, ResourceKey,
    ResourceObserver,
};
use crate::workload::{
    Notebook, QueuedAction, Workload, WorkloadState, WorkloadStore, WorkloadUpdate,
};

/// Reason recorded while a notebook's image is still being pulled.
pub const PULLING_REASON: &str = "Pulling";

/// States in which a notebook expects its deployment to exist.
const DEPLOYED_STATES: [WorkloadState; 3] = [
    WorkloadState::Initializing,
    WorkloadState::Running,
    WorkloadState::Stopping,
];

pub struct NotebookController {
    store: Arc<dyn WorkloadStore<Notebook>>,
    observer: Arc<dyn ResourceObserver>,
    executor: Arc<dyn ClusterExecutor>,
}

impl NotebookController {
    pub fn new(
        store: Arc<dyn WorkloadStore<Notebook>>,
        observer: Arc<dyn ResourceObserver>,
        executor: Arc<dyn ClusterExecutor>,
    ) -> Self {
        Self {
            store,
            observer,
            executor,
        }
    }

    async fn transition(
        &self,
        row: &Workload<Notebook>,
        state: WorkloadState,
        update: WorkloadUpdate<Notebook>,
    ) -> ControllerResult<bool> {
        let updated = tolerate_conflict(self.store.set_state(&row.id, row.version, state, update).await)?;
        if updated.is_some() {
            info!(notebook_id = %row.id, from = %row.status(), to = %state, "Notebook state changed");
        }
        Ok(updated.is_some())
    }

    async fn mark_stopped(&self, row: &Workload<Notebook>, now: DateTime<Utc>) -> ControllerResult<bool> {
        let mut payload = row.payload.clone();
        payload.started_at = None;
        payload.stopped_at = Some(now);
        self.transition(row, WorkloadState::Stopped, WorkloadUpdate::new().payload(payload))
            .await
    }

    #[instrument(skip(self, row), fields(notebook_id = %row.id))]
    async fn dispatch_row(&self, row: Workload<Notebook>, now: DateTime<Utc>) -> ControllerResult<bool> {
        let key = resource_key(&row);
        match row.queued_action {
            Some(QueuedAction::Start) => {
                self.executor
                    .apply_deployment(&launch_spec(&row, ManagedBy::Notebook)?)
                    .await?;
                info!(resource = %key, "Notebook deployment applied");

                let mut payload = row.payload.clone();
                payload.started_at = Some(now);
                payload.stopped_at = None;
                payload.error = None;
                self.transition(&row, WorkloadState::Initializing, WorkloadUpdate::new().payload(payload))
                    .await
            }
            Some(QueuedAction::Stop) => {
                if self.observer.get_deployment(&key).await?.is_none() {
                    return self.mark_stopped(&row, now).await;
                }
                ignore_not_found(self.executor.scale_deployment_to_zero(&key).await)?;
                self.transition(&row, WorkloadState::Stopping, WorkloadUpdate::new())
                    .await
            }
            Some(QueuedAction::Delete) => {
                ignore_not_found(self.executor.delete_deployment(&key).await)?;
                self.transition(&row, WorkloadState::Deleted, WorkloadUpdate::new())
                    .await
            }
            Some(QueuedAction::Requeue) => {
                ignore_not_found(self.executor.delete_deployment(&key).await)?;
                let update = WorkloadUpdate::new().reason(row.reason.clone().unwrap_or_default());
                self.transition(&row, WorkloadState::Requeued, update).await
            }
            other => {
                debug!(action = ?other, "No dispatch for queued action");
                Ok(false)
            }
        }
    }

    async fn reconcile_row(
        &self,
        row: Workload<Notebook>,
        observed: Option<ObservedDeployment>,
        now: DateTime<Utc>,
    ) -> ControllerResult<ReconcileResult> {
        let Some(deployment) = observed else {
            match row.state {
                WorkloadState::Stopping => {
                    self.mark_stopped(&row, now).await?;
                }
                WorkloadState::Initializing | WorkloadState::Running => {
                    warn!(notebook_id = %row.id, state = %row.state, "Notebook deployment is missing");
                }
                _ => {}
            }
            return Ok(ReconcileResult::done());
        };

        if deployment.deleting {
            debug!(resource = %deployment.key, "Notebook deployment is being deleted");
            return Ok(ReconcileResult::done());
        }

        match row.state {
            WorkloadState::Queued if row.queued_action == Some(QueuedAction::Start) => {
                // Created by a pass whose state update was lost.
                self.transition(&row, WorkloadState::Initializing, WorkloadUpdate::new())
                    .await?;
                Ok(ReconcileResult::requeue())
            }
            WorkloadState::Stopping => {
                if deployment.status_replicas == 0 {
                    self.mark_stopped(&row, now).await?;
                    Ok(ReconcileResult::done())
                } else {
                    debug!(notebook_id = %row.id, remaining = deployment.status_replicas, "Waiting for replicas to stop");
                    Ok(ReconcileResult::requeue())
                }
            }
            WorkloadState::Initializing => self.reconcile_initializing(&row, &deployment).await,
            WorkloadState::Running => {
                if deployment.ready_replicas < deployment.replicas {
                    warn!(
                        notebook_id = %row.id,
                        ready = deployment.ready_replicas,
                        desired = deployment.replicas,
                        "Running notebook has unready replicas"
                    );
                }
                Ok(ReconcileResult::done())
            }
            _ => Ok(ReconcileResult::done()),
        }
    }

    async fn reconcile_initializing(
        &self,
        row: &Workload<Notebook>,
        deployment: &ObservedDeployment,
    ) -> ControllerResult<ReconcileResult> {
        if deployment.replicas == 0 {
            debug!(notebook_id = %row.id, "Notebook deployment is being stopped");
            return Ok(ReconcileResult::done());
        }

        let pulling = deployment
            .waiting_reason
            .as_deref()
            .is_some_and(|r| r.contains(PULLING_REASON));
        if pulling {
            if row.reason.as_deref() != Some(PULLING_REASON) {
                self.transition(
                    row,
                    WorkloadState::Initializing,
                    WorkloadUpdate::new().reason(PULLING_REASON),
                )
                .await?;
            }
            return Ok(ReconcileResult::done());
        }

        if deployment.ready_replicas < deployment.replicas {
            debug!(notebook_id = %row.id, "Notebook deployment is not ready yet");
            return Ok(ReconcileResult::done());
        }

        self.transition(row, WorkloadState::Running, WorkloadUpdate::new())
            .await?;
        Ok(ReconcileResult::done())
    }
}

#[async_trait]
impl WorkloadController for NotebookController {
    fn name(&self) -> &'static str {
        "notebook"
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
                Err(e) => warn!(notebook_id = %id, error = %e, "Notebook dispatch failed"),
            }
        }
        Ok(handled)
    }

    async fn watched_keys(&self, target: &ClusterTarget) -> ControllerResult<Vec<ResourceKey>> {
        let mut keys: BTreeSet<ResourceKey> = self
            .observer
            .list_deployments(&target.cluster_id)
            .await?
            .into_iter()
            .filter(|d| d.managed_by == Some(ManagedBy::Notebook))
            .map(|d| d.key)
            .collect();

        for state in DEPLOYED_STATES {
            for row in self.store.list_by_state(state).await? {
                if row.tenant_id == target.tenant_id
                    && row.cluster_id.as_deref() == Some(target.cluster_id.as_str())
                {
                    keys.insert(resource_key(&row));
                }
            }
        }
        Ok(keys.into_iter().collect())
    }

    async fn reconcile(&self, key: &ResourceKey, now: DateTime<Utc>) -> ControllerResult<ReconcileResult> {
        let Some(row) = row_for_key(self.store.as_ref(), key).await? else {
            return Ok(ReconcileResult::done());
        };
        let observed = self.observer.get_deployment(key).await?;
        self.reconcile_row(row, observed, now).await
    }
}
