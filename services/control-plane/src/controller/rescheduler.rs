//! Notebook rescheduler.
//!
//! Recovers notebooks that never came up: an Initializing notebook that has
//! not changed for longer than the max queued time (and is not pulling its
//! image) is queued for Requeue. The notebook controller then deletes its
//! deployment and marks it Requeued, and the next pass here schedules it
//! again, away from the cluster it was stuck on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobmgr_reconcile::is_older_than;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{tolerate_conflict, ControllerResult, PULLING_REASON};
use crate::cache::ClusterCache;
use crate::scheduler::{Scheduler, SchedulingRequest};
use crate::workload::{
    Notebook, Payload, Placement, QueuedAction, Workload, WorkloadState, WorkloadStore,
    WorkloadUpdate,
};

/// Reason recorded on notebooks requeued for taking too long to start.
pub const INITIALIZATION_TIMEOUT_REASON: &str = "InitializationTimeout";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescheduleStats {
    /// Initializing notebooks queued for Requeue.
    pub requeued: usize,
    /// Requeued notebooks placed on a new cluster.
    pub rescheduled: usize,
    /// Requeued notebooks left waiting for capacity.
    pub unschedulable: usize,
}

pub struct Rescheduler {
    store: Arc<dyn WorkloadStore<Notebook>>,
    scheduler: Arc<Scheduler>,
    cache: Arc<ClusterCache>,
    max_queued_time: Duration,
    interval: Duration,
}

impl Rescheduler {
    pub fn new(
        store: Arc<dyn WorkloadStore<Notebook>>,
        scheduler: Arc<Scheduler>,
        cache: Arc<ClusterCache>,
        max_queued_time: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            cache,
            max_queued_time,
            interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            max_queued_secs = self.max_queued_time.as_secs(),
            "Starting notebook rescheduler"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(stats) if stats != RescheduleStats::default() => info!(
                            requeued = stats.requeued,
                            rescheduled = stats.rescheduled,
                            unschedulable = stats.unschedulable,
                            "Reschedule pass complete"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Reschedule pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Notebook rescheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> ControllerResult<RescheduleStats> {
        let mut stats = RescheduleStats::default();

        for row in self.store.list_by_state(WorkloadState::Initializing).await? {
            if self.is_stuck(&row, now) && self.requeue(&row).await? {
                stats.requeued += 1;
            }
        }

        for row in self.store.list_by_state(WorkloadState::Requeued).await? {
            if self.reschedule(row, now).await? {
                stats.rescheduled += 1;
            } else {
                stats.unschedulable += 1;
            }
        }

        Ok(stats)
    }

    fn is_stuck(&self, row: &Workload<Notebook>, now: DateTime<Utc>) -> bool {
        let pulling = row
            .reason
            .as_deref()
            .is_some_and(|r| r.contains(PULLING_REASON));
        !pulling && is_older_than(row.updated_at, self.max_queued_time, now)
    }

    async fn requeue(&self, row: &Workload<Notebook>) -> ControllerResult<bool> {
        let updated = tolerate_conflict(
            self.store
                .set_queued_action(
                    &row.id,
                    row.version,
                    QueuedAction::Requeue,
                    WorkloadUpdate::new().reason(INITIALIZATION_TIMEOUT_REASON),
                )
                .await,
        )?;
        if updated.is_some() {
            warn!(notebook_id = %row.id, cluster_id = ?row.cluster_id, since = %row.updated_at, "Notebook stuck initializing; requeued");
        }
        Ok(updated.is_some())
    }

    /// Returns false if no cluster could take the notebook this time.
    #[instrument(skip(self, row, now), fields(notebook_id = %row.id))]
    async fn reschedule(&self, row: Workload<Notebook>, now: DateTime<Utc>) -> ControllerResult<bool> {
        let gpu_count = row.payload.gpu_count();
        let request = SchedulingRequest {
            tenant_id: &row.tenant_id,
            entitlements: &row.payload.entitlements,
            preferred_cluster_id: None,
            excluded_cluster_id: row.cluster_id.as_deref(),
            gpu_count,
        };
        let target = match self.scheduler.schedule_at(request, now).await {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "Notebook not reschedulable yet");
                return Ok(false);
            }
        };

        let mut moved = row.clone();
        moved.payload.set_placement(Placement {
            cluster_id: target.cluster_id.clone(),
            cluster_name: target.cluster_name.clone(),
            namespace: target.namespace.clone(),
        });

        if gpu_count > 0 {
            self.cache
                .add_assumed_pod_at(
                    &row.tenant_id,
                    &target.cluster_id,
                    &moved.assumed_pod_key(),
                    gpu_count,
                    now,
                )
                .await?;
        }

        let update = WorkloadUpdate::new()
            .payload(moved.payload)
            .cluster_id(target.cluster_id.clone());
        let updated = tolerate_conflict(
            self.store
                .set_queued_action(&row.id, row.version, QueuedAction::Start, update)
                .await,
        )?;
        match updated {
            Some(_) => info!(from = ?row.cluster_id, to = %target.cluster_id, "Notebook rescheduled"),
            None => debug!("Notebook changed while rescheduling"),
        }
        Ok(updated.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ClusterRecord, ClusterStatus, GpuNode, MemoryClusterSource};
    use crate::scheduler::Entitlement;
    use crate::workload::{MemoryWorkloadStore, Resources};
    use chrono::{Duration as ChronoDuration, TimeZone};

    const MAX_QUEUED: Duration = Duration::from_secs(600);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn record(cluster_id: &str, allocatable: u32) -> ClusterRecord {
        ClusterRecord {
            tenant_id: "tenant-a".into(),
            cluster_id: cluster_id.into(),
            name: format!("{cluster_id}-name"),
            status: ClusterStatus {
                gpu_nodes: vec![GpuNode {
                    resource_name: "nvidia.com/gpu".into(),
                    allocatable_count: allocatable,
                }],
                ..Default::default()
            },
            updated_at: t0(),
        }
    }

    fn entitlement(cluster_id: &str) -> Entitlement {
        Entitlement {
            cluster_id: cluster_id.into(),
            cluster_name: String::new(),
            namespace: format!("{cluster_id}-ns"),
        }
    }

    fn notebook(entitlements: Vec<Entitlement>) -> Notebook {
        Notebook {
            name: "scratch".into(),
            image: "jupyter/base-notebook".into(),
            envs: Default::default(),
            resources: Resources { gpu_count: 2 },
            placement: Placement {
                cluster_id: "c1".into(),
                cluster_name: "c1-name".into(),
                namespace: "c1-ns".into(),
            },
            entitlements,
            started_at: None,
            stopped_at: None,
            error: None,
        }
    }

    struct Fixture {
        store: Arc<MemoryWorkloadStore<Notebook>>,
        cache: Arc<ClusterCache>,
        rescheduler: Rescheduler,
    }

    fn fixture(records: Vec<ClusterRecord>) -> Fixture {
        let store = Arc::new(MemoryWorkloadStore::new());
        let cache = Arc::new(ClusterCache::new(Arc::new(MemoryClusterSource::with_records(records))));
        let scheduler = Arc::new(Scheduler::new(cache.clone()));
        let rescheduler = Rescheduler::new(
            store.clone(),
            scheduler,
            cache.clone(),
            MAX_QUEUED,
            Duration::from_secs(10),
        );
        Fixture {
            store,
            cache,
            rescheduler,
        }
    }

    /// Creates a notebook and moves it to Initializing; returns its updated_at.
    async fn initializing(f: &Fixture, entitlements: Vec<Entitlement>, reason: Option<&str>) -> DateTime<Utc> {
        let row = Workload::new("nb-1".to_string(), "tenant-a", "p1", notebook(entitlements), t0());
        f.store.create(&row).await.unwrap();
        let mut update = WorkloadUpdate::new();
        if let Some(reason) = reason {
            update = update.reason(reason);
        }
        f.store
            .set_state("nb-1", 0, WorkloadState::Initializing, update)
            .await
            .unwrap()
            .updated_at
    }

    async fn requeued(f: &Fixture, entitlements: Vec<Entitlement>) {
        initializing(f, entitlements, None).await;
        f.store
            .set_queued_action("nb-1", 1, QueuedAction::Requeue, WorkloadUpdate::new())
            .await
            .unwrap();
        f.store
            .set_state("nb-1", 2, WorkloadState::Requeued, WorkloadUpdate::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stuck_initializing_is_requeued() {
        let f = fixture(vec![record("c1", 8)]);
        let since = initializing(&f, vec![entitlement("c1")], None).await;

        let stats = f.rescheduler.run_once(since + ChronoDuration::seconds(599)).await.unwrap();
        assert_eq!(stats.requeued, 0);

        let stats = f.rescheduler.run_once(since + ChronoDuration::seconds(601)).await.unwrap();
        assert_eq!(stats.requeued, 1);
        let row = f.store.get("nb-1").await.unwrap();
        assert!(row.is_queued_with(QueuedAction::Requeue));
        assert_eq!(row.reason.as_deref(), Some(INITIALIZATION_TIMEOUT_REASON));
    }

    #[tokio::test]
    async fn test_pulling_image_is_not_requeued() {
        let f = fixture(vec![record("c1", 8)]);
        let since = initializing(&f, vec![entitlement("c1")], Some("Pulling")).await;

        let stats = f.rescheduler.run_once(since + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(stats, RescheduleStats::default());
        assert_eq!(f.store.get("nb-1").await.unwrap().state, WorkloadState::Initializing);
    }

    #[tokio::test]
    async fn test_requeued_moves_to_other_cluster() {
        let f = fixture(vec![record("c1", 8), record("c2", 8)]);
        requeued(&f, vec![entitlement("c1"), entitlement("c2")]).await;

        let stats = f.rescheduler.run_once(t0()).await.unwrap();
        assert_eq!(stats.rescheduled, 1);

        let row = f.store.get("nb-1").await.unwrap();
        assert!(row.is_queued_with(QueuedAction::Start));
        assert_eq!(row.cluster_id.as_deref(), Some("c2"));
        assert_eq!(row.payload.placement.namespace, "c2-ns");
        assert_eq!(row.payload.placement.cluster_name, "c2-name");

        let clusters = f.cache.list_clusters_at("tenant-a", t0()).await.unwrap();
        assert_eq!(clusters["c2"].assumed_gpus(t0()), 2);
    }

    #[tokio::test]
    async fn test_unschedulable_stays_requeued() {
        let f = fixture(vec![record("c1", 8), record("c2", 1)]);
        requeued(&f, vec![entitlement("c1"), entitlement("c2")]).await;

        let stats = f.rescheduler.run_once(t0()).await.unwrap();
        assert_eq!(stats.unschedulable, 1);
        let row = f.store.get("nb-1").await.unwrap();
        assert_eq!(row.state, WorkloadState::Requeued);
        assert_eq!(row.version, 3);
    }
}
