//! Controller background worker.
//!
//! One tick walks every configured (tenant, cluster) target: refresh the
//! cluster's status report, let each controller dispatch its Queued rows,
//! then reconcile every watched resource. Resources that asked to be looked
//! at later are skipped until their time comes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobmgr_reconcile::{RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use super::{ClusterTarget, ControllerResult, WorkloadController};
use crate::cache::{ClusterCache, ClusterRecord};
use crate::cluster::{ResourceKey, ResourceObserver};

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub clusters_synced: usize,
    pub dispatched: usize,
    pub reconciled: usize,
    pub deferred: usize,
    pub errors: usize,
}

impl TickStats {
    fn is_idle(&self) -> bool {
        self.dispatched == 0 && self.errors == 0
    }
}

pub struct ControllerWorker {
    targets: Vec<ClusterTarget>,
    controllers: Vec<Arc<dyn WorkloadController>>,
    observer: Arc<dyn ResourceObserver>,
    cache: Arc<ClusterCache>,
    interval: Duration,
    /// resource -> earliest time it should be reconciled again
    not_before: Mutex<HashMap<ResourceKey, DateTime<Utc>>>,
    retries: Mutex<RetryTracker>,
}

impl ControllerWorker {
    pub fn new(
        targets: Vec<ClusterTarget>,
        controllers: Vec<Arc<dyn WorkloadController>>,
        observer: Arc<dyn ResourceObserver>,
        cache: Arc<ClusterCache>,
        interval: Duration,
    ) -> Self {
        Self {
            targets,
            controllers,
            observer,
            cache,
            interval,
            not_before: Mutex::new(HashMap::new()),
            retries: Mutex::new(RetryTracker::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)),
        }
    }

    /// Run the controllers until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            targets = self.targets.len(),
            controllers = self.controllers.len(),
            "Starting controller worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.tick(Utc::now()).await;
                    if !stats.is_idle() {
                        info!(
                            clusters_synced = stats.clusters_synced,
                            dispatched = stats.dispatched,
                            reconciled = stats.reconciled,
                            deferred = stats.deferred,
                            errors = stats.errors,
                            "Controller tick complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over every target. Failures are counted, never fatal.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickStats {
        let mut stats = TickStats::default();
        let mut watched: Option<HashSet<ResourceKey>> = Some(HashSet::new());

        for target in &self.targets {
            match self.sync_cluster_status(target, now).await {
                Ok(true) => stats.clusters_synced += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(tenant_id = %target.tenant_id, cluster_id = %target.cluster_id, error = %e, "Cluster status sync failed");
                    stats.errors += 1;
                }
            }

            for controller in &self.controllers {
                match controller.dispatch(target, now).await {
                    Ok(n) => stats.dispatched += n,
                    Err(e) => {
                        warn!(controller = controller.name(), cluster_id = %target.cluster_id, error = %e, "Dispatch pass failed");
                        stats.errors += 1;
                    }
                }
            }

            for controller in &self.controllers {
                let keys = self
                    .watch_pass(controller.as_ref(), target, now, &mut stats)
                    .await;
                watched = watched.zip(keys).map(|(mut all, keys)| {
                    all.extend(keys);
                    all
                });
            }
        }

        // A failed listing leaves the watch set incomplete; keep deferrals then.
        if let Some(watched) = watched {
            self.not_before
                .lock()
                .await
                .retain(|key, _| watched.contains(key));
        }
        self.retries.lock().await.prune(now);
        stats
    }

    async fn sync_cluster_status(&self, target: &ClusterTarget, now: DateTime<Utc>) -> ControllerResult<bool> {
        let Some(report) = self.observer.cluster_status(&target.cluster_id).await? else {
            debug!(cluster_id = %target.cluster_id, "Cluster has no status report yet");
            return Ok(false);
        };
        let record = ClusterRecord {
            tenant_id: target.tenant_id.clone(),
            cluster_id: target.cluster_id.clone(),
            name: report.name,
            status: report.status,
            updated_at: now,
        };
        self.cache.record_status_at(&record, now).await?;
        Ok(true)
    }

    async fn watch_pass(
        &self,
        controller: &dyn WorkloadController,
        target: &ClusterTarget,
        now: DateTime<Utc>,
        stats: &mut TickStats,
    ) -> Option<Vec<ResourceKey>> {
        let keys = match controller.watched_keys(target).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(controller = controller.name(), cluster_id = %target.cluster_id, error = %e, "Listing watched resources failed");
                stats.errors += 1;
                return None;
            }
        };

        for key in &keys {
            let due = self.not_before.lock().await.get(key).is_none_or(|at| *at <= now);
            if !due {
                stats.deferred += 1;
                continue;
            }

            match controller.reconcile(key, now).await {
                Ok(result) => {
                    stats.reconciled += 1;
                    self.retries.lock().await.clear(&key.to_string());
                    let mut not_before = self.not_before.lock().await;
                    match result.requeue_after {
                        Some(after) => {
                            let at = chrono::Duration::from_std(after)
                                .map_or(now, |after| now + after);
                            not_before.insert(key.clone(), at);
                        }
                        None => {
                            not_before.remove(key);
                        }
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    let mut retries = self.retries.lock().await;
                    retries.record_failure(&key.to_string(), now);
                    if retries.is_exhausted(&key.to_string(), now) {
                        error!(
                            controller = controller.name(),
                            resource = %key,
                            failures = retries.failure_count(&key.to_string()),
                            error = %e,
                            "Reconcile keeps failing"
                        );
                    } else {
                        warn!(controller = controller.name(), resource = %key, error = %e, "Reconcile failed");
                    }
                }
            }
        }
        Some(keys)
    }
}
