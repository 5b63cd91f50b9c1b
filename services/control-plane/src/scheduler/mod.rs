//! Cluster placement for new and rescheduled workloads.
//!
//! The caller presents the (cluster, namespace) pairs it may use. The first
//! admissible pair wins; there is no spreading or bin packing. The scheduler
//! only reads the cache; recording the assumed placement is up to the caller.

mod gpu;

pub use gpu::{can_provision_gpus, is_gpu_family, is_gpu_instance_type};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cache::{CacheError, ClusterCache};

/// Clusters silent for longer than this are not trusted with GPU work.
pub const STALE_CLUSTER_THRESHOLD: Duration = Duration::from_secs(30 * 60);

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no cluster/namespace is available")]
    NoEntitlements,

    #[error("no schedulable cluster for {gpu_count} GPU(s)")]
    NoSchedulableCluster { gpu_count: u32 },

    #[error("invalid instance type: {0}")]
    InvalidInstanceType(String),

    #[error("cluster cache: {0}")]
    Cache(#[from] CacheError),
}

/// A (cluster, namespace) pair the caller may schedule into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub cluster_id: String,
    #[serde(default)]
    pub cluster_name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulingRequest<'a> {
    pub tenant_id: &'a str,
    pub entitlements: &'a [Entitlement],
    /// When set, only this cluster is considered.
    pub preferred_cluster_id: Option<&'a str>,
    /// Never chosen; used when moving a workload off a cluster.
    pub excluded_cluster_id: Option<&'a str>,
    pub gpu_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingResult {
    pub cluster_id: String,
    pub cluster_name: String,
    pub namespace: String,
}

pub struct Scheduler {
    cache: Arc<ClusterCache>,
}

impl Scheduler {
    pub fn new(cache: Arc<ClusterCache>) -> Self {
        Self { cache }
    }

    pub async fn schedule(&self, request: SchedulingRequest<'_>) -> SchedulerResult<SchedulingResult> {
        self.schedule_at(request, Utc::now()).await
    }

    #[instrument(skip(self, request), fields(tenant_id = request.tenant_id, gpu_count = request.gpu_count))]
    pub async fn schedule_at(
        &self,
        request: SchedulingRequest<'_>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<SchedulingResult> {
        if request.entitlements.is_empty() {
            return Err(SchedulerError::NoEntitlements);
        }

        let candidates = request.entitlements.iter().filter(|e| {
            request
                .preferred_cluster_id
                .is_none_or(|preferred| e.cluster_id == preferred)
                && request
                    .excluded_cluster_id
                    .is_none_or(|excluded| e.cluster_id != excluded)
        });

        let clusters = self.cache.list_clusters_at(request.tenant_id, now).await?;

        for entitlement in candidates {
            let cluster = clusters.get(&entitlement.cluster_id);

            if request.gpu_count == 0 {
                return Ok(SchedulingResult {
                    cluster_id: entitlement.cluster_id.clone(),
                    cluster_name: cluster
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| entitlement.cluster_name.clone()),
                    namespace: entitlement.namespace.clone(),
                });
            }

            let Some(cluster) = cluster else {
                debug!(cluster_id = %entitlement.cluster_id, "Skipping cluster without status");
                continue;
            };
            if jobmgr_reconcile::is_older_than(cluster.updated_at, STALE_CLUSTER_THRESHOLD, now) {
                debug!(cluster_id = %cluster.cluster_id, updated_at = %cluster.updated_at, "Skipping stale cluster");
                continue;
            }
            if !can_provision_gpus(request.gpu_count, cluster, now)? {
                debug!(cluster_id = %cluster.cluster_id, "Not enough GPU capacity");
                continue;
            }

            return Ok(SchedulingResult {
                cluster_id: cluster.cluster_id.clone(),
                cluster_name: cluster.name.clone(),
                namespace: entitlement.namespace.clone(),
            });
        }

        Err(SchedulerError::NoSchedulableCluster {
            gpu_count: request.gpu_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{
        ClusterRecord, ClusterStatus, GpuNode, GpuPod, MemoryClusterSource, ProvisionableResource,
    };
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn record(cluster_id: &str, status: ClusterStatus) -> ClusterRecord {
        ClusterRecord {
            tenant_id: "tenant-a".into(),
            cluster_id: cluster_id.into(),
            name: format!("{cluster_id}-name"),
            status,
            updated_at: now(),
        }
    }

    fn gpu_status(allocatable: u32, allocated: u32) -> ClusterStatus {
        ClusterStatus {
            gpu_nodes: vec![GpuNode {
                resource_name: "nvidia.com/gpu".into(),
                allocatable_count: allocatable,
            }],
            provisionable_resources: vec![],
            gpu_pods: if allocated > 0 {
                vec![GpuPod {
                    resource_name: "nvidia.com/gpu".into(),
                    allocated_count: allocated,
                    namespaced_name: "ns/existing-0".into(),
                }]
            } else {
                vec![]
            },
        }
    }

    fn provisionable(instance_type: &str) -> ClusterStatus {
        ClusterStatus {
            provisionable_resources: vec![ProvisionableResource {
                instance_type: instance_type.into(),
                instance_family: String::new(),
            }],
            ..Default::default()
        }
    }

    fn entitlement(cluster_id: &str) -> Entitlement {
        Entitlement {
            cluster_id: cluster_id.into(),
            cluster_name: String::new(),
            namespace: format!("{cluster_id}-ns"),
        }
    }

    fn scheduler(records: Vec<ClusterRecord>) -> (Scheduler, Arc<ClusterCache>) {
        let cache = Arc::new(ClusterCache::new(Arc::new(MemoryClusterSource::with_records(
            records,
        ))));
        (Scheduler::new(cache.clone()), cache)
    }

    fn request<'a>(entitlements: &'a [Entitlement], gpu_count: u32) -> SchedulingRequest<'a> {
        SchedulingRequest {
            tenant_id: "tenant-a",
            entitlements,
            preferred_cluster_id: None,
            excluded_cluster_id: None,
            gpu_count,
        }
    }

    #[tokio::test]
    async fn test_no_entitlements() {
        let (scheduler, _) = scheduler(vec![]);
        let err = scheduler.schedule_at(request(&[], 0), now()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoEntitlements));
    }

    #[tokio::test]
    async fn test_zero_gpus_takes_first_entitlement_without_status() {
        let (scheduler, _) = scheduler(vec![record("c1", ClusterStatus::default())]);
        let ents = [entitlement("unknown"), entitlement("c1")];
        let result = scheduler.schedule_at(request(&ents, 0), now()).await.unwrap();
        assert_eq!(result.cluster_id, "unknown");
        assert_eq!(result.namespace, "unknown-ns");
    }

    #[tokio::test]
    async fn test_gpu_request_rejected_without_gpu_capacity() {
        let (scheduler, _) = scheduler(vec![
            record("c1", ClusterStatus::default()),
            record("c2", provisionable("m5.large")),
        ]);
        let ents = [entitlement("c1"), entitlement("c2")];
        let err = scheduler.schedule_at(request(&ents, 1), now()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoSchedulableCluster { gpu_count: 1 }));
    }

    #[tokio::test]
    async fn test_gpu_request_accepts_node_or_provisionable_shape() {
        let (scheduler, _) = scheduler(vec![
            record("c1", ClusterStatus::default()),
            record("c2", gpu_status(8, 0)),
            record("c3", provisionable("g5.12xlarge")),
        ]);

        let ents = [entitlement("c1"), entitlement("c2")];
        let result = scheduler.schedule_at(request(&ents, 1), now()).await.unwrap();
        assert_eq!(result.cluster_id, "c2");
        assert_eq!(result.cluster_name, "c2-name");

        let ents = [entitlement("c1"), entitlement("c3")];
        let result = scheduler.schedule_at(request(&ents, 4), now()).await.unwrap();
        assert_eq!(result.cluster_id, "c3");
    }

    #[tokio::test]
    async fn test_malformed_instance_type_is_error() {
        let (scheduler, _) = scheduler(vec![record("c1", provisionable("g5xlarge"))]);
        let ents = [entitlement("c1")];
        let err = scheduler.schedule_at(request(&ents, 1), now()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInstanceType(_)));
    }

    #[tokio::test]
    async fn test_assumed_pods_consume_capacity() {
        let (scheduler, cache) = scheduler(vec![record("c1", gpu_status(8, 4))]);
        let ents = [entitlement("c1")];

        scheduler.schedule_at(request(&ents, 4), now()).await.unwrap();
        cache
            .add_assumed_pod_at("tenant-a", "c1", "c1-ns/job-1", 4, now())
            .await
            .unwrap();

        let err = scheduler.schedule_at(request(&ents, 1), now()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoSchedulableCluster { .. }));

        let later = now() + ChronoDuration::seconds(61);
        scheduler.schedule_at(request(&ents, 4), later).await.unwrap();
    }

    #[tokio::test]
    async fn test_preferred_cluster_is_exclusive() {
        let (scheduler, _) = scheduler(vec![
            record("c1", gpu_status(8, 0)),
            record("c2", gpu_status(1, 1)),
        ]);
        let ents = [entitlement("c1"), entitlement("c2")];
        let mut req = request(&ents, 1);
        req.preferred_cluster_id = Some("c2");
        let err = scheduler.schedule_at(req, now()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoSchedulableCluster { .. }));

        req.preferred_cluster_id = Some("c1");
        assert_eq!(scheduler.schedule_at(req, now()).await.unwrap().cluster_id, "c1");
    }

    #[tokio::test]
    async fn test_excluded_and_stale_clusters_are_skipped() {
        let mut stale = record("c2", gpu_status(8, 0));
        stale.updated_at = now() - ChronoDuration::minutes(31);
        let (scheduler, _) = scheduler(vec![record("c1", gpu_status(8, 0)), stale, record("c3", gpu_status(8, 0))]);

        let ents = [entitlement("c1"), entitlement("c2"), entitlement("c3")];
        let mut req = request(&ents, 1);
        req.excluded_cluster_id = Some("c1");
        assert_eq!(scheduler.schedule_at(req, now()).await.unwrap().cluster_id, "c3");
    }
}
