//! Per-tenant cache of cluster GPU status.
//!
//! The cache holds the last report of every cluster a tenant owns plus a
//! short-lived ledger of placements the scheduler has made but no report has
//! confirmed yet. Those assumed placements keep capacity occupied between a
//! scheduling decision and the report that shows the pod, which is what stops
//! back-to-back requests from landing on the same free GPUs.
//!
//! Reads hand out copies. The lock is held only to copy in or out; the one
//! I/O path (loading a tenant on a miss) runs without it.

mod cluster;
mod source;

pub use cluster::{
    AssumedGpuPod, Cluster, ClusterRecord, ClusterStatus, GpuNode, GpuPod, ProvisionableResource,
    ASSUMED_POD_EXPIRATION,
};
pub use source::{ClusterSource, MemoryClusterSource};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cluster not found: tenant={tenant_id} cluster={cluster_id}")]
    ClusterNotFound {
        tenant_id: String,
        cluster_id: String,
    },

    #[error("failed to load clusters: {0}")]
    Source(#[from] DbError),
}

pub type CacheResult<T> = Result<T, CacheError>;

type TenantClusters = HashMap<String, Cluster>;

pub struct ClusterCache {
    source: Arc<dyn ClusterSource>,
    tenants: RwLock<HashMap<String, TenantClusters>>,
}

impl ClusterCache {
    pub fn new(source: Arc<dyn ClusterSource>) -> Self {
        Self {
            source,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub async fn list_clusters(&self, tenant_id: &str) -> CacheResult<HashMap<String, Cluster>> {
        self.list_clusters_at(tenant_id, Utc::now()).await
    }

    /// Copies of every cluster of `tenant_id`, with assumed entries that have
    /// expired by `now` left out.
    pub async fn list_clusters_at(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> CacheResult<HashMap<String, Cluster>> {
        self.ensure_loaded(tenant_id).await?;

        let tenants = self.tenants.read().await;
        let mut clusters = tenants.get(tenant_id).cloned().unwrap_or_default();
        for cluster in clusters.values_mut() {
            cluster.drop_expired_assumed(now);
        }
        Ok(clusters)
    }

    pub async fn add_or_update_cluster(&self, record: &ClusterRecord) -> CacheResult<()> {
        self.add_or_update_cluster_at(record, Utc::now()).await
    }

    /// Replaces a cluster's confirmed state with `record`, keeping assumed
    /// placements that are neither confirmed by it nor expired at `now`.
    /// A record older than the cached one is ignored.
    #[instrument(skip(self, record), fields(tenant_id = %record.tenant_id, cluster_id = %record.cluster_id))]
    pub async fn add_or_update_cluster_at(
        &self,
        record: &ClusterRecord,
        now: DateTime<Utc>,
    ) -> CacheResult<()> {
        self.ensure_loaded(&record.tenant_id).await?;

        let mut fresh = Cluster::from_record(record);
        let mut tenants = self.tenants.write().await;
        let clusters = tenants.entry(record.tenant_id.clone()).or_default();
        if let Some(previous) = clusters.get(&record.cluster_id) {
            if record.updated_at < previous.updated_at {
                debug!(
                    reported_at = %record.updated_at,
                    cached_at = %previous.updated_at,
                    "Ignoring out-of-order cluster status"
                );
                return Ok(());
            }
            fresh.inherit_assumed(previous, now);
        }
        debug!(
            gpu_nodes = fresh.gpu_nodes.len(),
            gpu_pods = fresh.gpu_pods.len(),
            assumed = fresh.assumed_gpu_pods.len(),
            "Cluster status cached"
        );
        clusters.insert(record.cluster_id.clone(), fresh);
        Ok(())
    }

    /// Persists a status report, then caches it.
    pub async fn record_status_at(&self, record: &ClusterRecord, now: DateTime<Utc>) -> CacheResult<()> {
        self.source.upsert_cluster(record).await?;
        self.add_or_update_cluster_at(record, now).await
    }

    pub async fn add_assumed_pod(
        &self,
        tenant_id: &str,
        cluster_id: &str,
        key: &str,
        gpu_count: u32,
    ) -> CacheResult<()> {
        self.add_assumed_pod_at(tenant_id, cluster_id, key, gpu_count, Utc::now())
            .await
    }

    /// Records a placement of `gpu_count` GPUs under `key` (`namespace/workload-id`).
    ///
    /// Fails if the cluster has never reported status for this tenant.
    pub async fn add_assumed_pod_at(
        &self,
        tenant_id: &str,
        cluster_id: &str,
        key: &str,
        gpu_count: u32,
        now: DateTime<Utc>,
    ) -> CacheResult<()> {
        self.ensure_loaded(tenant_id).await?;

        let mut tenants = self.tenants.write().await;
        let cluster = tenants
            .get_mut(tenant_id)
            .and_then(|clusters| clusters.get_mut(cluster_id))
            .ok_or_else(|| CacheError::ClusterNotFound {
                tenant_id: tenant_id.to_string(),
                cluster_id: cluster_id.to_string(),
            })?;

        cluster.assumed_gpu_pods.insert(
            key.to_string(),
            AssumedGpuPod {
                allocated_count: gpu_count,
                added_at: now,
            },
        );
        debug!(tenant_id, cluster_id, key, gpu_count, "Assumed GPU pod recorded");
        Ok(())
    }

    async fn ensure_loaded(&self, tenant_id: &str) -> CacheResult<()> {
        if self.tenants.read().await.contains_key(tenant_id) {
            return Ok(());
        }

        let records = self.source.list_clusters_by_tenant(tenant_id).await?;
        let loaded: TenantClusters = records
            .iter()
            .map(|r| (r.cluster_id.clone(), Cluster::from_record(r)))
            .collect();

        // A concurrent loader may have won; its copy may already hold assumed pods.
        let mut tenants = self.tenants.write().await;
        tenants.entry(tenant_id.to_string()).or_insert(loaded);
        debug!(tenant_id, clusters = records.len(), "Loaded tenant clusters");
        Ok(())
    }
}
