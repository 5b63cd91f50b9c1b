//! Cluster status as reported by a cluster agent, and its cached form.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Assumed placements not confirmed within this window are forgotten.
pub const ASSUMED_POD_EXPIRATION: Duration = Duration::from_secs(60);

/// A node exposing GPUs under `resource_name` (e.g. `nvidia.com/gpu`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuNode {
    pub resource_name: String,
    pub allocatable_count: u32,
}

/// A node shape the cluster autoscaler can still create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionableResource {
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub instance_family: String,
}

/// A running pod holding GPUs, keyed by `namespace/pod-name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuPod {
    pub resource_name: String,
    pub allocated_count: u32,
    pub namespaced_name: String,
}

/// Status document a cluster agent reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(default)]
    pub gpu_nodes: Vec<GpuNode>,
    #[serde(default)]
    pub provisionable_resources: Vec<ProvisionableResource>,
    #[serde(default)]
    pub gpu_pods: Vec<GpuPod>,
}

/// Persisted form of a cluster's last report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub tenant_id: String,
    pub cluster_id: String,
    pub name: String,
    pub status: ClusterStatus,
    pub updated_at: DateTime<Utc>,
}

/// A placement decided by the scheduler that no status report has confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssumedGpuPod {
    pub allocated_count: u32,
    pub added_at: DateTime<Utc>,
}

impl AssumedGpuPod {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        jobmgr_reconcile::elapsed_since(self.added_at, now) >= ASSUMED_POD_EXPIRATION
    }
}

/// Cached view of one (tenant, cluster).
///
/// Cloning copies the vectors and maps but shares the status entries they
/// point to; entries are never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub tenant_id: String,
    pub cluster_id: String,
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub gpu_nodes: Vec<Arc<GpuNode>>,
    pub provisionable_resources: Vec<Arc<ProvisionableResource>>,
    pub gpu_pods: BTreeMap<String, Arc<GpuPod>>,
    pub assumed_gpu_pods: BTreeMap<String, AssumedGpuPod>,
}

impl Cluster {
    pub fn from_record(record: &ClusterRecord) -> Self {
        let gpu_pods = record
            .status
            .gpu_pods
            .iter()
            .map(|pod| (pod.namespaced_name.clone(), Arc::new(pod.clone())))
            .collect();

        Self {
            tenant_id: record.tenant_id.clone(),
            cluster_id: record.cluster_id.clone(),
            name: record.name.clone(),
            updated_at: record.updated_at,
            gpu_nodes: record.status.gpu_nodes.iter().cloned().map(Arc::new).collect(),
            provisionable_resources: record
                .status
                .provisionable_resources
                .iter()
                .cloned()
                .map(Arc::new)
                .collect(),
            gpu_pods,
            assumed_gpu_pods: BTreeMap::new(),
        }
    }

    /// True if some confirmed pod belongs to the workload behind `assumed_key`.
    ///
    /// Pod names extend the workload name, so a prefix match is enough.
    pub fn has_confirmed_pod(&self, assumed_key: &str) -> bool {
        self.gpu_pods.keys().any(|name| name.starts_with(assumed_key))
    }

    /// Carries over `previous` assumed entries that are still unconfirmed and fresh.
    pub(crate) fn inherit_assumed(&mut self, previous: &Cluster, now: DateTime<Utc>) {
        for (key, pod) in &previous.assumed_gpu_pods {
            if pod.is_expired(now) || self.has_confirmed_pod(key) {
                continue;
            }
            self.assumed_gpu_pods.insert(key.clone(), *pod);
        }
    }

    pub(crate) fn drop_expired_assumed(&mut self, now: DateTime<Utc>) {
        self.assumed_gpu_pods.retain(|_, pod| !pod.is_expired(now));
    }

    pub fn allocatable_gpus(&self) -> u64 {
        self.gpu_nodes
            .iter()
            .map(|node| u64::from(node.allocatable_count))
            .sum()
    }

    pub fn allocated_gpus(&self) -> u64 {
        self.gpu_pods
            .values()
            .map(|pod| u64::from(pod.allocated_count))
            .sum()
    }

    /// GPUs held by assumed placements that are still within the window.
    pub fn assumed_gpus(&self, now: DateTime<Utc>) -> u64 {
        self.assumed_gpu_pods
            .values()
            .filter(|pod| !pod.is_expired(now))
            .map(|pod| u64::from(pod.allocated_count))
            .sum()
    }
}
