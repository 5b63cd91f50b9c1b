//! Where the cache loads clusters from on a miss.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::ClusterRecord;
use crate::db::DbError;

/// Persistence collaborator for cluster status reports.
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn list_clusters_by_tenant(&self, tenant_id: &str) -> Result<Vec<ClusterRecord>, DbError>;

    async fn upsert_cluster(&self, record: &ClusterRecord) -> Result<(), DbError>;
}

/// In-memory source for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryClusterSource {
    records: Mutex<BTreeMap<(String, String), ClusterRecord>>,
    loads: Mutex<u32>,
}

impl MemoryClusterSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ClusterRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|r| ((r.tenant_id.clone(), r.cluster_id.clone()), r))
            .collect();
        Self {
            records: Mutex::new(map),
            loads: Mutex::new(0),
        }
    }

    /// Number of tenant loads served so far.
    pub async fn load_count(&self) -> u32 {
        *self.loads.lock().await
    }
}

#[async_trait]
impl ClusterSource for MemoryClusterSource {
    async fn list_clusters_by_tenant(&self, tenant_id: &str) -> Result<Vec<ClusterRecord>, DbError> {
        *self.loads.lock().await += 1;
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn upsert_cluster(&self, record: &ClusterRecord) -> Result<(), DbError> {
        let mut records = self.records.lock().await;
        let key = (record.tenant_id.clone(), record.cluster_id.clone());
        if records.get(&key).is_none_or(|r| r.updated_at <= record.updated_at) {
            records.insert(key, record.clone());
        }
        Ok(())
    }
}
