//! In-memory workload store used by tests and local runs.
//!
//! The map lock makes each CAS atomic, matching the single-statement
//! conditional update of the Postgres store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{
    cas_failure, Page, Payload, QueuedAction, StoreError, StoreResult, Workload, WorkloadState,
    WorkloadStore, WorkloadUpdate,
};

pub struct MemoryWorkloadStore<P> {
    rows: Mutex<BTreeMap<String, Workload<P>>>,
}

impl<P> Default for MemoryWorkloadStore<P> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<P: Payload> MemoryWorkloadStore<P> {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(id: &str) -> StoreError {
        StoreError::NotFound {
            kind: P::KIND,
            id: id.to_string(),
        }
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected_version: i64,
        target: &str,
        allowed: impl FnOnce(&Workload<P>) -> bool,
        apply: impl FnOnce(&mut Workload<P>),
        update: WorkloadUpdate<P>,
    ) -> StoreResult<Workload<P>> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(id) else {
            return Err(cas_failure(P::KIND, id, expected_version, None, target));
        };
        if row.version != expected_version || !allowed(row) {
            let current = Some((row.state, row.queued_action, row.version));
            return Err(cas_failure(P::KIND, id, expected_version, current, target));
        }

        apply(row);
        if let Some(payload) = update.payload {
            row.payload = payload;
        }
        if let Some(cluster_id) = update.cluster_id {
            row.cluster_id = Some(cluster_id);
        }
        row.reason = update.reason;
        row.version += 1;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

#[async_trait]
impl<P: Payload> WorkloadStore<P> for MemoryWorkloadStore<P> {
    async fn create(&self, workload: &Workload<P>) -> StoreResult<()> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&workload.id) {
            return Err(StoreError::AlreadyExists {
                kind: P::KIND,
                id: workload.id.clone(),
            });
        }
        rows.insert(workload.id.clone(), workload.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Workload<P>> {
        self.rows
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Self::not_found(id))
    }

    async fn get_in_project(&self, id: &str, project_id: &str) -> StoreResult<Workload<P>> {
        self.rows
            .lock()
            .await
            .get(id)
            .filter(|w| w.project_id == project_id)
            .cloned()
            .ok_or_else(|| Self::not_found(id))
    }

    async fn list_queued(&self, tenant_id: &str, cluster_id: &str) -> StoreResult<Vec<Workload<P>>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|w| {
                w.state == WorkloadState::Queued
                    && w.tenant_id == tenant_id
                    && w.cluster_id.as_deref() == Some(cluster_id)
            })
            .cloned()
            .collect())
    }

    async fn list_by_state(&self, state: WorkloadState) -> StoreResult<Vec<Workload<P>>> {
        let rows = self.rows.lock().await;
        Ok(rows.values().filter(|w| w.state == state).cloned().collect())
    }

    async fn list_by_project(
        &self,
        project_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Page<P>> {
        let rows = self.rows.lock().await;
        let mut items: Vec<Workload<P>> = rows
            .values()
            .rev()
            .filter(|w| w.project_id == project_id && w.state != WorkloadState::Deleted)
            .filter(|w| after.is_none_or(|after| w.id.as_str() < after))
            .take(limit + 1)
            .cloned()
            .collect();

        let has_more = items.len() > limit;
        items.truncate(limit);
        Ok(Page { items, has_more })
    }

    async fn set_queued_action(
        &self,
        id: &str,
        expected_version: i64,
        action: QueuedAction,
        update: WorkloadUpdate<P>,
    ) -> StoreResult<Workload<P>> {
        let desc = P::KIND.descriptor();
        self.compare_and_swap(
            id,
            expected_version,
            &format!("queued({action})"),
            |row| desc.can_queue(action, row.state, row.queued_action),
            |row| {
                row.state = WorkloadState::Queued;
                row.queued_action = Some(action);
            },
            update,
        )
        .await
    }

    async fn set_state(
        &self,
        id: &str,
        expected_version: i64,
        state: WorkloadState,
        update: WorkloadUpdate<P>,
    ) -> StoreResult<Workload<P>> {
        let desc = P::KIND.descriptor();
        self.compare_and_swap(
            id,
            expected_version,
            state.as_str(),
            |row| desc.can_enter(state, row.state, row.queued_action),
            |row| {
                row.state = state;
                row.queued_action = None;
            },
            update,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::workload::{BatchJob, Placement, Resources};

    fn batch_job() -> BatchJob {
        BatchJob {
            image: "python:3.12".into(),
            command: "python main.py".into(),
            data_files: vec![],
            envs: Default::default(),
            resources: Resources { gpu_count: 0 },
            placement: Placement {
                cluster_id: "c1".into(),
                cluster_name: "c1".into(),
                namespace: "ns".into(),
            },
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    async fn seeded(store: &MemoryWorkloadStore<BatchJob>, id: &str, project: &str) -> Workload<BatchJob> {
        let w = Workload::new(id.to_string(), "tenant-a", project, batch_job(), Utc::now());
        store.create(&w).await.unwrap();
        w
    }

    #[tokio::test]
    async fn test_create_duplicate() {
        let store = MemoryWorkloadStore::new();
        let w = seeded(&store, "batchjob-1", "p1").await;
        assert_eq!(w.version, 0);
        assert!(w.is_queued_with(QueuedAction::Create));
        let err = store.create(&w).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_versions_increase_by_one() {
        let store = MemoryWorkloadStore::new();
        seeded(&store, "batchjob-1", "p1").await;

        let running = store
            .set_state("batchjob-1", 0, WorkloadState::Running, WorkloadUpdate::new())
            .await
            .unwrap();
        assert_eq!(running.version, 1);
        assert_eq!(running.queued_action, None);

        let canceling = store
            .set_queued_action("batchjob-1", 1, QueuedAction::Cancel, WorkloadUpdate::new())
            .await
            .unwrap();
        assert_eq!(canceling.version, 2);
        assert_eq!(canceling.status(), "canceling");
    }

    #[tokio::test]
    async fn test_stale_version_is_conflict_and_no_write() {
        let store = MemoryWorkloadStore::new();
        seeded(&store, "batchjob-1", "p1").await;
        store
            .set_state("batchjob-1", 0, WorkloadState::Running, WorkloadUpdate::new())
            .await
            .unwrap();

        let err = store
            .set_queued_action("batchjob-1", 0, QueuedAction::Cancel, WorkloadUpdate::new().reason("x"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let row = store.get("batchjob-1").await.unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.state, WorkloadState::Running);
        assert_eq!(row.reason, None);
    }

    #[tokio::test]
    async fn test_running_requires_queued_create() {
        let store = MemoryWorkloadStore::new();
        seeded(&store, "batchjob-1", "p1").await;
        store
            .set_queued_action("batchjob-1", 0, QueuedAction::Cancel, WorkloadUpdate::new())
            .await
            .unwrap();

        let err = store
            .set_state("batchjob-1", 1, WorkloadState::Running, WorkloadUpdate::new())
            .await
            .unwrap_err();
        assert!(err.is_precondition());
        let row = store.get("batchjob-1").await.unwrap();
        assert_eq!(row.version, 1);
        assert!(row.is_queued_with(QueuedAction::Cancel));
    }

    #[tokio::test]
    async fn test_concurrent_cas_exactly_one_wins() {
        let store = Arc::new(MemoryWorkloadStore::new());
        seeded(&store, "batchjob-1", "p1").await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set_queued_action(
                        "batchjob-1",
                        0,
                        if i % 2 == 0 { QueuedAction::Cancel } else { QueuedAction::Delete },
                        WorkloadUpdate::new(),
                    )
                    .await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.get("batchjob-1").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_project_isolation_and_not_found() {
        let store = MemoryWorkloadStore::new();
        seeded(&store, "batchjob-1", "p1").await;
        assert!(store.get_in_project("batchjob-1", "p1").await.is_ok());
        assert!(store.get_in_project("batchjob-1", "p2").await.unwrap_err().is_not_found());

        let err = store
            .set_state("batchjob-404", 0, WorkloadState::Running, WorkloadUpdate::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_pagination_descending_without_deleted() {
        let store = MemoryWorkloadStore::new();
        for i in 1..=5 {
            seeded(&store, &format!("batchjob-{i}"), "p1").await;
        }
        seeded(&store, "batchjob-9", "p2").await;
        store
            .set_queued_action("batchjob-3", 0, QueuedAction::Delete, WorkloadUpdate::new())
            .await
            .unwrap();
        store
            .set_state("batchjob-3", 1, WorkloadState::Deleted, WorkloadUpdate::new())
            .await
            .unwrap();

        let page = store.list_by_project("p1", None, 2).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, ["batchjob-5", "batchjob-4"]);
        assert!(page.has_more);

        let page = store.list_by_project("p1", Some("batchjob-4"), 2).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, ["batchjob-2", "batchjob-1"]);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_list_queued_scoped_and_ordered() {
        let store = MemoryWorkloadStore::new();
        seeded(&store, "batchjob-2", "p1").await;
        seeded(&store, "batchjob-1", "p1").await;
        store
            .set_state("batchjob-2", 0, WorkloadState::Running, WorkloadUpdate::new())
            .await
            .unwrap();
        seeded(&store, "batchjob-3", "p1").await;

        let queued = store.list_queued("tenant-a", "c1").await.unwrap();
        let ids: Vec<_> = queued.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, ["batchjob-1", "batchjob-3"]);
        assert!(store.list_queued("tenant-b", "c1").await.unwrap().is_empty());
        assert!(store.list_queued("tenant-a", "c2").await.unwrap().is_empty());
    }
}
