//! Postgres-backed [`WorkloadStore`].
//!
//! All kinds share the `workloads` table, discriminated by `kind`. Each CAS
//! is a single conditional `UPDATE ... RETURNING`; when it matches nothing, a
//! follow-up read explains why.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::debug;

use crate::workload::{
    cas_failure, origin_filter, Origin, Page, Payload, QueuedAction, StoreError, StoreResult,
    Workload, WorkloadKind, WorkloadState, WorkloadStore, WorkloadUpdate,
};

const COLUMNS: &str = "workload_id, kind, tenant_id, project_id, cluster_id, payload, \
                       state, queued_action, reason, version, created_at, updated_at";

struct WorkloadRow {
    workload_id: String,
    tenant_id: String,
    project_id: String,
    cluster_id: Option<String>,
    payload: serde_json::Value,
    state: String,
    queued_action: Option<String>,
    reason: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for WorkloadRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workload_id: row.try_get("workload_id")?,
            tenant_id: row.try_get("tenant_id")?,
            project_id: row.try_get("project_id")?,
            cluster_id: row.try_get("cluster_id")?,
            payload: row.try_get("payload")?,
            state: row.try_get("state")?,
            queued_action: row.try_get("queued_action")?,
            reason: row.try_get("reason")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn corrupt(kind: WorkloadKind, id: &str, message: String) -> StoreError {
    StoreError::Corrupt {
        kind,
        id: id.to_string(),
        message,
    }
}

fn parse_state(kind: WorkloadKind, id: &str, s: &str) -> StoreResult<WorkloadState> {
    WorkloadState::parse(s).ok_or_else(|| corrupt(kind, id, format!("unknown state '{s}'")))
}

fn parse_action(kind: WorkloadKind, id: &str, s: Option<&str>) -> StoreResult<Option<QueuedAction>> {
    s.map(|a| {
        QueuedAction::parse(a).ok_or_else(|| corrupt(kind, id, format!("unknown queued action '{a}'")))
    })
    .transpose()
}

impl WorkloadRow {
    fn into_workload<P: Payload>(self) -> StoreResult<Workload<P>> {
        let kind = P::KIND;
        let state = parse_state(kind, &self.workload_id, &self.state)?;
        let queued_action = parse_action(kind, &self.workload_id, self.queued_action.as_deref())?;
        Ok(Workload {
            payload: serde_json::from_value(self.payload)?,
            id: self.workload_id,
            tenant_id: self.tenant_id,
            project_id: self.project_id,
            cluster_id: self.cluster_id,
            state,
            queued_action,
            reason: self.reason,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn into_workloads<P: Payload>(rows: Vec<WorkloadRow>) -> StoreResult<Vec<Workload<P>>> {
    rows.into_iter().map(WorkloadRow::into_workload).collect()
}

pub struct PgWorkloadStore<P> {
    pool: PgPool,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for PgWorkloadStore<P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P: Payload> PgWorkloadStore<P> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _payload: PhantomData,
        }
    }

    /// Writes `new_state`/`new_action` if the row is at `expected_version` and
    /// matches one of `origins`, all in one statement.
    async fn compare_and_swap(
        &self,
        id: &str,
        expected_version: i64,
        new_state: WorkloadState,
        new_action: Option<QueuedAction>,
        origins: &[Origin],
        update: WorkloadUpdate<P>,
    ) -> StoreResult<Workload<P>> {
        let kind = P::KIND;
        let (from_states, from_actions) = origin_filter(origins);
        let payload = update.payload.as_ref().map(serde_json::to_value).transpose()?;

        let sql = format!(
            r#"
            UPDATE workloads
            SET state = $4,
                queued_action = $5,
                reason = $6,
                payload = COALESCE($7, payload),
                cluster_id = COALESCE($8, cluster_id),
                version = version + 1,
                updated_at = now()
            WHERE workload_id = $1
              AND kind = $2
              AND version = $3
              AND (state = ANY($9) OR (state = 'queued' AND queued_action = ANY($10)))
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, WorkloadRow>(&sql)
            .bind(id)
            .bind(kind.as_str())
            .bind(expected_version)
            .bind(new_state.as_str())
            .bind(new_action.map(|a| a.as_str()))
            .bind(update.reason.as_deref())
            .bind(payload)
            .bind(update.cluster_id.as_deref())
            .bind(&from_states)
            .bind(&from_actions)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return row.into_workload();
        }

        let target = match new_action {
            Some(action) => format!("queued({action})"),
            None => new_state.to_string(),
        };
        let current = self.current_version(id).await?;
        debug!(workload_id = id, kind = %kind, expected_version, ?current, "Conditional update matched no row");
        Err(cas_failure(kind, id, expected_version, current, &target))
    }

    async fn current_version(
        &self,
        id: &str,
    ) -> StoreResult<Option<(WorkloadState, Option<QueuedAction>, i64)>> {
        let kind = P::KIND;
        let row = sqlx::query(
            r#"
            SELECT state, queued_action, version
            FROM workloads
            WHERE workload_id = $1 AND kind = $2
            "#,
        )
        .bind(id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get("state")?;
        let action: Option<String> = row.try_get("queued_action")?;
        let version: i64 = row.try_get("version")?;
        Ok(Some((
            parse_state(kind, id, &state)?,
            parse_action(kind, id, action.as_deref())?,
            version,
        )))
    }
}

#[async_trait]
impl<P: Payload> WorkloadStore<P> for PgWorkloadStore<P> {
    async fn create(&self, workload: &Workload<P>) -> StoreResult<()> {
        let payload = serde_json::to_value(&workload.payload)?;
        sqlx::query(
            r#"
            INSERT INTO workloads (
                workload_id, kind, tenant_id, project_id, cluster_id, payload,
                state, queued_action, reason, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&workload.id)
        .bind(P::KIND.as_str())
        .bind(&workload.tenant_id)
        .bind(&workload.project_id)
        .bind(workload.cluster_id.as_deref())
        .bind(payload)
        .bind(workload.state.as_str())
        .bind(workload.queued_action.map(|a| a.as_str()))
        .bind(workload.reason.as_deref())
        .bind(workload.version)
        .bind(workload.created_at)
        .bind(workload.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.code().as_deref() == Some("23505") {
                    return StoreError::AlreadyExists {
                        kind: P::KIND,
                        id: workload.id.clone(),
                    };
                }
            }
            StoreError::Database(e)
        })?;
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Workload<P>> {
        let sql = format!("SELECT {COLUMNS} FROM workloads WHERE workload_id = $1 AND kind = $2");
        sqlx::query_as::<_, WorkloadRow>(&sql)
            .bind(id)
            .bind(P::KIND.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: P::KIND,
                id: id.to_string(),
            })?
            .into_workload()
    }

    async fn get_in_project(&self, id: &str, project_id: &str) -> StoreResult<Workload<P>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM workloads WHERE workload_id = $1 AND kind = $2 AND project_id = $3"
        );
        sqlx::query_as::<_, WorkloadRow>(&sql)
            .bind(id)
            .bind(P::KIND.as_str())
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: P::KIND,
                id: id.to_string(),
            })?
            .into_workload()
    }

    async fn list_queued(&self, tenant_id: &str, cluster_id: &str) -> StoreResult<Vec<Workload<P>>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM workloads
            WHERE kind = $1 AND tenant_id = $2 AND cluster_id = $3 AND state = 'queued'
            ORDER BY workload_id
            "#
        );
        let rows = sqlx::query_as::<_, WorkloadRow>(&sql)
            .bind(P::KIND.as_str())
            .bind(tenant_id)
            .bind(cluster_id)
            .fetch_all(&self.pool)
            .await?;
        into_workloads(rows)
    }

    async fn list_by_state(&self, state: WorkloadState) -> StoreResult<Vec<Workload<P>>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM workloads WHERE kind = $1 AND state = $2 ORDER BY workload_id"
        );
        let rows = sqlx::query_as::<_, WorkloadRow>(&sql)
            .bind(P::KIND.as_str())
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        into_workloads(rows)
    }

    async fn list_by_project(
        &self,
        project_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Page<P>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM workloads
            WHERE kind = $1
              AND project_id = $2
              AND state <> 'deleted'
              AND ($3::TEXT IS NULL OR workload_id < $3)
            ORDER BY workload_id DESC
            LIMIT $4
            "#
        );
        let fetch = i64::try_from(limit).unwrap_or(i64::MAX - 1) + 1;
        let rows = sqlx::query_as::<_, WorkloadRow>(&sql)
            .bind(P::KIND.as_str())
            .bind(project_id)
            .bind(after)
            .bind(fetch)
            .fetch_all(&self.pool)
            .await?;

        let mut items = into_workloads(rows)?;
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
        let origins = P::KIND
            .descriptor()
            .action_rule(action)
            .map_or(&[][..], |rule| rule.from);
        self.compare_and_swap(
            id,
            expected_version,
            WorkloadState::Queued,
            Some(action),
            origins,
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
        let origins = P::KIND
            .descriptor()
            .state_rule(state)
            .map_or(&[][..], |rule| rule.from);
        self.compare_and_swap(id, expected_version, state, None, origins, update)
            .await
    }
}
