//! Cluster status persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use super::DbError;
use crate::cache::{ClusterRecord, ClusterSource};

struct ClusterRow {
    tenant_id: String,
    cluster_id: String,
    name: String,
    status: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ClusterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            tenant_id: row.try_get("tenant_id")?,
            cluster_id: row.try_get("cluster_id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ClusterRow> for ClusterRecord {
    type Error = DbError;

    fn try_from(row: ClusterRow) -> Result<Self, Self::Error> {
        Ok(ClusterRecord {
            tenant_id: row.tenant_id,
            cluster_id: row.cluster_id,
            name: row.name,
            status: serde_json::from_value(row.status)?,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed [`ClusterSource`].
#[derive(Clone)]
pub struct PgClusterStore {
    pool: PgPool,
}

impl PgClusterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClusterSource for PgClusterStore {
    async fn list_clusters_by_tenant(&self, tenant_id: &str) -> Result<Vec<ClusterRecord>, DbError> {
        let rows = sqlx::query_as::<_, ClusterRow>(
            r#"
            SELECT tenant_id, cluster_id, name, status, updated_at
            FROM clusters
            WHERE tenant_id = $1
            ORDER BY cluster_id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        rows.into_iter().map(ClusterRecord::try_from).collect()
    }

    async fn upsert_cluster(&self, record: &ClusterRecord) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO clusters (tenant_id, cluster_id, name, status, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, cluster_id) DO UPDATE
            SET name = EXCLUDED.name,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            WHERE clusters.updated_at <= EXCLUDED.updated_at
            "#,
        )
        .bind(&record.tenant_id)
        .bind(&record.cluster_id)
        .bind(&record.name)
        .bind(serde_json::to_value(&record.status)?)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }
}
