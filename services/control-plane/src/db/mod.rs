//! Postgres persistence.
//!
//! - Connection pool management and migrations
//! - Cluster status records ([`PgClusterStore`])
//! - Workload rows with conditional updates ([`PgWorkloadStore`])

mod clusters;
mod error;
mod workloads;

pub use clusters::PgClusterStore;
pub use error::DbError;
pub use workloads::PgWorkloadStore;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::workload::Payload;

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long to wait for a pooled connection before giving up.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// Applied at startup in dev mode.
    pub migrations_dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            migrations_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        }
    }
}

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/jobmgr";

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl DbConfig {
    /// Reads `DATABASE_URL`, `JOBMGR_DB_*` and `JOBMGR_MIGRATIONS_DIR`,
    /// falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env_parse("JOBMGR_DB_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            min_connections: env_parse("JOBMGR_DB_MIN_CONNECTIONS")
                .unwrap_or(defaults.min_connections),
            acquire_timeout: env_parse("JOBMGR_DB_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            migrations_dir: std::env::var_os("JOBMGR_MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.migrations_dir),
            ..defaults
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            acquire_timeout_secs = config.acquire_timeout.as_secs(),
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    pub async fn run_migrations(&self, dir: &Path) -> Result<(), DbError> {
        info!(migrations_dir = %dir.display(), "Running database migrations");
        let migrator = Migrator::new(dir).await.map_err(DbError::Migration)?;
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        info!(applied = migrator.iter().count(), "Database migrations complete");
        Ok(())
    }

    pub fn cluster_store(&self) -> PgClusterStore {
        PgClusterStore::new(self.pool.clone())
    }

    pub fn workload_store<P: Payload>(&self) -> PgWorkloadStore<P> {
        PgWorkloadStore::new(self.pool.clone())
    }
}
