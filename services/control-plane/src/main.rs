//! Job manager control plane.
//!
//! Places ML workloads on tenant clusters and drives them through their
//! lifecycle: a controller worker dispatches queued actions and watches
//! cluster resources, a rescheduler moves stuck notebooks elsewhere.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use jobmgr_control_plane::{
    cache::{ClusterCache, ClusterSource},
    cluster::{AgentClient, ClusterAgents},
    config::Config,
    controller::{
        ControllerWorker, JobController, ModelPublisher, NotebookController, Rescheduler,
        WorkloadController,
    },
    db::Database,
    registry::{HttpModelRegistry, ModelRegistry},
    scheduler::Scheduler,
    workload::{BatchJob, FineTuningJob, Notebook, WorkloadStore},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // RUST_LOG wins over JOBMGR_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting job manager");
    info!(
        clusters = config.cluster_agents.len(),
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        registry_enabled = config.model_registry_url.is_some(),
        "Configuration loaded"
    );

    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        if let Err(e) = db.run_migrations(&config.database.migrations_dir).await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let source: Arc<dyn ClusterSource> = Arc::new(db.cluster_store());
    let cache = Arc::new(ClusterCache::new(source));
    let scheduler = Arc::new(Scheduler::new(cache.clone()));

    let fine_tuning_jobs: Arc<dyn WorkloadStore<FineTuningJob>> =
        Arc::new(db.workload_store::<FineTuningJob>());
    let batch_jobs: Arc<dyn WorkloadStore<BatchJob>> = Arc::new(db.workload_store::<BatchJob>());
    let notebooks: Arc<dyn WorkloadStore<Notebook>> = Arc::new(db.workload_store::<Notebook>());

    let agents = config
        .cluster_agents
        .iter()
        .map(|a| AgentClient::new(&a.target.cluster_id, &a.base_url, config.agent_timeout))
        .collect::<Result<Vec<_>, _>>()?;
    let agents = Arc::new(ClusterAgents::new(agents));

    let registry = match &config.model_registry_url {
        Some(url) => Some(Arc::new(HttpModelRegistry::new(url, config.agent_timeout)?) as Arc<dyn ModelRegistry>),
        None => {
            warn!("JOBMGR_MODEL_REGISTRY_URL not set; fine-tuned models will not be published");
            None
        }
    };
    let publisher = Arc::new(ModelPublisher::new(registry, &config.model_artifact_prefix));

    let controllers: Vec<Arc<dyn WorkloadController>> = vec![
        Arc::new(
            JobController::new(fine_tuning_jobs, agents.clone(), agents.clone())
                .with_completion_hook(publisher),
        ),
        Arc::new(JobController::new(batch_jobs, agents.clone(), agents.clone())),
        Arc::new(NotebookController::new(notebooks.clone(), agents.clone(), agents.clone())),
    ];

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ControllerWorker::new(
        config.targets(),
        controllers,
        agents.clone(),
        cache.clone(),
        config.reconcile_interval,
    );
    let worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            worker.run(shutdown_rx).await;
        }
    });

    let rescheduler = Rescheduler::new(
        notebooks,
        scheduler,
        cache,
        config.notebook_max_queued_time,
        config.reschedule_interval,
    );
    let rescheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            rescheduler.run(shutdown_rx).await;
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Controller worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, rescheduler_handle).await {
        warn!(error = %e, "Rescheduler did not shut down in time");
    }

    info!("Job manager shutdown complete");
    Ok(())
}
