//! HTTP client for per-cluster agents.
//!
//! Each cluster runs an agent that renders manifests, applies them and
//! reports what it sees. The control plane only speaks this small JSON API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{
    ClusterError, ClusterExecutor, ClusterReport, ClusterResult, LaunchSpec, ObservedDeployment,
    ObservedJob, ResourceKey, ResourceObserver,
};

/// Client for the agent of one cluster.
#[derive(Clone)]
pub struct AgentClient {
    cluster_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl AgentClient {
    pub fn new(
        cluster_id: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> ClusterResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            cluster_id: cluster_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET returning `None` on 404.
    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> ClusterResult<Option<T>> {
        let url = self.url(path);
        debug!(url = %url, "Fetching from cluster agent");

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(Some(response.json().await?))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&LaunchSpec>,
        key: &ResourceKey,
    ) -> ClusterResult<()> {
        let url = self.url(path);
        debug!(method = %method, url = %url, "Sending to cluster agent");

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            // Creating something that already exists is fine.
            StatusCode::CONFLICT if body.is_some() => Ok(()),
            StatusCode::NOT_FOUND => Err(ClusterError::NotFound(key.clone())),
            _ => Err(rejected(response).await),
        }
    }

    fn owned(&self, mut key: ResourceKey) -> ResourceKey {
        key.cluster_id = self.cluster_id.clone();
        key
    }
}

async fn rejected(response: reqwest::Response) -> ClusterError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    warn!(status, body = %body, "Cluster agent rejected request");
    ClusterError::Rejected { status, body }
}

fn job_path(key: &ResourceKey) -> String {
    format!("/v1/jobs/{}/{}", key.namespace, key.name)
}

fn deployment_path(key: &ResourceKey) -> String {
    format!("/v1/deployments/{}/{}", key.namespace, key.name)
}

#[async_trait]
impl ResourceObserver for AgentClient {
    async fn get_job(&self, key: &ResourceKey) -> ClusterResult<Option<ObservedJob>> {
        let job: Option<ObservedJob> = self.fetch(&job_path(key)).await?;
        Ok(job.map(|mut j| {
            j.key = self.owned(j.key);
            j
        }))
    }

    async fn list_jobs(&self, _cluster_id: &str) -> ClusterResult<Vec<ObservedJob>> {
        let jobs: Vec<ObservedJob> = self.fetch("/v1/jobs").await?.unwrap_or_default();
        Ok(jobs
            .into_iter()
            .map(|mut j| {
                j.key = self.owned(j.key);
                j
            })
            .collect())
    }

    async fn get_deployment(&self, key: &ResourceKey) -> ClusterResult<Option<ObservedDeployment>> {
        let deployment: Option<ObservedDeployment> = self.fetch(&deployment_path(key)).await?;
        Ok(deployment.map(|mut d| {
            d.key = self.owned(d.key);
            d
        }))
    }

    async fn list_deployments(&self, _cluster_id: &str) -> ClusterResult<Vec<ObservedDeployment>> {
        let deployments: Vec<ObservedDeployment> =
            self.fetch("/v1/deployments").await?.unwrap_or_default();
        Ok(deployments
            .into_iter()
            .map(|mut d| {
                d.key = self.owned(d.key);
                d
            })
            .collect())
    }

    async fn cluster_status(&self, _cluster_id: &str) -> ClusterResult<Option<ClusterReport>> {
        self.fetch("/v1/status").await
    }
}

#[async_trait]
impl ClusterExecutor for AgentClient {
    async fn create_job(&self, launch: &LaunchSpec) -> ClusterResult<()> {
        self.send(Method::POST, "/v1/jobs", Some(launch), &launch.key).await
    }

    async fn suspend_job(&self, key: &ResourceKey) -> ClusterResult<()> {
        let path = format!("{}/suspend", job_path(key));
        self.send(Method::POST, &path, None, key).await
    }

    async fn delete_job(&self, key: &ResourceKey) -> ClusterResult<()> {
        self.send(Method::DELETE, &job_path(key), None, key).await
    }

    async fn apply_deployment(&self, launch: &LaunchSpec) -> ClusterResult<()> {
        self.send(Method::PUT, &deployment_path(&launch.key), Some(launch), &launch.key)
            .await
    }

    async fn scale_deployment_to_zero(&self, key: &ResourceKey) -> ClusterResult<()> {
        let path = format!("{}/scale-to-zero", deployment_path(key));
        self.send(Method::POST, &path, None, key).await
    }

    async fn delete_deployment(&self, key: &ResourceKey) -> ClusterResult<()> {
        self.send(Method::DELETE, &deployment_path(key), None, key).await
    }
}

/// Routes each call to the agent of the cluster it names.
#[derive(Clone, Default)]
pub struct ClusterAgents {
    agents: HashMap<String, AgentClient>,
}

impl ClusterAgents {
    pub fn new(agents: impl IntoIterator<Item = AgentClient>) -> Self {
        Self {
            agents: agents
                .into_iter()
                .map(|a| (a.cluster_id.clone(), a))
                .collect(),
        }
    }

    fn agent(&self, cluster_id: &str) -> ClusterResult<&AgentClient> {
        self.agents
            .get(cluster_id)
            .ok_or_else(|| ClusterError::UnknownCluster(cluster_id.to_string()))
    }
}

#[async_trait]
impl ResourceObserver for ClusterAgents {
    async fn get_job(&self, key: &ResourceKey) -> ClusterResult<Option<ObservedJob>> {
        self.agent(&key.cluster_id)?.get_job(key).await
    }

    async fn list_jobs(&self, cluster_id: &str) -> ClusterResult<Vec<ObservedJob>> {
        self.agent(cluster_id)?.list_jobs(cluster_id).await
    }

    async fn get_deployment(&self, key: &ResourceKey) -> ClusterResult<Option<ObservedDeployment>> {
        self.agent(&key.cluster_id)?.get_deployment(key).await
    }

    async fn list_deployments(&self, cluster_id: &str) -> ClusterResult<Vec<ObservedDeployment>> {
        self.agent(cluster_id)?.list_deployments(cluster_id).await
    }

    async fn cluster_status(&self, cluster_id: &str) -> ClusterResult<Option<ClusterReport>> {
        self.agent(cluster_id)?.cluster_status(cluster_id).await
    }
}

#[async_trait]
impl ClusterExecutor for ClusterAgents {
    async fn create_job(&self, launch: &LaunchSpec) -> ClusterResult<()> {
        self.agent(&launch.key.cluster_id)?.create_job(launch).await
    }

    async fn suspend_job(&self, key: &ResourceKey) -> ClusterResult<()> {
        self.agent(&key.cluster_id)?.suspend_job(key).await
    }

    async fn delete_job(&self, key: &ResourceKey) -> ClusterResult<()> {
        self.agent(&key.cluster_id)?.delete_job(key).await
    }

    async fn apply_deployment(&self, launch: &LaunchSpec) -> ClusterResult<()> {
        self.agent(&launch.key.cluster_id)?
            .apply_deployment(launch)
            .await
    }

    async fn scale_deployment_to_zero(&self, key: &ResourceKey) -> ClusterResult<()> {
        self.agent(&key.cluster_id)?.scale_deployment_to_zero(key).await
    }

    async fn delete_deployment(&self, key: &ResourceKey) -> ClusterResult<()> {
        self.agent(&key.cluster_id)?.delete_deployment(key).await
    }
}
