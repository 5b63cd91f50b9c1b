//! Model registry client.
//!
//! A fine-tuning job only counts as succeeded once its output model has been
//! published, so publication must be idempotent: the registry answering
//! 409 for an already-known model is success.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("registry rejected publication ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPublication {
    pub model_id: String,
    pub base_model: String,
    pub artifact_location: String,
    pub tenant_id: String,
    pub organization_id: String,
    pub project_id: String,
    pub source_job_id: String,
}

#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn publish(&self, publication: &ModelPublication) -> Result<(), RegistryError>;
}

pub struct HttpModelRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpModelRegistry {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RegistryError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ModelRegistry for HttpModelRegistry {
    async fn publish(&self, publication: &ModelPublication) -> Result<(), RegistryError> {
        let url = format!("{}/v1/models", self.base_url);
        debug!(url = %url, model_id = %publication.model_id, "Publishing model");

        let response = self.client.post(&url).json(publication).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            info!(model_id = %publication.model_id, job_id = %publication.source_job_id, "Model published");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
