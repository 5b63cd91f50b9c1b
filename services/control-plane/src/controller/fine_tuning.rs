//! Publication of fine-tuned models on job success.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{CompletionHook, ControllerError, ControllerResult};
use crate::registry::{ModelPublication, ModelRegistry};
use crate::workload::{FineTuningJob, Workload};

/// Registers the output model of a finished fine-tuning job.
///
/// Without a registry the job still succeeds; the model name is recorded
/// on the payload either way.
pub struct ModelPublisher {
    registry: Option<Arc<dyn ModelRegistry>>,
    artifact_prefix: String,
}

impl ModelPublisher {
    pub fn new(registry: Option<Arc<dyn ModelRegistry>>, artifact_prefix: impl Into<String>) -> Self {
        Self {
            registry,
            artifact_prefix: artifact_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    fn artifact_location(&self, tenant_id: &str, model_id: &str) -> String {
        format!("{}/{}/{}", self.artifact_prefix, tenant_id, model_id)
    }
}

#[async_trait]
impl CompletionHook<FineTuningJob> for ModelPublisher {
    async fn on_success(
        &self,
        row: &Workload<FineTuningJob>,
        payload: &mut FineTuningJob,
    ) -> ControllerResult<()> {
        let model_id = payload
            .output_model_id
            .clone()
            .ok_or_else(|| ControllerError::Invalid(format!("job {} has no output model id", row.id)))?;

        match &self.registry {
            Some(registry) => {
                let publication = ModelPublication {
                    model_id: model_id.clone(),
                    base_model: payload.model.clone(),
                    artifact_location: self.artifact_location(&row.tenant_id, &model_id),
                    tenant_id: row.tenant_id.clone(),
                    organization_id: payload.organization_id.clone(),
                    project_id: row.project_id.clone(),
                    source_job_id: row.id.clone(),
                };
                registry.publish(&publication).await?;
                info!(job_id = %row.id, model_id = %model_id, "Fine-tuned model registered");
            }
            None => debug!(job_id = %row.id, "No model registry configured; skipping publication"),
        }

        payload.fine_tuned_model = Some(model_id);
        Ok(())
    }
}
