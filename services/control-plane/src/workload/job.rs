//! Fine-tuning jobs.

use chrono::{DateTime, Utc};
use jobmgr_id::FineTuningJobId;
use serde::{Deserialize, Serialize};

use super::transition::{ActionRule, KindDescriptor, Origin, StateRule};
use super::{Payload, Placement, QueuedAction, Resources, WorkloadFailure, WorkloadKind, WorkloadState};

use Origin::{Queued as Q, State as S};
use QueuedAction::{Cancel, Create};
use WorkloadState::{Canceled, Failed, Queued, Running, Succeeded};

pub static FINE_TUNING_JOB: KindDescriptor = KindDescriptor {
    kind: WorkloadKind::FineTuningJob,
    initial_action: Create,
    states: &[Queued, Running, Succeeded, Failed, Canceled],
    state_rules: &[
        StateRule { target: Running, from: &[Q(Create)] },
        StateRule { target: Succeeded, from: &[S(Running)] },
        StateRule { target: Failed, from: &[S(Running)] },
        StateRule { target: Canceled, from: &[Q(Cancel)] },
    ],
    action_rules: &[
        // Recreate when the running resource disappeared.
        ActionRule { action: Create, from: &[S(Running)], satisfied_by: &[Q(Create)] },
        ActionRule {
            action: Cancel,
            from: &[S(Running), Q(Create)],
            satisfied_by: &[S(Succeeded), S(Failed), S(Canceled), Q(Cancel)],
        },
    ],
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_epochs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate_multiplier: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuningJob {
    pub model: String,
    pub training_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub resources: Resources,
    pub organization_id: String,
    pub placement: Placement,
    /// Identifier the trained model will be published under; set at dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fine_tuned_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkloadFailure>,
}

impl FineTuningJob {
    /// `ft:{base}:{suffix}:{id}` style name of the model this job produces.
    pub fn output_model_name(&self, job_id: &str) -> String {
        let short_id = job_id.rsplit('-').next().unwrap_or(job_id);
        match self.suffix.as_deref().filter(|s| !s.is_empty()) {
            Some(suffix) => format!("ft:{}:{}:{}", self.model, suffix, short_id),
            None => format!("ft:{}:{}", self.model, short_id),
        }
    }
}

impl Payload for FineTuningJob {
    const KIND: WorkloadKind = WorkloadKind::FineTuningJob;

    fn new_id() -> String {
        FineTuningJobId::new().to_string()
    }

    fn placement(&self) -> &Placement {
        &self.placement
    }

    fn set_placement(&mut self, placement: Placement) {
        self.placement = placement;
    }

    fn gpu_count(&self) -> u32 {
        self.resources.gpu_count
    }
}
