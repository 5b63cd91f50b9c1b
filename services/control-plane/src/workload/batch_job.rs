//! Batch jobs: user containers run to completion.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use jobmgr_id::BatchJobId;
use serde::{Deserialize, Serialize};

use super::transition::{ActionRule, KindDescriptor, Origin, StateRule};
use super::{Payload, Placement, QueuedAction, Resources, WorkloadFailure, WorkloadKind, WorkloadState};

use Origin::{Queued as Q, State as S};
use QueuedAction::{Cancel, Create, Delete};
use WorkloadState::{Canceled, Deleted, Failed, Queued, Running, Succeeded};

pub static BATCH_JOB: KindDescriptor = KindDescriptor {
    kind: WorkloadKind::BatchJob,
    initial_action: Create,
    states: &[Queued, Running, Succeeded, Failed, Canceled, Deleted],
    state_rules: &[
        StateRule { target: Running, from: &[Q(Create)] },
        StateRule { target: Succeeded, from: &[S(Running)] },
        StateRule { target: Failed, from: &[S(Running)] },
        StateRule { target: Canceled, from: &[Q(Cancel)] },
        StateRule { target: Deleted, from: &[Q(Delete)] },
    ],
    action_rules: &[
        ActionRule { action: Create, from: &[S(Running)], satisfied_by: &[Q(Create)] },
        ActionRule {
            action: Cancel,
            from: &[S(Running), Q(Create)],
            satisfied_by: &[S(Succeeded), S(Failed), S(Canceled), S(Deleted), Q(Cancel), Q(Delete)],
        },
        ActionRule {
            action: Delete,
            from: &[S(Queued), S(Running), S(Succeeded), S(Failed), S(Canceled)],
            satisfied_by: &[S(Deleted), Q(Delete)],
        },
    ],
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub data_files: Vec<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
    pub placement: Placement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkloadFailure>,
}

impl Payload for BatchJob {
    const KIND: WorkloadKind = WorkloadKind::BatchJob;

    fn new_id() -> String {
        BatchJobId::new().to_string()
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
