//! Notebooks: long-running interactive deployments that can be stopped,
//! started again and moved between clusters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use jobmgr_id::NotebookId;
use serde::{Deserialize, Serialize};

use super::transition::{ActionRule, KindDescriptor, Origin, StateRule};
use super::{Payload, Placement, QueuedAction, Resources, WorkloadFailure, WorkloadKind, WorkloadState};
use crate::scheduler::Entitlement;

use Origin::{Queued as Q, State as S};
use QueuedAction::{Delete, Requeue, Start, Stop};
use WorkloadState::{
    Deleted, Failed, Initializing, Queued, Requeued, Running, Stopped, Stopping,
};

pub static NOTEBOOK: KindDescriptor = KindDescriptor {
    kind: WorkloadKind::Notebook,
    initial_action: Start,
    states: &[Queued, Initializing, Running, Stopping, Stopped, Requeued, Failed, Deleted],
    state_rules: &[
        // Re-entering Initializing updates the reason (e.g. image pull).
        StateRule { target: Initializing, from: &[Q(Start), S(Initializing)] },
        StateRule { target: Running, from: &[S(Initializing)] },
        StateRule { target: Stopping, from: &[Q(Stop)] },
        StateRule { target: Stopped, from: &[S(Stopping), Q(Stop)] },
        StateRule { target: Requeued, from: &[Q(Requeue)] },
        StateRule { target: Failed, from: &[Q(Start), S(Initializing), S(Running)] },
        StateRule { target: Deleted, from: &[Q(Delete)] },
    ],
    action_rules: &[
        ActionRule {
            action: Start,
            from: &[S(Stopped), S(Requeued)],
            satisfied_by: &[
                S(Initializing),
                S(Running),
                S(Requeued),
                S(Failed),
                S(Deleted),
                Q(Start),
                Q(Requeue),
                Q(Delete),
            ],
        },
        ActionRule {
            action: Stop,
            from: &[S(Initializing), S(Running), S(Requeued), Q(Start), Q(Requeue)],
            satisfied_by: &[S(Stopping), S(Stopped), S(Failed), S(Deleted), Q(Stop), Q(Delete)],
        },
        ActionRule {
            action: Delete,
            from: &[
                S(Queued),
                S(Initializing),
                S(Running),
                S(Stopping),
                S(Stopped),
                S(Requeued),
                S(Failed),
            ],
            satisfied_by: &[S(Deleted), Q(Delete)],
        },
        ActionRule {
            action: Requeue,
            from: &[S(Initializing)],
            satisfied_by: &[S(Requeued), Q(Requeue)],
        },
    ],
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
    pub placement: Placement,
    /// Clusters the owner could use at creation, for rescheduling later.
    #[serde(default)]
    pub entitlements: Vec<Entitlement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkloadFailure>,
}

impl Payload for Notebook {
    const KIND: WorkloadKind = WorkloadKind::Notebook;

    fn new_id() -> String {
        NotebookId::new().to_string()
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
