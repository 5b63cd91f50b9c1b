//! Per-kind transition tables.
//!
//! Every workload kind shares one state machine shape and differs only in
//! which states and actions it uses and which origins may reach them. That
//! difference is data: a [`KindDescriptor`] each kind declares once and both
//! store implementations consult.

use super::{QueuedAction, WorkloadKind, WorkloadState};

/// A (state, queued action) combination a transition may start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The row is in this state, whatever its queued action.
    State(WorkloadState),
    /// The row is Queued with this action.
    Queued(QueuedAction),
}

impl Origin {
    pub fn matches(&self, state: WorkloadState, action: Option<QueuedAction>) -> bool {
        match *self {
            Origin::State(s) => s == state,
            Origin::Queued(a) => state == WorkloadState::Queued && action == Some(a),
        }
    }
}

/// Which origins may move to `target` via a state update.
#[derive(Debug)]
pub struct StateRule {
    pub target: WorkloadState,
    pub from: &'static [Origin],
}

/// Which origins may be re-queued with `action`, and which already satisfy it.
#[derive(Debug)]
pub struct ActionRule {
    pub action: QueuedAction,
    pub from: &'static [Origin],
    /// Requesting the action on these rows is a no-op for the caller.
    pub satisfied_by: &'static [Origin],
}

#[derive(Debug)]
pub struct KindDescriptor {
    pub kind: WorkloadKind,
    pub initial_action: QueuedAction,
    pub states: &'static [WorkloadState],
    pub state_rules: &'static [StateRule],
    pub action_rules: &'static [ActionRule],
}

impl KindDescriptor {
    pub fn state_rule(&self, target: WorkloadState) -> Option<&StateRule> {
        self.state_rules.iter().find(|r| r.target == target)
    }

    pub fn action_rule(&self, action: QueuedAction) -> Option<&ActionRule> {
        self.action_rules.iter().find(|r| r.action == action)
    }

    pub fn supports_state(&self, state: WorkloadState) -> bool {
        self.states.contains(&state)
    }

    pub fn can_enter(
        &self,
        target: WorkloadState,
        state: WorkloadState,
        action: Option<QueuedAction>,
    ) -> bool {
        self.state_rule(target)
            .is_some_and(|rule| any_matches(rule.from, state, action))
    }

    pub fn can_queue(
        &self,
        requested: QueuedAction,
        state: WorkloadState,
        action: Option<QueuedAction>,
    ) -> bool {
        self.action_rule(requested)
            .is_some_and(|rule| any_matches(rule.from, state, action))
    }

    pub fn is_satisfied(
        &self,
        requested: QueuedAction,
        state: WorkloadState,
        action: Option<QueuedAction>,
    ) -> bool {
        self.action_rule(requested)
            .is_some_and(|rule| any_matches(rule.satisfied_by, state, action))
    }
}

fn any_matches(origins: &[Origin], state: WorkloadState, action: Option<QueuedAction>) -> bool {
    origins.iter().any(|o| o.matches(state, action))
}

/// Splits origins into the `state = ANY(..)` and `queued_action = ANY(..)`
/// halves of a conditional update.
pub(crate) fn origin_filter(origins: &[Origin]) -> (Vec<String>, Vec<String>) {
    let mut states = Vec::new();
    let mut actions = Vec::new();
    for origin in origins {
        match origin {
            Origin::State(s) => states.push(s.as_str().to_string()),
            Origin::Queued(a) => actions.push(a.as_str().to_string()),
        }
    }
    (states, actions)
}
