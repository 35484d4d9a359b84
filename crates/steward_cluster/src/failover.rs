//! Failover planning.
//!
//! Level-triggered: every reconcile pass recomputes, from the replicated state
//! alone, which children have lost their member and which survivor must start
//! them. Placement is deterministic, so exactly one survivor picks each child
//! once the survivors agree on the alive set.

use steward_core::{ChildId, MemberId};
use steward_runtime::ChildHandle;

use crate::directory::{latest_of, ClaimState};
use crate::placement::PlacementStrategy;
use crate::spec::WorkerSpec;
use crate::state::ClusterState;
use crate::supervisor::LocalView;

/// Children `local` must start because their member is gone or released them.
///
/// A child qualifies when its latest claim is a handoff, or says it runs on a
/// dead or departed member; no live member runs it; its restart policy
/// survives the loss of a member; and placement over the alive members names
/// `local`.
#[must_use]
pub fn failover_candidates(
    state: &ClusterState,
    local: MemberId,
    placement: &PlacementStrategy,
    view: &LocalView,
) -> Vec<WorkerSpec> {
    let alive = state.members.alive();
    if !alive.contains(&local) {
        return Vec::new();
    }

    state
        .children
        .iter()
        .filter_map(|(id, claims)| {
            let latest = latest_of(claims)?;
            let released = match &latest.state {
                ClaimState::Handoff => true,
                ClaimState::Running { .. } => state.members.is_gone(&latest.member()),
                _ => false,
            };
            if !released || !latest.spec.restart.survives_failover() || view.has_instance(id) {
                return None;
            }
            if state.children.live_running(id, &state.members).next().is_some() {
                return None;
            }
            match placement.place(id, &alive) {
                Ok(owner) if owner == local => Some(latest.spec.clone()),
                _ => None,
            }
        })
        .collect()
}

/// Running claims of `local` that no local instance backs
#[must_use]
pub fn orphaned_claims(
    state: &ClusterState,
    local: MemberId,
    view: &LocalView,
) -> Vec<(WorkerSpec, ChildHandle)> {
    state
        .children
        .iter()
        .filter_map(|(_, claims)| claims.get(&local))
        .filter_map(|claim| {
            let handle = claim.handle()?;
            (!view.handles.contains(handle)).then(|| (claim.spec.clone(), handle.clone()))
        })
        .collect()
}

/// Local terminal records whose child another member has claimed since
#[must_use]
pub fn superseded_terminal(state: &ClusterState, local: MemberId, view: &LocalView) -> Vec<ChildId> {
    view.terminal
        .iter()
        .filter(|id| {
            state
                .children
                .latest(id)
                .is_some_and(|claim| claim.member() != local)
        })
        .cloned()
        .collect()
}
