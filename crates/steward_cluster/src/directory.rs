//! Replicated child directory.
//!
//! For every child id the directory keeps one claim per member that has run it.
//! A member only ever writes its own claims, stamped with its Lamport clock, and
//! a merge keeps the greater stamp per `(child, member)`. Survivors learn the
//! specs of a dead member's children from here, and merged clusters see
//! duplicate running instances here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use steward_core::{ChildId, LogicalTime, MemberId, Stamp};
use steward_runtime::{ChildHandle, ExitReason};

use crate::membership::MembershipView;
use crate::spec::WorkerSpec;

/// What a member last said about a child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    /// Running on the claiming member
    Running {
        /// Handle of the instance
        handle: ChildHandle,
    },
    /// Released for another member to take over
    Handoff,
    /// Ended and not restarted
    Exited {
        /// Last exit reason
        reason: ExitReason,
    },
    /// Stopped on request; never resurrected
    Stopped,
    /// Given up to another claimant after a merge
    Yielded,
}

/// One member's claim on a child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Spec as known to the claiming member
    pub spec: WorkerSpec,
    /// Write stamp; the member is the claimant
    pub stamp: Stamp,
    /// Claim state
    pub state: ClaimState,
}

impl Claim {
    /// Create a claim
    #[must_use]
    pub fn new(spec: WorkerSpec, stamp: Stamp, state: ClaimState) -> Self {
        Self { spec, stamp, state }
    }

    /// Member that wrote this claim
    #[must_use]
    pub fn member(&self) -> MemberId {
        self.stamp.member
    }

    /// Handle if the claim says the child runs
    #[must_use]
    pub fn handle(&self) -> Option<&ChildHandle> {
        match &self.state {
            ClaimState::Running { handle } => Some(handle),
            _ => None,
        }
    }

    /// Whether the claim says the child runs
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state, ClaimState::Running { .. })
    }
}

/// Claims on one child, keyed by claimant
pub type ClaimSet = BTreeMap<MemberId, Claim>;

/// Replicated directory of child claims
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildDirectory {
    children: BTreeMap<ChildId, ClaimSet>,
}

impl ChildDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one claim. Returns true if the directory changed.
    pub fn put(&mut self, claim: Claim) -> bool {
        let claims = self.children.entry(claim.spec.id.clone()).or_default();
        match claims.get(&claim.member()) {
            Some(current) if current.stamp >= claim.stamp => false,
            _ => {
                claims.insert(claim.member(), claim);
                true
            }
        }
    }

    /// Merge another directory. Returns true if anything changed.
    pub fn merge(&mut self, other: &ChildDirectory) -> bool {
        let mut changed = false;
        for (id, theirs) in &other.children {
            let ours = self.children.entry(id.clone()).or_default();
            for (member, claim) in theirs {
                let newer = ours.get(member).is_none_or(|current| claim.stamp > current.stamp);
                if newer {
                    ours.insert(*member, claim.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    /// Merge another directory, leaving out claims of members for which `gone`
    /// holds once a newer claim supersedes them. Returns true if anything
    /// changed.
    pub fn merge_compacting(&mut self, other: &ChildDirectory, gone: impl Fn(&MemberId) -> bool) -> bool {
        let mut changed = false;
        for (id, theirs) in &other.children {
            let ours = self.children.entry(id.clone()).or_default();
            let before = stamps(ours);
            for (member, claim) in theirs {
                if ours.get(member).is_none_or(|current| claim.stamp > current.stamp) {
                    ours.insert(*member, claim.clone());
                }
            }
            compact_set(ours, &gone);
            changed |= stamps(ours) != before;
        }
        changed
    }

    /// Drop superseded claims of gone members on one child. Returns true if
    /// any was dropped.
    pub fn compact_child(&mut self, id: &ChildId, gone: impl Fn(&MemberId) -> bool) -> bool {
        self.children
            .get_mut(id)
            .is_some_and(|claims| compact_set(claims, &gone))
    }

    /// Drop superseded claims of gone members everywhere. Returns the number
    /// of children touched.
    pub fn compact(&mut self, gone: impl Fn(&MemberId) -> bool) -> usize {
        self.children
            .values_mut()
            .map(|claims| compact_set(claims, &gone))
            .filter(|&dropped| dropped)
            .count()
    }

    /// Greatest logical time of any claim
    #[must_use]
    pub fn max_time(&self) -> LogicalTime {
        self.children
            .values()
            .flat_map(|claims| claims.values())
            .map(|claim| claim.stamp.time)
            .max()
            .unwrap_or_default()
    }

    /// All claims on a child
    #[must_use]
    pub fn claims(&self, id: &ChildId) -> Option<&ClaimSet> {
        self.children.get(id)
    }

    /// A member's own claim on a child
    #[must_use]
    pub fn claim_of(&self, id: &ChildId, member: &MemberId) -> Option<&Claim> {
        self.children.get(id).and_then(|claims| claims.get(member))
    }

    /// Greatest-stamp claim on a child, ignoring yielded ones
    #[must_use]
    pub fn latest(&self, id: &ChildId) -> Option<&Claim> {
        self.children.get(id).and_then(latest_of)
    }

    /// Running claims held by live members
    pub fn live_running<'a>(
        &'a self,
        id: &ChildId,
        members: &'a MembershipView,
    ) -> impl Iterator<Item = &'a Claim> + 'a {
        self.children
            .get(id)
            .into_iter()
            .flat_map(|claims| claims.values())
            .filter(move |claim| claim.is_running() && members.is_live(&claim.member()))
    }

    /// Every child and its claims, in id order
    pub fn iter(&self) -> impl Iterator<Item = (&ChildId, &ClaimSet)> {
        self.children.iter()
    }

    /// Number of known child ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

fn stamps(claims: &ClaimSet) -> Vec<Stamp> {
    claims.values().map(|claim| claim.stamp).collect()
}

/// The latest claim stays, so failover and stop decisions are unaffected
fn compact_set(claims: &mut ClaimSet, gone: &impl Fn(&MemberId) -> bool) -> bool {
    let Some(latest) = latest_of(claims).map(|claim| claim.stamp) else {
        return false;
    };
    let before = claims.len();
    claims.retain(|member, claim| !gone(member) || claim.stamp >= latest);
    claims.len() != before
}

/// Greatest-stamp claim in a set, ignoring yielded ones
#[must_use]
pub fn latest_of(claims: &ClaimSet) -> Option<&Claim> {
    claims
        .values()
        .filter(|claim| claim.state != ClaimState::Yielded)
        .max_by_key(|claim| claim.stamp)
}
