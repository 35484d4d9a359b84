//! The replicated cluster state: membership view plus child directory.

use serde::{Deserialize, Serialize};
use steward_core::{ChildId, MemberId};

use crate::directory::ChildDirectory;
use crate::membership::{MemberTransition, MembershipView};

/// Everything members gossip to each other
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Membership view
    pub members: MembershipView,
    /// Child directory
    pub children: ChildDirectory,
}

impl ClusterState {
    /// Create an empty state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge another state into this one
    pub fn merge(&mut self, other: &ClusterState) -> StateChange {
        StateChange {
            transitions: self.members.merge(&other.members),
            children_changed: self.children.merge(&other.children),
        }
    }

    /// Merge another state as seen by `local`. Claims of dead or departed
    /// members that a newer claim supersedes are dropped and not re-learned.
    /// `local`'s own claims are always kept.
    pub fn merge_compacting(&mut self, other: &ClusterState, local: MemberId) -> StateChange {
        let transitions = self.members.merge(&other.members);
        if !self.has_gone_peers(local) {
            return StateChange {
                transitions,
                children_changed: self.children.merge(&other.children),
            };
        }

        let members = &self.members;
        let gone = |member: &MemberId| *member != local && members.is_gone(member);
        let mut children_changed = self.children.merge_compacting(&other.children, gone);
        if transitions.iter().any(|transition| transition.to.is_gone()) {
            children_changed |= self.children.compact(gone) > 0;
        }
        StateChange { transitions, children_changed }
    }

    /// Drop superseded claims of gone members other than `local`. Returns the
    /// number of children touched.
    pub fn compact(&mut self, local: MemberId) -> usize {
        let members = &self.members;
        self.children
            .compact(|member| *member != local && members.is_gone(member))
    }

    /// Same as [`compact`](Self::compact), for one child
    pub fn compact_child(&mut self, id: &ChildId, local: MemberId) -> bool {
        let members = &self.members;
        self.children
            .compact_child(id, |member| *member != local && members.is_gone(member))
    }

    fn has_gone_peers(&self, local: MemberId) -> bool {
        self.members
            .iter()
            .any(|(member, entry)| *member != local && entry.status.is_gone())
    }
}

/// What a merge changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateChange {
    /// Member status changes
    pub transitions: Vec<MemberTransition>,
    /// Whether any claim changed
    pub children_changed: bool,
}

impl StateChange {
    /// Whether the merge was a no-op for ownership purposes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && !self.children_changed
    }
}
