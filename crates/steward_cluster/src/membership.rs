//! Cluster membership view.
//!
//! Every member keeps a full copy of the view and exchanges it by gossip. Two
//! entries for the same member are ordered by `(incarnation, status precedence)`,
//! so merging views in any order, any number of times, yields the same result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use steward_core::MemberId;

/// Member status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Participating and eligible to own children
    Alive,
    /// Draining before departure; keeps running what it has, owns nothing new
    Leaving,
    /// Departed gracefully
    Left,
    /// Declared failed
    Dead,
}

impl MemberStatus {
    /// Merge precedence within one incarnation
    #[must_use]
    pub const fn precedence(&self) -> u8 {
        match self {
            Self::Alive => 0,
            Self::Leaving => 1,
            Self::Left => 2,
            Self::Dead => 3,
        }
    }

    /// Whether placement may pick this member
    #[must_use]
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }

    /// Whether the member still runs children (alive or leaving)
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Alive | Self::Leaving)
    }

    /// Whether the member is gone for good in this incarnation
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Left | Self::Dead)
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alive => write!(f, "alive"),
            Self::Leaving => write!(f, "leaving"),
            Self::Left => write!(f, "left"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Versioned status of one member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    /// Current status
    pub status: MemberStatus,
    /// Version counter owned by the member itself
    pub incarnation: u64,
}

impl MemberEntry {
    /// Create a new entry
    #[must_use]
    pub const fn new(status: MemberStatus, incarnation: u64) -> Self {
        Self { status, incarnation }
    }

    fn rank(&self) -> (u64, u8) {
        (self.incarnation, self.status.precedence())
    }

    /// Whether this entry wins over `other` on merge
    #[must_use]
    pub fn supersedes(&self, other: &MemberEntry) -> bool {
        self.rank() > other.rank()
    }
}

/// A status change produced by a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberTransition {
    /// Member whose status changed
    pub member: MemberId,
    /// Previous status, `None` for a newly learned member
    pub from: Option<MemberStatus>,
    /// New status
    pub to: MemberStatus,
}

/// Replicated map of member id to entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    members: BTreeMap<MemberId, MemberEntry>,
}

impl MembershipView {
    /// Create an empty view
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one entry into the view. Returns the transition if the status changed.
    pub fn observe(&mut self, member: MemberId, entry: MemberEntry) -> Option<MemberTransition> {
        match self.members.get_mut(&member) {
            Some(current) if entry.supersedes(current) => {
                let from = current.status;
                *current = entry;
                (from != entry.status).then_some(MemberTransition {
                    member,
                    from: Some(from),
                    to: entry.status,
                })
            }
            Some(_) => None,
            None => {
                self.members.insert(member, entry);
                Some(MemberTransition { member, from: None, to: entry.status })
            }
        }
    }

    /// Merge another view into this one
    pub fn merge(&mut self, other: &MembershipView) -> Vec<MemberTransition> {
        other
            .members
            .iter()
            .filter_map(|(member, entry)| self.observe(*member, *entry))
            .collect()
    }

    /// Entry for a member
    #[must_use]
    pub fn get(&self, member: &MemberId) -> Option<&MemberEntry> {
        self.members.get(member)
    }

    /// Status of a member
    #[must_use]
    pub fn status(&self, member: &MemberId) -> Option<MemberStatus> {
        self.members.get(member).map(|entry| entry.status)
    }

    /// Whether a member still runs children. Members not yet known count as live.
    #[must_use]
    pub fn is_live(&self, member: &MemberId) -> bool {
        self.status(member).is_none_or(|status| status.is_live())
    }

    /// Whether a member is known to be gone
    #[must_use]
    pub fn is_gone(&self, member: &MemberId) -> bool {
        self.status(member).is_some_and(|status| status.is_gone())
    }

    /// Alive members in id order
    #[must_use]
    pub fn alive(&self) -> Vec<MemberId> {
        self.with_status(MemberStatus::is_alive)
    }

    /// Alive and leaving members in id order
    #[must_use]
    pub fn live(&self) -> Vec<MemberId> {
        self.with_status(MemberStatus::is_live)
    }

    fn with_status(&self, keep: impl Fn(&MemberStatus) -> bool) -> Vec<MemberId> {
        self.members
            .iter()
            .filter(|(_, entry)| keep(&entry.status))
            .map(|(member, _)| *member)
            .collect()
    }

    /// All entries in id order
    pub fn iter(&self) -> impl Iterator<Item = (&MemberId, &MemberEntry)> {
        self.members.iter()
    }

    /// Number of known members, gone ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
