//! Deterministic child placement.
//!
//! Rendezvous hashing: every member scores every child id, the highest score
//! owns it. Adding a member only moves the ids the new member wins; removing a
//! member only moves the ids it owned.

use serde::{Deserialize, Serialize};
use steward_core::{ChildId, Hash, MemberId};
use thiserror::Error;

/// Placement failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    /// No candidate members
    #[error("no placement possible: no alive members")]
    NoMembers,

    /// Too few members alive for the configured strategy
    #[error("no placement possible: {alive} alive, {required} required")]
    BelowQuorum {
        /// Members alive
        alive: usize,
        /// Members required
        required: usize,
    },
}

/// Score of `member` for `child`
#[must_use]
pub fn score(child: &ChildId, member: &MemberId) -> Hash {
    Hash::of_pair(child.as_str().as_bytes(), member.as_bytes())
}

/// Pick the owner of `child` among `members`.
///
/// Pure and total: the result depends only on the set of members, never on
/// their order, and is always one of them.
///
/// # Errors
///
/// Returns `PlacementError::NoMembers` if `members` is empty
pub fn place(child: &ChildId, members: &[MemberId]) -> Result<MemberId, PlacementError> {
    members
        .iter()
        .map(|member| (score(child, member), *member))
        .max()
        .map(|(_, member)| member)
        .ok_or(PlacementError::NoMembers)
}

/// How owners are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Plain rendezvous hashing over alive members
    #[default]
    Rendezvous,
    /// Rendezvous hashing, refused while fewer than `min_alive` members are alive
    Quorum {
        /// Minimum alive members
        min_alive: usize,
    },
}

impl PlacementStrategy {
    /// Pick the owner of `child` among the alive members
    ///
    /// # Errors
    ///
    /// Returns error if there is no member or the quorum is not met
    pub fn place(&self, child: &ChildId, alive: &[MemberId]) -> Result<MemberId, PlacementError> {
        if let Self::Quorum { min_alive } = self {
            if alive.len() < *min_alive {
                return Err(PlacementError::BelowQuorum {
                    alive: alive.len(),
                    required: *min_alive,
                });
            }
        }
        place(child, alive)
    }
}
