//! Cluster state store.
//!
//! Each member holds one [`ClusterStore`]. Every effective change bumps a state
//! epoch published on a `watch` channel, which drives gossip pushes and lets
//! callers wait for convergence instead of sleeping.

use std::sync::Arc;
use steward_core::{ChildId, LamportClock, LogicalTime, MemberId, Stamp, Timestamp};
use steward_runtime::ChildHandle;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::directory::{Claim, ClaimState};
use crate::membership::{MemberEntry, MemberStatus, MemberTransition};
use crate::placement::place;
use crate::spec::WorkerSpec;
use crate::state::{ClusterState, StateChange};

struct StoreInner {
    state: ClusterState,
    clock: LamportClock,
    /// Status this member wants to be seen with
    intent: MemberStatus,
}

/// Replicated state held by one member
pub struct ClusterStore {
    local: MemberId,
    inner: Arc<RwLock<StoreInner>>,
    epoch: watch::Sender<u64>,
}

impl ClusterStore {
    /// Create a store for a member that is alive with the given incarnation.
    /// The Lamport clock starts at the incarnation.
    #[must_use]
    pub fn new(local: MemberId, incarnation: u64) -> Self {
        let mut state = ClusterState::new();
        state
            .members
            .observe(local, MemberEntry::new(MemberStatus::Alive, incarnation));

        let (epoch, _) = watch::channel(0);
        Self {
            local,
            inner: Arc::new(RwLock::new(StoreInner {
                state,
                clock: LamportClock::starting_at(LogicalTime::from_raw(incarnation)),
                intent: MemberStatus::Alive,
            })),
            epoch,
        }
    }

    /// Create a store whose incarnation is seeded from the wall clock, so a
    /// restarted member with the same id supersedes its previous record
    #[must_use]
    pub fn starting_now(local: MemberId) -> Self {
        Self::new(local, Timestamp::now().as_millis())
    }

    /// Local member id
    #[must_use]
    pub fn local(&self) -> MemberId {
        self.local
    }

    /// Current state epoch
    #[must_use]
    pub fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Watch the state epoch
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    fn bump(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Run `f` against the current state under the read lock
    pub async fn read<R>(&self, f: impl FnOnce(&ClusterState) -> R) -> R {
        f(&self.inner.read().await.state)
    }

    /// Clone the full state
    pub async fn snapshot(&self) -> ClusterState {
        self.read(|state| state.clone()).await
    }

    /// Alive members, the placement candidates
    pub async fn alive(&self) -> Vec<MemberId> {
        self.read(|state| state.members.alive()).await
    }

    /// Alive and leaving members, the ones answering queries
    pub async fn live(&self) -> Vec<MemberId> {
        self.read(|state| state.members.live()).await
    }

    /// Gossip targets: live members other than self. With `include_dead`, dead
    /// members are added so a healed partition can refute false deaths.
    pub async fn peers(&self, include_dead: bool) -> Vec<MemberId> {
        self.read(|state| {
            state
                .members
                .iter()
                .filter(|(member, _)| **member != self.local)
                .filter(|(_, entry)| {
                    entry.status.is_live() || (include_dead && entry.status == MemberStatus::Dead)
                })
                .map(|(member, _)| *member)
                .collect()
        })
        .await
    }

    /// Status of a member
    pub async fn status(&self, member: &MemberId) -> Option<MemberStatus> {
        self.read(|state| state.members.status(member)).await
    }

    /// Merge a peer's state.
    ///
    /// If the merged view declares this member dead or departed while it still
    /// runs, the member refutes by bumping its incarnation.
    pub async fn merge(&self, incoming: &ClusterState) -> StateChange {
        let mut inner = self.inner.write().await;
        let mut change = inner.state.merge_compacting(incoming, self.local);
        if change.children_changed {
            let seen = incoming.children.max_time();
            inner.clock.observe(seen);
        }
        if let Some(refuted) = refute(&mut inner, self.local) {
            change.transitions.push(refuted);
        }
        drop(inner);

        log_transitions(self.local, &change.transitions);
        if !change.is_empty() {
            self.bump();
        }
        change
    }

    /// Declare a member dead. Returns true if its status changed.
    pub async fn mark_dead(&self, member: MemberId) -> bool {
        if member == self.local {
            return false;
        }
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.state.members.get(&member).copied() else {
            return false;
        };
        if entry.status.is_gone() {
            return false;
        }
        let dead = MemberEntry::new(MemberStatus::Dead, entry.incarnation);
        let transition = inner.state.members.observe(member, dead);
        let compacted = inner.state.compact(self.local);
        drop(inner);
        if compacted > 0 {
            debug!("Dropped superseded claims of {} on {} children", member.short(), compacted);
        }

        if let Some(transition) = transition {
            log_transitions(self.local, &[transition]);
            self.bump();
            return true;
        }
        false
    }

    /// Set this member's own status
    pub async fn set_local_status(&self, status: MemberStatus) {
        let mut inner = self.inner.write().await;
        inner.intent = status;
        let incarnation = inner
            .state
            .members
            .get(&self.local)
            .map_or(0, |entry| entry.incarnation);
        let current = inner.state.members.status(&self.local);

        // Going back to a lower precedence needs a newer incarnation
        let entry = match current {
            Some(current) if current.precedence() > status.precedence() => {
                MemberEntry::new(status, incarnation + 1)
            }
            _ => MemberEntry::new(status, incarnation),
        };
        let transition = inner.state.members.observe(self.local, entry);
        drop(inner);

        if let Some(transition) = transition {
            log_transitions(self.local, &[transition]);
            self.bump();
        }
    }

    /// Write this member's claim on a child. Returns the stamp used.
    pub async fn write_claim(&self, spec: WorkerSpec, state: ClaimState) -> Stamp {
        let mut inner = self.inner.write().await;
        let stamp = Stamp::new(inner.clock.tick(), self.local);
        debug!("Claim {} on {}: {:?}", stamp, spec.id, state);
        let id = spec.id.clone();
        inner.state.children.put(Claim::new(spec, stamp, state));
        inner.state.compact_child(&id, self.local);
        drop(inner);

        self.bump();
        stamp
    }

    /// Handle of the running instance held by a live member. With several
    /// claimants, the one that will survive duplicate resolution.
    pub async fn running_holder(&self, id: &ChildId) -> Option<ChildHandle> {
        self.read(|state| {
            let claims: Vec<&Claim> = state.children.live_running(id, &state.members).collect();
            match claims.as_slice() {
                [] => None,
                [only] => only.handle().cloned(),
                several => {
                    let claimants: Vec<MemberId> = several.iter().map(|claim| claim.member()).collect();
                    let keeper = place(id, &claimants).ok()?;
                    several
                        .iter()
                        .find(|claim| claim.member() == keeper)
                        .and_then(|claim| claim.handle().cloned())
                }
            }
        })
        .await
    }
}

impl std::fmt::Debug for ClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStore")
            .field("local", &self.local)
            .field("epoch", &self.epoch())
            .finish()
    }
}

fn refute(inner: &mut StoreInner, local: MemberId) -> Option<MemberTransition> {
    let entry = inner.state.members.get(&local).copied()?;
    if entry.status == inner.intent || !inner.intent.is_live() {
        return None;
    }
    warn!(
        "Member {} was declared {} at incarnation {}, refuting",
        local.short(),
        entry.status,
        entry.incarnation
    );
    let refuted = MemberEntry::new(inner.intent, entry.incarnation + 1);
    inner.state.members.observe(local, refuted)
}

fn log_transitions(local: MemberId, transitions: &[MemberTransition]) {
    for transition in transitions {
        match transition.from {
            None => info!(
                "Member {} learned of {} ({})",
                local.short(),
                transition.member.short(),
                transition.to
            ),
            Some(from) => info!(
                "Member {} sees {} {} -> {}",
                local.short(),
                transition.member.short(),
                from,
                transition.to
            ),
        }
    }
}
