//! Local supervision.
//!
//! [`LocalSupervisor`] owns this member's child table: it launches children,
//! reacts to their exits, and terminates them. Every claim it writes to the
//! cluster store is written while the table lock is held, so transitions of one
//! child id are strictly sequential on this member. Lock order is table, then
//! store; the store never calls back into the supervisor.

use std::sync::Arc;
use steward_core::{ChildId, MemberId};
use steward_runtime::{
    ChildHandle, ExitNotice, ExitReason, LaunchRequest, Launcher, RunningChild,
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::directory::ClaimState;
use crate::placement::{PlacementError, PlacementStrategy};
use crate::remote::TransportError;
use crate::spec::WorkerSpec;
use crate::store::ClusterStore;
use crate::table::{ChildCounts, ChildPhase, ChildRecord, ChildReport, ChildTable, RestartIntensity};

/// Errors surfaced by supervision operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    /// No member can own the child
    #[error(transparent)]
    PlacementImpossible(#[from] PlacementError),

    /// The owner could not be reached after all attempts
    #[error("owner unreachable: {0}")]
    OwnerUnreachable(MemberId),

    /// The child could not be launched
    #[error("failed to start {child}: {reason}")]
    StartFailed {
        /// Child id
        child: ChildId,
        /// Launcher error
        reason: String,
    },

    /// Unknown child
    #[error("child not found: {0}")]
    NotFound(ChildId),

    /// The child is being terminated
    #[error("child is terminating: {0}")]
    Terminating(ChildId),

    /// This member is leaving the cluster
    #[error("member is shutting down")]
    ShuttingDown,

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Successful start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new instance was launched
    Started(ChildHandle),
    /// An instance was already running
    AlreadyStarted(ChildHandle),
}

impl StartOutcome {
    /// Handle of the running instance
    #[must_use]
    pub fn handle(&self) -> &ChildHandle {
        match self {
            Self::Started(handle) | Self::AlreadyStarted(handle) => handle,
        }
    }
}

/// Why a local start happens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOrigin {
    /// A caller asked for the child
    Request,
    /// Another member released the child to us
    Handoff,
    /// The child's member died or left
    Failover,
    /// A restart whose handoff could not be delivered
    Restart,
}

/// What became of an exit notice
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    /// Relaunched here
    Restarted(ChildHandle),
    /// Released to another member, which must be told
    HandOff {
        /// Spec to hand over
        spec: WorkerSpec,
        /// New owner
        owner: MemberId,
    },
    /// No restart; the record is terminal
    Terminal,
    /// Stale notice, or the child is being stopped
    Ignored,
}

/// How a running child is being retired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retirement {
    /// Stopped on request
    Stop,
    /// Lost duplicate resolution
    Yield,
    /// Drained for a graceful departure
    Drain,
}

/// A child removed from the table by a drain
#[derive(Debug, Clone, PartialEq)]
pub struct Drained {
    /// Spec of the child
    pub spec: WorkerSpec,
    /// How the instance ended
    pub reason: ExitReason,
    /// Whether another member should take it over
    pub handoff: bool,
}

/// Snapshot of the local table taken under one lock
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalView {
    /// Ids in the running phase
    pub running: Vec<ChildId>,
    /// Handles of running or stopping instances
    pub handles: Vec<ChildHandle>,
    /// Ids of terminal records
    pub terminal: Vec<ChildId>,
}

impl LocalView {
    /// Whether an instance of `id` runs or is stopping here
    #[must_use]
    pub fn has_instance(&self, id: &ChildId) -> bool {
        self.handles.iter().any(|handle| handle.child == *id)
    }
}

/// Supervisor of this member's children
pub struct LocalSupervisor {
    local: MemberId,
    table: Mutex<ChildTable>,
    launcher: Arc<dyn Launcher>,
    exits: mpsc::UnboundedSender<ExitNotice>,
    store: Arc<ClusterStore>,
    intensity: RestartIntensity,
}

impl LocalSupervisor {
    /// Create a supervisor. Exit notices of launched children go to `exits`.
    #[must_use]
    pub fn new(
        store: Arc<ClusterStore>,
        launcher: Arc<dyn Launcher>,
        exits: mpsc::UnboundedSender<ExitNotice>,
        intensity: RestartIntensity,
    ) -> Self {
        Self {
            local: store.local(),
            table: Mutex::new(ChildTable::new()),
            launcher,
            exits,
            store,
            intensity,
        }
    }

    /// Start a child on this member.
    ///
    /// A running record answers `AlreadyStarted`; a terminal record is
    /// relaunched in place and keeps its restart history. For caller requests
    /// the directory is consulted too, so an instance elsewhere is reported
    /// instead of duplicated.
    ///
    /// # Errors
    ///
    /// Returns `Terminating` while the child is being stopped, `StartFailed`
    /// if the launcher refuses it
    pub async fn start_local(
        &self,
        spec: WorkerSpec,
        origin: StartOrigin,
    ) -> Result<StartOutcome, SupervisorError> {
        let mut table = self.table.lock().await;
        match table.get(&spec.id).map(|record| &record.phase) {
            Some(ChildPhase::Running(child)) => {
                return Ok(StartOutcome::AlreadyStarted(child.handle().clone()));
            }
            Some(ChildPhase::Stopping(_)) => return Err(SupervisorError::Terminating(spec.id)),
            Some(ChildPhase::Exited) | None => {}
        }

        if origin == StartOrigin::Request {
            if let Some(handle) = self.store.running_holder(&spec.id).await {
                if handle.member != self.local {
                    return Ok(StartOutcome::AlreadyStarted(handle));
                }
            }
        }

        let handle = self.launch_locked(&mut table, spec).await?;
        debug!("Started {} ({:?})", handle, origin);
        Ok(StartOutcome::Started(handle))
    }

    async fn launch_locked(
        &self,
        table: &mut ChildTable,
        spec: WorkerSpec,
    ) -> Result<ChildHandle, SupervisorError> {
        let request = LaunchRequest {
            member: self.local,
            child: spec.id.clone(),
            incarnation: table.next_incarnation(),
            descriptor: spec.start.clone(),
            exits: self.exits.clone(),
        };

        let child = match self.launcher.launch(request).await {
            Ok(child) => child,
            Err(e) => {
                warn!("Launch of {} failed: {}", spec.id, e);
                let reason = ExitReason::Abnormal(e.to_string());
                self.mark_exited(table, spec.clone(), reason).await;
                return Err(SupervisorError::StartFailed {
                    child: spec.id,
                    reason: e.to_string(),
                });
            }
        };

        let handle = child.handle().clone();
        let record = match table.remove(&spec.id) {
            Some(mut record) => {
                record.spec = spec.clone();
                record.phase = ChildPhase::Running(child);
                record
            }
            None => ChildRecord::running(spec.clone(), child),
        };
        table.insert(record);
        self.store
            .write_claim(spec, ClaimState::Running { handle: handle.clone() })
            .await;
        Ok(handle)
    }

    async fn mark_exited(&self, table: &mut ChildTable, spec: WorkerSpec, reason: ExitReason) {
        match table.get_mut(&spec.id) {
            Some(record) => {
                record.phase = ChildPhase::Exited;
                record.last_exit = Some(reason.clone());
            }
            None => table.insert(ChildRecord::exited(spec.clone(), reason.clone())),
        }
        self.store.write_claim(spec, ClaimState::Exited { reason }).await;
    }

    /// React to an exit notice.
    ///
    /// Restarts follow the child's policy and the restart intensity. The
    /// restart goes to `placement.place(id, alive)`: here if that is this
    /// member, otherwise the record is released and the new owner returned.
    pub async fn handle_exit(
        &self,
        notice: ExitNotice,
        alive: &[MemberId],
        placement: &PlacementStrategy,
    ) -> ExitOutcome {
        let mut table = self.table.lock().await;
        let Some(record) = table.get_mut(&notice.child) else {
            return ExitOutcome::Ignored;
        };
        let current = match &record.phase {
            ChildPhase::Running(child) => child.handle().incarnation == notice.incarnation,
            _ => false,
        };
        if !current {
            return ExitOutcome::Ignored;
        }

        let spec = record.spec.clone();
        record.last_exit = Some(notice.reason.clone());
        record.phase = ChildPhase::Exited;

        if !spec.restart.restarts_after(&notice.reason) {
            debug!("Child {} is terminal after {}", spec.id, notice.reason);
            self.store
                .write_claim(spec, ClaimState::Exited { reason: notice.reason })
                .await;
            return ExitOutcome::Terminal;
        }

        if !record.allow_restart(&self.intensity, Instant::now()) {
            warn!(
                "Child {} exceeded {} restarts in {}ms, giving up",
                spec.id, self.intensity.max_restarts, self.intensity.within_ms
            );
            self.store
                .write_claim(spec, ClaimState::Exited { reason: notice.reason })
                .await;
            return ExitOutcome::Terminal;
        }

        let owner = placement.place(&spec.id, alive).unwrap_or(self.local);
        if owner == self.local {
            return match self.launch_locked(&mut table, spec.clone()).await {
                Ok(handle) => {
                    info!("Restarted {} after {}", handle, notice.reason);
                    ExitOutcome::Restarted(handle)
                }
                Err(_) => ExitOutcome::Terminal,
            };
        }

        info!("Child {} exited ({}), handing off to {}", spec.id, notice.reason, owner.short());
        table.remove(&spec.id);
        self.store.write_claim(spec.clone(), ClaimState::Handoff).await;
        ExitOutcome::HandOff { spec, owner }
    }

    /// Stop a child and write a stopped claim. Returns false if unknown here.
    ///
    /// # Errors
    ///
    /// Returns `Terminating` if the child is already being stopped
    pub async fn stop_local(&self, id: &ChildId) -> Result<bool, SupervisorError> {
        Ok(self.retire(id, Retirement::Stop).await?.is_some())
    }

    /// Stop a child that lost duplicate resolution
    ///
    /// # Errors
    ///
    /// Returns `Terminating` if the child is already being stopped
    pub async fn yield_child(&self, id: &ChildId) -> Result<bool, SupervisorError> {
        Ok(self.retire(id, Retirement::Yield).await?.is_some())
    }

    /// Terminate a running child within its budget and release it. Restartable
    /// children get a handoff claim, others an exited claim.
    ///
    /// # Errors
    ///
    /// Returns `Terminating` if the child is already being stopped
    pub async fn drain_child(&self, id: &ChildId) -> Result<Option<Drained>, SupervisorError> {
        self.retire(id, Retirement::Drain).await
    }

    async fn retire(
        &self,
        id: &ChildId,
        how: Retirement,
    ) -> Result<Option<Drained>, SupervisorError> {
        let (spec, child) = {
            let mut table = self.table.lock().await;
            let Some(record) = table.get_mut(id) else {
                return Ok(None);
            };
            match &record.phase {
                ChildPhase::Running(child) => {
                    let child = child.clone();
                    record.phase = ChildPhase::Stopping(child.clone());
                    (record.spec.clone(), child)
                }
                ChildPhase::Stopping(_) => return Err(SupervisorError::Terminating(id.clone())),
                ChildPhase::Exited => {
                    let Some(record) = table.remove(id) else {
                        return Ok(None);
                    };
                    let reason = record.last_exit.clone().unwrap_or(ExitReason::Normal);
                    match how {
                        Retirement::Stop => {
                            self.store.write_claim(record.spec.clone(), ClaimState::Stopped).await;
                        }
                        Retirement::Yield => {
                            self.store.write_claim(record.spec.clone(), ClaimState::Yielded).await;
                        }
                        // The exited claim already stands
                        Retirement::Drain => {}
                    }
                    return Ok(Some(Drained { spec: record.spec, reason, handoff: false }));
                }
            }
        };

        // Terminate outside the lock; the exit notice is ignored while stopping
        let reason = child.terminate(spec.shutdown).await;

        let mut table = self.table.lock().await;
        let still_ours = table
            .get(id)
            .and_then(ChildRecord::handle)
            .is_some_and(|handle| handle == child.handle());
        if still_ours {
            table.remove(id);
        }

        let handoff = how == Retirement::Drain && spec.restart.survives_failover();
        let state = match how {
            Retirement::Stop => ClaimState::Stopped,
            Retirement::Yield => ClaimState::Yielded,
            Retirement::Drain if handoff => ClaimState::Handoff,
            Retirement::Drain => ClaimState::Exited { reason: reason.clone() },
        };
        info!("Child {} retired ({:?}): {}", child.handle(), how, reason);
        self.store.write_claim(spec.clone(), state).await;
        drop(table);

        Ok(Some(Drained { spec, reason, handoff }))
    }

    /// Rewrite running claims of this member that no local instance backs.
    /// Such claims survive a crash and restart of a member with the same id.
    ///
    /// When the id has a local record, the claim is rewritten from the record
    /// instead: a running instance is re-asserted, a terminal record restates
    /// its exit. Returns the number of claims written.
    pub async fn release_orphans(&self, candidates: Vec<(WorkerSpec, ChildHandle)>) -> usize {
        let table = self.table.lock().await;
        let mut written = 0;
        for (spec, handle) in candidates {
            // A newer claim written since the candidates were computed wins anyway
            let (spec, state) = match table.get(&spec.id) {
                Some(record) if record.handle() == Some(&handle) => continue,
                // The stopping path writes its own claim when done
                Some(ChildRecord { phase: ChildPhase::Stopping(_), .. }) => continue,
                Some(ChildRecord { phase: ChildPhase::Running(child), spec, .. }) => {
                    warn!("Claim {} outranked running {}, re-asserting", handle, child.handle());
                    let state = ClaimState::Running { handle: child.handle().clone() };
                    (spec.clone(), state)
                }
                Some(record) => {
                    let reason = record.last_exit.clone().unwrap_or(ExitReason::Normal);
                    warn!("Claim {} outranked exited {}, restating", handle, spec.id);
                    (record.spec.clone(), ClaimState::Exited { reason })
                }
                None => {
                    let state = if spec.restart.survives_failover() {
                        ClaimState::Handoff
                    } else {
                        ClaimState::Exited { reason: ExitReason::Killed }
                    };
                    warn!("Releasing orphaned claim {}", handle);
                    (spec, state)
                }
            };
            self.store.write_claim(spec, state).await;
            written += 1;
        }
        written
    }

    /// Drop terminal records for ids now owned elsewhere
    pub async fn prune_terminal(&self, ids: &[ChildId]) {
        let mut table = self.table.lock().await;
        for id in ids {
            if table.get(id).is_some_and(|record| matches!(record.phase, ChildPhase::Exited)) {
                table.remove(id);
            }
        }
    }

    /// Kill everything without writing claims
    pub async fn kill_all(&self) -> usize {
        let records = self.table.lock().await.drain();
        let instances: Vec<RunningChild> = records
            .iter()
            .filter_map(|record| record.instance().cloned())
            .collect();
        for child in &instances {
            child.kill().await;
        }
        instances.len()
    }

    /// Kill children that are still running or stopping, leaving restartable
    /// ones to failover. Returns their ids.
    pub async fn kill_remaining(&self) -> Vec<ChildId> {
        let mut table = self.table.lock().await;
        let mut killed = Vec::new();
        for record in table.drain() {
            let Some(child) = record.instance() else {
                continue;
            };
            child.kill().await;
            let state = if record.spec.restart.survives_failover() {
                ClaimState::Handoff
            } else {
                ClaimState::Exited { reason: ExitReason::Killed }
            };
            self.store.write_claim(record.spec.clone(), state).await;
            killed.push(record.spec.id);
        }
        killed
    }

    /// Ids of children in the running phase
    pub async fn running_ids(&self) -> Vec<ChildId> {
        self.table.lock().await.running_ids()
    }

    /// Snapshot the table for a reconcile pass
    pub async fn local_view(&self) -> LocalView {
        let table = self.table.lock().await;
        let mut view = LocalView::default();
        for record in table.iter() {
            match record.handle() {
                Some(handle) => view.handles.push(handle.clone()),
                None => view.terminal.push(record.spec.id.clone()),
            }
            if record.is_running() {
                view.running.push(record.spec.id.clone());
            }
        }
        view
    }

    /// Whether a record exists for `id`
    pub async fn contains(&self, id: &ChildId) -> bool {
        self.table.lock().await.contains(id)
    }

    /// Report every local record
    pub async fn reports(&self) -> Vec<ChildReport> {
        self.table.lock().await.reports()
    }

    /// Count local records
    pub async fn counts(&self) -> ChildCounts {
        ChildCounts::from_reports(&self.reports().await)
    }
}

impl std::fmt::Debug for LocalSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSupervisor")
            .field("local", &self.local)
            .field("intensity", &self.intensity)
            .finish()
    }
}
