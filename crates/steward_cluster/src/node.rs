//! Cluster member.
//!
//! A [`Node`] ties the pieces together: the replicated store, the local
//! supervisor and the remote client. Two background tasks run per node. The
//! event loop processes exit notices and reconcile passes one at a time; the
//! gossip loop exchanges state with peers and doubles as failure detector.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use steward_core::{ChildId, CoreResult, MemberId};
use steward_runtime::{ExitNotice, Launcher};
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::failover::{failover_candidates, orphaned_claims, superseded_terminal};
use crate::merge::{duplicate_losers, union_reports};
use crate::remote::{RemoteClient, RemoteRequest, Request, RequestHandler, Response, StartReply, Transport};
use crate::spec::WorkerSpec;
use crate::state::ClusterState;
use crate::store::ClusterStore;
use crate::supervisor::{ExitOutcome, LocalSupervisor, StartOrigin, StartOutcome, SupervisorError};
use crate::table::{ChildCounts, ChildReport};

/// Where the node is in its own lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting work
    Running,
    /// Draining for a graceful stop
    Leaving,
    /// Stopped or aborted
    Stopped,
}

/// One cluster member
pub struct Node {
    pub(crate) id: MemberId,
    pub(crate) config: NodeConfig,
    pub(crate) store: Arc<ClusterStore>,
    pub(crate) supervisor: LocalSupervisor,
    pub(crate) client: RemoteClient,
    pub(crate) lifecycle: RwLock<Lifecycle>,
    reconcile_needed: Notify,
    gossip_soon: Notify,
    pub(crate) background: CancellationToken,
    gossip_failures: Mutex<HashMap<MemberId, u32>>,
    last_pushed: Mutex<HashMap<MemberId, u64>>,
}

impl Node {
    /// Create a node and spawn its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn start(
        id: MemberId,
        config: NodeConfig,
        launcher: Arc<dyn Launcher>,
        transport: Arc<dyn Transport>,
    ) -> CoreResult<Arc<Self>> {
        config.validate()?;

        let store = Arc::new(ClusterStore::starting_now(id));
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let supervisor = LocalSupervisor::new(
            Arc::clone(&store),
            launcher,
            exits_tx,
            config.restart_intensity,
        );
        let client = RemoteClient::new(id, transport)
            .with_call_timeout(config.call_timeout())
            .with_query_timeout(config.query_timeout());

        let node = Arc::new(Self {
            id,
            config,
            store,
            supervisor,
            client,
            lifecycle: RwLock::new(Lifecycle::Running),
            reconcile_needed: Notify::new(),
            gossip_soon: Notify::new(),
            background: CancellationToken::new(),
            gossip_failures: Mutex::new(HashMap::new()),
            last_pushed: Mutex::new(HashMap::new()),
        });

        tokio::spawn(Arc::clone(&node).run_events(exits_rx));
        tokio::spawn(Arc::clone(&node).run_gossip());
        info!("Member {} started", id.short());
        Ok(node)
    }

    /// Member id
    #[must_use]
    pub fn id(&self) -> MemberId {
        self.id
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Replicated state store
    #[must_use]
    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.store
    }

    /// Watch this member's state epoch
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.store.subscribe()
    }

    /// Current lifecycle
    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().await
    }

    async fn ensure_running(&self) -> Result<(), SupervisorError> {
        match self.lifecycle().await {
            Lifecycle::Running => Ok(()),
            Lifecycle::Leaving | Lifecycle::Stopped => Err(SupervisorError::ShuttingDown),
        }
    }

    /// Join the cluster `peer` belongs to.
    ///
    /// Exchanges full state with `peer`; both sides then gossip onward.
    /// Joining a member already in the cluster is harmless.
    ///
    /// # Errors
    ///
    /// Returns error if `peer` cannot be reached
    pub async fn join(&self, peer: MemberId) -> Result<(), SupervisorError> {
        if peer == self.id {
            return Ok(());
        }
        let state = self.store.snapshot().await;
        let theirs = self.client.gossip(peer, state).await?;
        self.absorb(&theirs).await;
        self.gossip_soon.notify_one();
        info!("Member {} joined via {}", self.id.short(), peer.short());
        Ok(())
    }

    /// Report that a member is down. Called by the failure-detection
    /// collaborator of the transport.
    pub async fn notify_down(&self, member: MemberId) {
        if self.store.mark_dead(member).await {
            self.reconcile_needed.notify_one();
            self.gossip_soon.notify_one();
        }
    }

    /// Start a child somewhere in the cluster.
    ///
    /// # Errors
    ///
    /// Returns `PlacementImpossible` without alive members or below quorum, `OwnerUnreachable`
    /// if forwarding failed on every attempt, `StartFailed` if the owner could
    /// not launch it, `ShuttingDown` while this member leaves
    pub async fn start_child(&self, spec: WorkerSpec) -> Result<StartOutcome, SupervisorError> {
        self.ensure_running().await?;

        let attempts = self.config.forward_attempts;
        let mut last = self.id;
        for attempt in 1..=attempts {
            if let Some(handle) = self.store.running_holder(&spec.id).await {
                if handle.member != self.id {
                    return Ok(StartOutcome::AlreadyStarted(handle));
                }
            }

            let alive = self.store.alive().await;
            let owner = self.config.placement.place(&spec.id, &alive)?;
            if owner == self.id {
                return self.supervisor.start_local(spec, StartOrigin::Request).await;
            }

            debug!("Forwarding start of {} to {}", spec.id, owner.short());
            match self.client.start_child(owner, spec.clone()).await {
                Ok(StartReply::Started(handle)) => return Ok(StartOutcome::Started(handle)),
                Ok(StartReply::AlreadyStarted(handle)) => {
                    return Ok(StartOutcome::AlreadyStarted(handle));
                }
                Ok(StartReply::Failed(reason)) => {
                    return Err(SupervisorError::StartFailed { child: spec.id, reason });
                }
                Ok(StartReply::NotAccepting) => {
                    debug!("Owner {} of {} is leaving", owner.short(), spec.id);
                }
                Err(e) => {
                    warn!(
                        "Forwarding {} to {} failed (attempt {}/{}): {}",
                        spec.id,
                        owner.short(),
                        attempt,
                        attempts,
                        e
                    );
                }
            }

            last = owner;
            if attempt < attempts {
                tokio::time::sleep(self.config.gossip_interval()).await;
            }
        }
        Err(SupervisorError::OwnerUnreachable(last))
    }

    /// Stop a child wherever it runs. A stopped child is never restarted or
    /// failed over.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `OwnerUnreachable` if its member
    /// could not be reached, `ShuttingDown` while this member leaves
    pub async fn stop_child(&self, id: &ChildId) -> Result<(), SupervisorError> {
        self.ensure_running().await?;

        let attempts = self.config.forward_attempts;
        let mut last = self.id;
        for attempt in 1..=attempts {
            let target = match self.store.running_holder(id).await {
                Some(handle) => handle.member,
                None if self.supervisor.contains(id).await => self.id,
                None => {
                    let alive = self.store.alive().await;
                    self.config.placement.place(id, &alive)?
                }
            };

            if target == self.id {
                return if self.supervisor.stop_local(id).await? {
                    Ok(())
                } else {
                    Err(SupervisorError::NotFound(id.clone()))
                };
            }

            let timeout = self.stop_call_timeout(id).await;
            match self.client.stop_child(target, id.clone(), timeout).await {
                Ok(true) => return Ok(()),
                Ok(false) => return Err(SupervisorError::NotFound(id.clone())),
                Err(e) => warn!("Stopping {} on {} failed: {}", id, target.short(), e),
            }

            last = target;
            if attempt < attempts {
                tokio::time::sleep(self.config.gossip_interval()).await;
            }
        }
        Err(SupervisorError::OwnerUnreachable(last))
    }

    async fn stop_call_timeout(&self, id: &ChildId) -> Duration {
        let budget = self
            .store
            .read(|state| state.children.latest(id).map(|claim| claim.spec.shutdown))
            .await;
        let grace = match budget.map(|budget| budget.limit()) {
            Some(Some(limit)) => limit,
            // Unbounded budget: wait as long as a caller plausibly would
            Some(None) => Duration::from_secs(3600),
            None => Duration::ZERO,
        };
        self.config.call_timeout() + grace
    }

    /// Every child in the cluster, one row per id.
    ///
    /// Members that do not answer within the query timeout are skipped.
    pub async fn which_children(&self) -> Vec<ChildReport> {
        let others: Vec<MemberId> = self
            .store
            .live()
            .await
            .into_iter()
            .filter(|member| *member != self.id)
            .collect();

        let mut collected = self.client.collect_children(&others).await;
        if self.lifecycle().await != Lifecycle::Stopped {
            collected.push((self.id, self.supervisor.reports().await));
        }
        union_reports(collected)
    }

    /// Counts over `which_children`
    pub async fn count_children(&self) -> ChildCounts {
        ChildCounts::from_reports(&self.which_children().await)
    }

    /// Children materialised on this member only
    pub async fn local_children(&self) -> Vec<ChildReport> {
        self.supervisor.reports().await
    }

    async fn run_events(self: Arc<Self>, mut exits: mpsc::UnboundedReceiver<ExitNotice>) {
        loop {
            tokio::select! {
                biased;
                () = self.background.cancelled() => break,
                Some(notice) = exits.recv() => self.on_exit(notice).await,
                () = self.reconcile_needed.notified() => self.reconcile().await,
            }
        }
        debug!("Member {} event loop stopped", self.id.short());
    }

    async fn on_exit(self: &Arc<Self>, notice: ExitNotice) {
        let alive = self.store.alive().await;
        let outcome = self
            .supervisor
            .handle_exit(notice, &alive, &self.config.placement)
            .await;
        if let ExitOutcome::HandOff { spec, owner } = outcome {
            let node = Arc::clone(self);
            tokio::spawn(async move { node.forward_restart(spec, owner).await });
        }
    }

    async fn forward_restart(&self, spec: WorkerSpec, owner: MemberId) {
        let id = spec.id.clone();
        match self.client.handoff(owner, spec.clone()).await {
            Ok(StartReply::Started(handle) | StartReply::AlreadyStarted(handle)) => {
                info!("Restarted {} on {}", id, handle);
                return;
            }
            Ok(reply) => warn!("Owner {} refused restart of {}: {:?}", owner.short(), id, reply),
            Err(e) => warn!("Restart handoff of {} to {} failed: {}", id, owner.short(), e),
        }

        if self.lifecycle().await != Lifecycle::Running {
            // The handoff claim stands; failover picks it up
            return;
        }
        match self.supervisor.start_local(spec, StartOrigin::Restart).await {
            Ok(outcome) => info!("Restarted {} locally as {}", id, outcome.handle()),
            Err(e) => warn!("Local restart of {} failed: {}", id, e),
        }
    }

    /// Re-evaluate ownership against the current state: fail over orphaned
    /// children, resolve duplicates, clean up stale local records.
    async fn reconcile(self: &Arc<Self>) {
        let lifecycle = self.lifecycle().await;
        if lifecycle == Lifecycle::Stopped {
            return;
        }

        let view = self.supervisor.local_view().await;
        let (failover, losers, orphans, superseded) = self
            .store
            .read(|state| {
                (
                    failover_candidates(state, self.id, &self.config.placement, &view),
                    duplicate_losers(state, self.id, &view.running),
                    orphaned_claims(state, self.id, &view),
                    superseded_terminal(state, self.id, &view),
                )
            })
            .await;

        if lifecycle == Lifecycle::Running {
            for spec in failover {
                let id = spec.id.clone();
                match self.supervisor.start_local(spec, StartOrigin::Failover).await {
                    Ok(outcome) => info!("Failed over {} to {}", id, outcome.handle()),
                    Err(e) => warn!("Failover of {} failed: {}", id, e),
                }
            }
        }

        for id in losers {
            info!("Member {} yields duplicate {}", self.id.short(), id);
            let node = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = node.supervisor.yield_child(&id).await {
                    debug!("Yield of {} skipped: {}", id, e);
                }
            });
        }

        if !orphans.is_empty() && self.supervisor.release_orphans(orphans).await > 0 {
            self.reconcile_needed.notify_one();
        }
        if !superseded.is_empty() {
            self.supervisor.prune_terminal(&superseded).await;
        }
    }

    async fn run_gossip(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.gossip_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let period = u64::from(self.config.anti_entropy_rounds);
        let mut round: u64 = 0;

        loop {
            tokio::select! {
                biased;
                () = self.background.cancelled() => break,
                _ = ticker.tick() => {}
                () = self.gossip_soon.notified() => {}
            }
            round += 1;
            self.gossip_round(round % period == 0).await;
        }
        debug!("Member {} gossip loop stopped", self.id.short());
    }

    /// One gossip round. Peers are pushed to when the local state changed since
    /// their last exchange; a full round includes every peer, dead ones too.
    pub(crate) async fn gossip_round(&self, full: bool) {
        let peers = self.store.peers(full).await;
        if peers.is_empty() {
            return;
        }

        // Read the epoch before the snapshot so a racing change is pushed again
        let epoch = self.store.epoch();
        let targets: Vec<MemberId> = {
            let pushed = self.last_pushed.lock().await;
            peers
                .into_iter()
                .filter(|peer| full || pushed.get(peer) != Some(&epoch))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let state = self.store.snapshot().await;
        let exchanges = targets
            .iter()
            .map(|peer| self.exchange(*peer, state.clone(), epoch));
        join_all(exchanges).await;
    }

    async fn exchange(&self, peer: MemberId, state: ClusterState, epoch: u64) {
        match self.client.gossip(peer, state).await {
            Ok(theirs) => {
                self.gossip_failures.lock().await.remove(&peer);
                self.last_pushed.lock().await.insert(peer, epoch);
                self.absorb(&theirs).await;
            }
            Err(e) => {
                let failures = {
                    let mut failures = self.gossip_failures.lock().await;
                    let count = failures.entry(peer).or_insert(0);
                    *count += 1;
                    *count
                };
                debug!(
                    "Gossip {} -> {} failed ({} in a row): {}",
                    self.id.short(),
                    peer.short(),
                    failures,
                    e
                );
                if self.config.suspect_after.is_some_and(|limit| failures >= limit)
                    && self.store.mark_dead(peer).await
                {
                    warn!(
                        "Member {} declares {} dead after {} failed exchanges",
                        self.id.short(),
                        peer.short(),
                        failures
                    );
                    self.reconcile_needed.notify_one();
                    self.gossip_soon.notify_one();
                }
            }
        }
    }

    async fn absorb(&self, theirs: &ClusterState) {
        let change = self.store.merge(theirs).await;
        if !change.is_empty() {
            self.reconcile_needed.notify_one();
            self.gossip_soon.notify_one();
        }
    }

    async fn accept_start(&self, spec: WorkerSpec, origin: StartOrigin) -> StartReply {
        if self.ensure_running().await.is_err() {
            return StartReply::NotAccepting;
        }
        match self.supervisor.start_local(spec, origin).await {
            Ok(StartOutcome::Started(handle)) => StartReply::Started(handle),
            Ok(StartOutcome::AlreadyStarted(handle)) => StartReply::AlreadyStarted(handle),
            Err(e) => StartReply::Failed(e.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for Node {
    async fn handle(&self, request: RemoteRequest) -> Response {
        self.gossip_failures.lock().await.remove(&request.source);
        match request.body {
            Request::Gossip(state) => {
                self.absorb(&state).await;
                Response::Gossip(Box::new(self.store.snapshot().await))
            }
            Request::StartChild(spec) => {
                Response::Start(self.accept_start(spec, StartOrigin::Request).await)
            }
            Request::Handoff(spec) => {
                Response::Start(self.accept_start(spec, StartOrigin::Handoff).await)
            }
            Request::StopChild(id) => match self.supervisor.stop_local(&id).await {
                Ok(found) => Response::Stopped { found },
                // Already on its way down
                Err(_) => Response::Stopped { found: true },
            },
            Request::LocalChildren => Response::Children(self.supervisor.reports().await),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}
