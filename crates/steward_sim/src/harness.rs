//! Simulated cluster harness.
//!
//! Members are named; a name always maps to the same member id, so a crashed
//! member can come back under its old identity. Waiting helpers block on the
//! members' state-change signals rather than sleeping blindly.

use futures::future::select_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use steward_cluster::{ChildCounts, Node, NodeConfig, RequestHandler, ShutdownReport, SupervisorError};
use steward_core::{CoreError, MemberId};
use steward_runtime::{EntryRegistry, LocalLauncher};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;

use crate::network::{Latency, SimNetwork};
use crate::seed::SimSeed;

/// Harness errors
#[derive(Debug, Error)]
pub enum SimError {
    /// No member with this name
    #[error("unknown member: {0}")]
    UnknownMember(String),

    /// A member with this name is already running
    #[error("member already running: {0}")]
    AlreadyRunning(String),

    /// Invalid node configuration
    #[error(transparent)]
    Config(#[from] CoreError),

    /// A cluster operation failed
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// A wait did not complete in time
    #[error("timed out after {after_ms}ms waiting for {what}")]
    Timeout {
        /// What was awaited
        what: String,
        /// Wait limit
        after_ms: u64,
    },
}

/// Simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Seed for reproducibility
    pub seed: SimSeed,
    /// Network delay
    pub latency: Latency,
    /// Send every message through its JSON encoding
    pub wire_json: bool,
    /// Configuration of every member
    pub node: NodeConfig,
}

impl SimConfig {
    /// Create a new simulation config with fast gossip
    #[must_use]
    pub fn new(seed: SimSeed) -> Self {
        Self {
            seed,
            latency: Latency::new(0, 2),
            wire_json: false,
            node: NodeConfig::new()
                .with_gossip_interval(20)
                .with_call_timeout(500)
                .with_query_timeout(500),
        }
    }

    /// Set network delay
    #[must_use]
    pub fn with_latency(mut self, latency: Latency) -> Self {
        self.latency = latency;
        self
    }

    /// Encode every message as JSON
    #[must_use]
    pub fn with_wire_json(mut self, wire_json: bool) -> Self {
        self.wire_json = wire_json;
        self
    }

    /// Set the member configuration
    #[must_use]
    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new(SimSeed::default())
    }
}

/// A cluster of members on a simulated network
pub struct SimCluster {
    config: SimConfig,
    network: Arc<SimNetwork>,
    registry: Arc<EntryRegistry>,
    members: RwLock<BTreeMap<String, Arc<Node>>>,
}

impl SimCluster {
    /// Create an empty cluster whose members run entries from `registry`
    #[must_use]
    pub fn new(config: SimConfig, registry: EntryRegistry) -> Self {
        let network = Arc::new(SimNetwork::new(&config.seed, config.latency, config.wire_json));
        Self {
            config,
            network,
            registry: Arc::new(registry),
            members: RwLock::new(BTreeMap::new()),
        }
    }

    /// The simulated network
    #[must_use]
    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }

    /// Member id of a name
    #[must_use]
    pub fn member_id(name: &str) -> MemberId {
        MemberId::from_name(name)
    }

    /// Start a member
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken or the configuration is invalid
    pub async fn spawn_member(&self, name: &str) -> Result<Arc<Node>, SimError> {
        let mut members = self.members.write().await;
        if members.contains_key(name) {
            return Err(SimError::AlreadyRunning(name.to_string()));
        }

        let id = Self::member_id(name);
        let launcher = Arc::new(LocalLauncher::new(Arc::clone(&self.registry)));
        let transport = Arc::clone(&self.network);
        let node = Node::start(id, self.config.node.clone(), launcher, transport)?;
        let handler: Arc<dyn RequestHandler> = Arc::clone(&node) as Arc<dyn RequestHandler>;
        self.network.register(id, handler).await;
        members.insert(name.to_string(), Arc::clone(&node));

        info!("Spawned member {} as {}", name, id.short());
        Ok(node)
    }

    /// Start members and join each to the first
    ///
    /// # Errors
    ///
    /// Returns error if a member fails to start or join
    pub async fn spawn_cluster(&self, names: &[&str]) -> Result<Vec<Arc<Node>>, SimError> {
        let mut nodes = Vec::with_capacity(names.len());
        for name in names {
            nodes.push(self.spawn_member(name).await?);
        }
        if let Some((first, rest)) = names.split_first() {
            for name in rest {
                self.join(name, first).await?;
            }
        }
        Ok(nodes)
    }

    /// Running member by name
    ///
    /// # Errors
    ///
    /// Returns error if no such member runs
    pub async fn node(&self, name: &str) -> Result<Arc<Node>, SimError> {
        self.members
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SimError::UnknownMember(name.to_string()))
    }

    /// Running members
    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        self.members.read().await.values().cloned().collect()
    }

    /// Join `name` to the cluster `via` belongs to
    ///
    /// # Errors
    ///
    /// Returns error if either member is unknown or the join fails
    pub async fn join(&self, name: &str, via: &str) -> Result<(), SimError> {
        let node = self.node(name).await?;
        let peer = self.node(via).await?;
        node.join(peer.id()).await?;
        Ok(())
    }

    /// Kill a member abruptly. Other members find out through failure detection
    /// or `notify_down`.
    ///
    /// # Errors
    ///
    /// Returns error if no such member runs
    pub async fn crash(&self, name: &str) -> Result<(), SimError> {
        let node = self
            .members
            .write()
            .await
            .remove(name)
            .ok_or_else(|| SimError::UnknownMember(name.to_string()))?;
        self.network.unregister(&node.id()).await;
        node.abort().await;
        info!("Crashed member {}", name);
        Ok(())
    }

    /// Tell every running member that `name` is down
    pub async fn notify_down(&self, name: &str) {
        let down = Self::member_id(name);
        for node in self.nodes().await {
            if node.id() != down {
                node.notify_down(down).await;
            }
        }
    }

    /// Stop a member gracefully
    ///
    /// # Errors
    ///
    /// Returns error if no such member runs
    pub async fn stop(&self, name: &str, timeout: Duration) -> Result<ShutdownReport, SimError> {
        let node = self.node(name).await?;
        let report = node.stop(timeout).await;
        self.members.write().await.remove(name);
        self.network.unregister(&node.id()).await;
        Ok(report)
    }

    /// Split the network into groups of member names
    pub async fn partition(&self, groups: &[&[&str]]) {
        let groups = groups
            .iter()
            .map(|group| group.iter().map(|name| Self::member_id(name)).collect())
            .collect();
        self.network.partition(groups).await;
    }

    /// Heal all partitions
    pub async fn heal(&self) {
        self.network.heal().await;
    }

    /// Wait until every running member holds the same cluster state
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the states still differ at the deadline
    pub async fn await_converged(&self, timeout: Duration) -> Result<(), SimError> {
        self.await_condition("convergence", timeout, move || async move {
            let nodes = self.nodes().await;
            let mut states = Vec::with_capacity(nodes.len());
            for node in &nodes {
                states.push(node.store().snapshot().await);
            }
            states.windows(2).all(|pair| pair[0] == pair[1])
        })
        .await
    }

    /// Wait until `count_children` asked at `name` reports `active` running
    /// children, and return the counts
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the count differs at the deadline
    pub async fn await_active(&self, name: &str, active: usize, timeout: Duration) -> Result<ChildCounts, SimError> {
        let node = &self.node(name).await?;
        let what = format!("{} active children", active);
        self.await_condition(&what, timeout, move || async move {
            node.count_children().await.active == active
        })
        .await?;
        Ok(node.count_children().await)
    }

    /// Wait until `done` holds. It is re-checked whenever some member's state
    /// changes, and once per gossip interval otherwise.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if `done` still fails at the deadline
    pub async fn await_condition<F, Fut>(&self, what: &str, timeout: Duration, mut done: F) -> Result<(), SimError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        let tick = self.config.node.gossip_interval();
        loop {
            let mut signals: Vec<_> = self.nodes().await.iter().map(|node| node.subscribe()).collect();
            if done().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SimError::Timeout {
                    what: what.to_string(),
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }

            let wake = (Instant::now() + tick).min(deadline);
            if signals.is_empty() {
                tokio::time::sleep_until(wake).await;
                continue;
            }
            let changed = select_all(signals.iter_mut().map(|signal| Box::pin(signal.changed())));
            // Either a change or the tick; both mean re-check
            let _ = tokio::time::timeout_at(wake, changed).await;
        }
    }
}

impl std::fmt::Debug for SimCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCluster")
            .field("config", &self.config)
            .field("network", &self.network)
            .finish()
    }
}
