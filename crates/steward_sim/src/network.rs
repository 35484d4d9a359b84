//! In-memory network between simulated members.
//!
//! Requests are delivered by calling the target's handler on a fresh task, after
//! a seeded random delay. Partitions and unregistered (crashed) members refuse
//! delivery immediately. Optionally every message is sent through its JSON wire
//! encoding.

use async_trait::async_trait;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use steward_cluster::{RemoteRequest, RequestHandler, Response, Transport, TransportError};
use steward_core::MemberId;
use tokio::sync::RwLock;
use tracing::trace;

use crate::seed::SimSeed;

/// One-way delivery delay, drawn uniformly per message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latency {
    /// Lower bound in milliseconds
    pub min_ms: u64,
    /// Upper bound in milliseconds
    pub max_ms: u64,
}

impl Latency {
    /// No delay
    pub const ZERO: Self = Self { min_ms: 0, max_ms: 0 };

    /// Create a latency range
    #[must_use]
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: max_ms.max(min_ms),
        }
    }

    fn sample(&self, rng: &mut ChaCha8Rng) -> Duration {
        if self.max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(self.min_ms..=self.max_ms))
    }
}

impl Default for Latency {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Requests answered
    pub delivered: u64,
    /// Requests refused by a partition or a missing member
    pub refused: u64,
}

/// Simulated network
pub struct SimNetwork {
    handlers: RwLock<HashMap<MemberId, Arc<dyn RequestHandler>>>,
    partitions: RwLock<Vec<HashSet<MemberId>>>,
    latency: Latency,
    wire_json: bool,
    rng: Mutex<ChaCha8Rng>,
    delivered: AtomicU64,
    refused: AtomicU64,
}

impl SimNetwork {
    /// Create a network
    #[must_use]
    pub fn new(seed: &SimSeed, latency: Latency, wire_json: bool) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            partitions: RwLock::new(Vec::new()),
            latency,
            wire_json,
            rng: Mutex::new(seed.derive("network").rng()),
            delivered: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    /// Attach a member
    pub async fn register(&self, member: MemberId, handler: Arc<dyn RequestHandler>) {
        self.handlers.write().await.insert(member, handler);
    }

    /// Detach a member; calls to it fail from now on
    pub async fn unregister(&self, member: &MemberId) {
        self.handlers.write().await.remove(member);
    }

    /// Split the network. Members in different groups cannot talk; members in
    /// no group only talk to each other.
    pub async fn partition(&self, groups: Vec<Vec<MemberId>>) {
        *self.partitions.write().await = groups
            .into_iter()
            .map(|group| group.into_iter().collect())
            .collect();
    }

    /// Heal all partitions
    pub async fn heal(&self) {
        self.partitions.write().await.clear();
    }

    /// Check if two members can communicate
    pub async fn can_communicate(&self, from: MemberId, to: MemberId) -> bool {
        let partitions = self.partitions.read().await;
        let group_of = |member: MemberId| partitions.iter().position(|group| group.contains(&member));
        group_of(from) == group_of(to)
    }

    /// Delivery counters so far
    #[must_use]
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }

    async fn route(&self, from: MemberId, to: MemberId) -> Result<Arc<dyn RequestHandler>, TransportError> {
        if !self.can_communicate(from, to).await {
            return Err(self.refuse(to));
        }
        self.handlers
            .read()
            .await
            .get(&to)
            .cloned()
            .ok_or_else(|| self.refuse(to))
    }

    fn refuse(&self, target: MemberId) -> TransportError {
        self.refused.fetch_add(1, Ordering::Relaxed);
        TransportError::Unreachable(target)
    }

    async fn delay(&self) {
        let delay = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            self.latency.sample(&mut rng)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn carry<T: Serialize + DeserializeOwned>(&self, message: T) -> Result<T, TransportError> {
        if !self.wire_json {
            return Ok(message);
        }
        let encoded = serde_json::to_vec(&message)
            .map_err(|e| TransportError::InvalidResponse(format!("encode: {}", e)))?;
        serde_json::from_slice(&encoded)
            .map_err(|e| TransportError::InvalidResponse(format!("decode: {}", e)))
    }
}

#[async_trait]
impl Transport for SimNetwork {
    async fn call(
        &self,
        target: MemberId,
        request: RemoteRequest,
        _timeout: Duration,
    ) -> Result<Response, TransportError> {
        let source = request.source;
        let request = self.carry(request)?;
        self.delay().await;

        let handler = self.route(source, target).await?;
        trace!("Delivering {} -> {}", source.short(), target.short());
        // The handler runs to completion even if the caller gives up
        let response = tokio::spawn(async move { handler.handle(request).await })
            .await
            .map_err(|e| TransportError::InvalidResponse(format!("handler failed: {}", e)))?;

        self.delay().await;
        if !self.can_communicate(target, source).await {
            return Err(self.refuse(target));
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.carry(response)
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("latency", &self.latency)
            .field("wire_json", &self.wire_json)
            .field("stats", &self.stats())
            .finish()
    }
}
