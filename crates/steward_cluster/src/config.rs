//! Node configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use steward_core::{CoreError, CoreResult};

use crate::placement::PlacementStrategy;
use crate::table::RestartIntensity;

/// Configuration of one cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Gossip round period in milliseconds
    pub gossip_interval_ms: u64,
    /// Every this many rounds, exchange with every peer regardless of changes
    pub anti_entropy_rounds: u32,
    /// Timeout for gossip, start and stop calls in milliseconds
    pub call_timeout_ms: u64,
    /// Per-member timeout for child queries in milliseconds
    pub query_timeout_ms: u64,
    /// Placement attempts before a start gives up
    pub forward_attempts: u32,
    /// Consecutive failed gossip exchanges before a peer is declared dead
    pub suspect_after: Option<u32>,
    /// Restart bound per child
    pub restart_intensity: RestartIntensity,
    /// Placement strategy
    pub placement: PlacementStrategy,
}

impl NodeConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            gossip_interval_ms: 200,
            anti_entropy_rounds: 10,
            call_timeout_ms: 1000,
            query_timeout_ms: 1000,
            forward_attempts: 3,
            suspect_after: Some(3),
            restart_intensity: RestartIntensity::default(),
            placement: PlacementStrategy::default(),
        }
    }

    /// Set gossip interval
    #[must_use]
    pub fn with_gossip_interval(mut self, interval_ms: u64) -> Self {
        self.gossip_interval_ms = interval_ms;
        self
    }

    /// Set anti-entropy period in rounds
    #[must_use]
    pub fn with_anti_entropy_rounds(mut self, rounds: u32) -> Self {
        self.anti_entropy_rounds = rounds;
        self
    }

    /// Set call timeout
    #[must_use]
    pub fn with_call_timeout(mut self, timeout_ms: u64) -> Self {
        self.call_timeout_ms = timeout_ms;
        self
    }

    /// Set query timeout
    #[must_use]
    pub fn with_query_timeout(mut self, timeout_ms: u64) -> Self {
        self.query_timeout_ms = timeout_ms;
        self
    }

    /// Set forward attempts
    #[must_use]
    pub fn with_forward_attempts(mut self, attempts: u32) -> Self {
        self.forward_attempts = attempts;
        self
    }

    /// Set failure detector threshold; `None` disables it
    #[must_use]
    pub fn with_suspect_after(mut self, failures: Option<u32>) -> Self {
        self.suspect_after = failures;
        self
    }

    /// Set restart intensity
    #[must_use]
    pub fn with_restart_intensity(mut self, intensity: RestartIntensity) -> Self {
        self.restart_intensity = intensity;
        self
    }

    /// Set placement strategy
    #[must_use]
    pub fn with_placement(mut self, placement: PlacementStrategy) -> Self {
        self.placement = placement;
        self
    }

    /// Gossip interval
    #[must_use]
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    /// Call timeout
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Query timeout
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` naming the first invalid field
    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |field: &str, reason: &str| {
            Err(CoreError::Validation {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.gossip_interval_ms == 0 {
            return invalid("gossip_interval_ms", "must be non-zero");
        }
        if self.anti_entropy_rounds == 0 {
            return invalid("anti_entropy_rounds", "must be non-zero");
        }
        if self.call_timeout_ms == 0 {
            return invalid("call_timeout_ms", "must be non-zero");
        }
        if self.query_timeout_ms == 0 {
            return invalid("query_timeout_ms", "must be non-zero");
        }
        if self.forward_attempts == 0 {
            return invalid("forward_attempts", "must be at least 1");
        }
        if self.suspect_after == Some(0) {
            return invalid("suspect_after", "must be at least 1 when set");
        }
        if let PlacementStrategy::Quorum { min_alive: 0 } = self.placement {
            return invalid("placement", "quorum needs at least one member");
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}
