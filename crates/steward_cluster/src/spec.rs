//! Worker specifications.

use serde::{Deserialize, Serialize};
use steward_core::ChildId;
use steward_runtime::{ExitReason, ShutdownBudget, StartDescriptor};

/// What kind of child this is. Reported by queries only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChildKind {
    /// Plain worker
    #[default]
    Worker,
    /// Nested supervisor
    Supervisor,
}

/// When a child is restarted after it exits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    /// Always restart
    #[default]
    Permanent,
    /// Restart only after an abnormal exit
    Transient,
    /// Never restart
    Temporary,
}

impl RestartPolicy {
    /// Whether an exit with `reason` leads to a restart
    #[must_use]
    pub fn restarts_after(&self, reason: &ExitReason) -> bool {
        match self {
            Self::Permanent => true,
            Self::Transient => reason.is_abnormal(),
            Self::Temporary => false,
        }
    }

    /// Whether the child survives the loss of its member
    #[must_use]
    pub fn survives_failover(&self) -> bool {
        self.restarts_after(&ExitReason::Killed)
    }
}

/// Complete description of a supervised child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Cluster-unique id
    pub id: ChildId,
    /// What to run
    pub start: StartDescriptor,
    /// Worker or nested supervisor
    #[serde(default)]
    pub kind: ChildKind,
    /// Time allowed to stop
    #[serde(default)]
    pub shutdown: ShutdownBudget,
    /// Restart policy
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl WorkerSpec {
    /// Create a permanent worker with the default shutdown budget
    #[must_use]
    pub fn new(id: impl Into<ChildId>, start: StartDescriptor) -> Self {
        Self {
            id: id.into(),
            start,
            kind: ChildKind::default(),
            shutdown: ShutdownBudget::default(),
            restart: RestartPolicy::default(),
        }
    }

    /// Set kind
    #[must_use]
    pub fn with_kind(mut self, kind: ChildKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set shutdown budget
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownBudget) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Set restart policy
    #[must_use]
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_spec_defaults() {
        let spec = WorkerSpec::new("job", StartDescriptor::new("idle"));
        assert_eq!(spec.id, ChildId::from("job"));
        assert_eq!(spec.kind, ChildKind::Worker);
        assert_eq!(spec.restart, RestartPolicy::Permanent);
        assert_eq!(spec.shutdown, ShutdownBudget::Timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_restart_policy() {
        let crash = ExitReason::Abnormal("boom".to_string());

        assert!(RestartPolicy::Permanent.restarts_after(&ExitReason::Normal));
        assert!(RestartPolicy::Permanent.restarts_after(&crash));

        assert!(!RestartPolicy::Transient.restarts_after(&ExitReason::Normal));
        assert!(!RestartPolicy::Transient.restarts_after(&ExitReason::Shutdown));
        assert!(RestartPolicy::Transient.restarts_after(&crash));

        assert!(!RestartPolicy::Temporary.restarts_after(&crash));
    }

    #[test]
    fn test_failover_survival() {
        assert!(RestartPolicy::Permanent.survives_failover());
        assert!(RestartPolicy::Transient.survives_failover());
        assert!(!RestartPolicy::Temporary.survives_failover());
    }

    #[test]
    fn test_spec_json_defaults() {
        let spec: WorkerSpec =
            serde_json::from_str(r#"{"id":"job","start":{"entry":"idle"}}"#).unwrap();
        assert_eq!(spec, WorkerSpec::new("job", StartDescriptor::new("idle")));
    }

    #[test]
    fn test_spec_builders() {
        let spec = WorkerSpec::new("sup", StartDescriptor::new("tree"))
            .with_kind(ChildKind::Supervisor)
            .with_shutdown(ShutdownBudget::Infinity)
            .with_restart(RestartPolicy::Transient);
        assert_eq!(spec.kind, ChildKind::Supervisor);
        assert_eq!(spec.shutdown, ShutdownBudget::Infinity);
        assert_eq!(spec.restart, RestartPolicy::Transient);
    }
}
